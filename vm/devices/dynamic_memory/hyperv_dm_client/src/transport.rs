// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The channel the dynamic memory client speaks over.

pub mod loopback;

use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel is closed")]
    Closed,
    #[error("packet of {len} bytes exceeds the {max} byte limit")]
    PacketTooLarge { len: usize, max: usize },
    #[error("transport failure")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A bidirectional, packet-oriented channel to the host.
///
/// Framing and delivery are the transport's business. The client only
/// exchanges complete dynamic memory messages.
#[async_trait]
pub trait Transport: Send {
    /// Opens the channel with ring buffers of the given sizes.
    async fn open(
        &mut self,
        send_buffer_size: usize,
        recv_buffer_size: usize,
    ) -> Result<(), TransportError>;

    /// Sends one packet without waiting for any reply.
    async fn send(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next inbound packet and copies it into `buf`, returning
    /// its length. The length of `buf` is the largest packet accepted.
    ///
    /// This must be cancel safe: dropping the returned future before it
    /// completes must not lose a packet.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Closes the channel. Further sends and receives fail.
    async fn close(&mut self);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn open(
        &mut self,
        send_buffer_size: usize,
        recv_buffer_size: usize,
    ) -> Result<(), TransportError> {
        (**self).open(send_buffer_size, recv_buffer_size).await
    }

    async fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        (**self).send(packet).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).recv(buf).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}
