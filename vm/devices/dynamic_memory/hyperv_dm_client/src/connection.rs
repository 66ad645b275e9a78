// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Message framing and request/response exchanges over a [`Transport`].

use crate::correlator::TransactionBusy;
use crate::correlator::TransactionCorrelator;
use crate::transport::Transport;
use crate::transport::TransportError;
use hyperv_dm_protocol as protocol;
use protocol::MessageHeader;
use protocol::MessageType;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Hands out transaction IDs. Wraps at `u32::MAX`.
#[derive(Debug, Default)]
pub struct TransactionIds(AtomicU32);

impl TransactionIds {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

#[derive(Debug, Error)]
pub enum TransactError {
    #[error("transport failure")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Busy(#[from] TransactionBusy),
    #[error("no {0:?} received within {1:?}")]
    Timeout(MessageType, Duration),
    #[error("message of {0} bytes does not fit in a packet")]
    TooLarge(usize),
    #[error("response body of {0} bytes has the wrong size")]
    BadResponse(usize),
}

/// An inbound message split into its header and body.
pub struct Message<'a> {
    pub header: MessageHeader,
    pub body: &'a [u8],
}

#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("packet of {0} bytes is smaller than a message header")]
    TooSmall(usize),
    #[error("header size {size} is out of range for a {len} byte packet")]
    BadSize { size: u16, len: usize },
}

/// Splits a raw packet into a [`Message`].
pub fn parse_message(packet: &[u8]) -> Result<Message<'_>, MalformedMessage> {
    let (header, _) = MessageHeader::read_from_prefix(packet)
        .map_err(|_| MalformedMessage::TooSmall(packet.len()))?;
    let size = header.size as usize;
    if size < protocol::HEADER_SIZE || size > packet.len() {
        return Err(MalformedMessage::BadSize {
            size: header.size,
            len: packet.len(),
        });
    }
    Ok(Message {
        header,
        body: &packet[protocol::HEADER_SIZE..size],
    })
}

pub struct DmConnection<T> {
    transport: T,
    correlator: TransactionCorrelator,
    transaction_ids: TransactionIds,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    max_packet_size: usize,
    transaction_timeout: Duration,
}

impl<T: Transport> DmConnection<T> {
    pub fn new(transport: T, max_packet_size: usize, transaction_timeout: Duration) -> Self {
        Self {
            transport,
            correlator: TransactionCorrelator::new(),
            transaction_ids: TransactionIds::default(),
            recv_buf: vec![0; max_packet_size],
            send_buf: Vec::with_capacity(max_packet_size),
            max_packet_size,
            transaction_timeout,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn correlator_mut(&mut self) -> &mut TransactionCorrelator {
        &mut self.correlator
    }

    /// Frames `payload` behind a header with a fresh transaction ID into the
    /// send buffer, returning the transaction ID.
    pub fn frame(
        &mut self,
        message_type: MessageType,
        payload: &[&[u8]],
    ) -> Result<u32, TransactError> {
        let size = protocol::HEADER_SIZE + payload.iter().map(|p| p.len()).sum::<usize>();
        if size > self.max_packet_size || size > u16::MAX as usize {
            return Err(TransactError::TooLarge(size));
        }
        let transaction_id = self.transaction_ids.next();
        let header = MessageHeader {
            message_type,
            size: size as u16,
            transaction_id,
        };
        self.send_buf.clear();
        self.send_buf.extend_from_slice(header.as_bytes());
        for p in payload {
            self.send_buf.extend_from_slice(p);
        }
        Ok(transaction_id)
    }

    /// Sends the most recently framed message again.
    pub async fn send_framed(&mut self) -> Result<(), TransportError> {
        self.transport.send(&self.send_buf).await
    }

    /// Sends a message that expects no reply.
    pub async fn send(
        &mut self,
        message_type: MessageType,
        payload: &[&[u8]],
    ) -> Result<(), TransactError> {
        let transaction_id = self.frame(message_type, payload)?;
        tracing::trace!(?message_type, transaction_id, "sending message");
        self.send_framed().await?;
        Ok(())
    }

    /// Waits for the next inbound packet, returning its length. The packet
    /// is left in the receive buffer.
    ///
    /// Cancel safe if the transport is.
    pub async fn recv(&mut self) -> Result<usize, TransportError> {
        self.transport.recv(&mut self.recv_buf).await
    }

    pub fn packet(&self, len: usize) -> &[u8] {
        &self.recv_buf[..len]
    }

    /// Sends `request` and waits for the correlated `R` response.
    ///
    /// Inbound traffic that does not complete the transaction is logged and
    /// dropped. Only used before the worker starts, so nothing else is
    /// consuming inbound packets.
    pub async fn transact<S, R>(
        &mut self,
        message_type: MessageType,
        request: &S,
        response_type: MessageType,
    ) -> Result<R, TransactError>
    where
        S: IntoBytes + Immutable,
        R: FromBytes + KnownLayout + Immutable,
    {
        let transaction_id = self.frame(message_type, &[request.as_bytes()])?;
        let mut reply = self
            .correlator
            .register(transaction_id, size_of::<R>())?;

        tracing::debug!(?message_type, transaction_id, "sending request");
        if let Err(err) = self.send_framed().await {
            self.correlator.abandon();
            return Err(err.into());
        }

        let transaction_timeout = self.transaction_timeout;
        let wait = async {
            loop {
                let len = self.transport.recv(&mut self.recv_buf).await?;
                match parse_message(&self.recv_buf[..len]) {
                    Ok(message) if message.header.message_type == response_type => {
                        self.correlator
                            .on_response(message.header.transaction_id, message.body);
                    }
                    Ok(message) => {
                        tracing::debug!(
                            message_type = ?message.header.message_type,
                            transaction_id = message.header.transaction_id,
                            "ignoring message while awaiting response"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "dropping malformed packet"
                        );
                    }
                }
                if let Ok(Some(buf)) = reply.try_recv() {
                    break Ok::<_, TransportError>(buf);
                }
            }
        };

        let buf = match tokio::time::timeout(transaction_timeout, wait).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(err)) => {
                self.correlator.abandon();
                return Err(err.into());
            }
            Err(_) => {
                self.correlator.abandon();
                return Err(TransactError::Timeout(response_type, transaction_timeout));
            }
        };
        R::read_from_bytes(&buf).map_err(|_| TransactError::BadResponse(buf.len()))
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback;

    #[test]
    fn transaction_ids_wrap() {
        let ids = TransactionIds(AtomicU32::new(u32::MAX - 1));
        assert_eq!(ids.next(), u32::MAX);
        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn parse_rejects_bad_sizes() {
        assert!(matches!(
            parse_message(&[0; 4]),
            Err(MalformedMessage::TooSmall(4))
        ));

        let mut packet = MessageHeader {
            message_type: MessageType::INFLATION_REQUEST,
            size: 32,
            transaction_id: 0,
        }
        .as_bytes()
        .to_vec();
        packet.extend_from_slice(&[0; 8]);
        assert!(matches!(
            parse_message(&packet),
            Err(MalformedMessage::BadSize { size: 32, len: 16 })
        ));

        packet[2] = 4;
        assert!(matches!(
            parse_message(&packet),
            Err(MalformedMessage::BadSize { size: 4, len: 16 })
        ));

        // Trailing bytes beyond the header size are not part of the body.
        packet[2] = 12;
        let message = parse_message(&packet).unwrap();
        assert_eq!(message.body.len(), 4);
    }

    #[tokio::test]
    async fn frame_rejects_oversized() {
        let (guest, _host) = loopback::connected(64);
        let mut conn = DmConnection::new(guest, 64, Duration::from_secs(1));
        let big = [0; 64];
        assert!(matches!(
            conn.send(MessageType::STATUS_REPORT, &[&big]).await,
            Err(TransactError::TooLarge(72))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transact_times_out() {
        let (guest, mut host) = loopback::connected(64);
        let mut conn = DmConnection::new(guest, 64, Duration::from_secs(1));
        let request = protocol::InflationRequest {
            page_count: 0,
            reserved: 0,
        };
        let err = conn
            .transact::<_, protocol::VersionResponse>(
                MessageType::VERSION_REQUEST,
                &request,
                MessageType::VERSION_RESPONSE,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransactError::Timeout(MessageType::VERSION_RESPONSE, _)));
        assert!(!conn.correlator_mut().is_pending());
        assert!(host.try_recv_packet().is_some());
    }
}
