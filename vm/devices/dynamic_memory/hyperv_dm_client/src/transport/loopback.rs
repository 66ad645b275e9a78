// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory [`Transport`] pair, for tests and simulations.

use super::Transport;
use super::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Returns two connected transports. Packets sent on one are received on the
/// other. Packets larger than `max_packet_size` are rejected at send time.
pub fn connected(max_packet_size: usize) -> (LoopbackTransport, LoopbackTransport) {
    let (a_send, a_recv) = mpsc::unbounded_channel();
    let (b_send, b_recv) = mpsc::unbounded_channel();
    let a = LoopbackTransport {
        send: Some(a_send),
        recv: b_recv,
        max_packet_size,
        control: LoopbackControl::default(),
    };
    let b = LoopbackTransport {
        send: Some(b_send),
        recv: a_recv,
        max_packet_size,
        control: LoopbackControl::default(),
    };
    (a, b)
}

/// One end of a loopback channel.
pub struct LoopbackTransport {
    send: Option<mpsc::UnboundedSender<Vec<u8>>>,
    recv: mpsc::UnboundedReceiver<Vec<u8>>,
    max_packet_size: usize,
    control: LoopbackControl,
}

/// A handle for observing and perturbing a [`LoopbackTransport`] after it
/// has been handed off.
#[derive(Clone, Default)]
pub struct LoopbackControl(Arc<Mutex<ControlState>>);

#[derive(Default)]
struct ControlState {
    opened: Option<(usize, usize)>,
    closed: bool,
    sends: u64,
    failed_sends: u64,
    fail_next_sends: u64,
    /// Sends let through before `fail_next_sends` takes effect.
    pass_before_failing: u64,
}

impl LoopbackControl {
    /// Makes the next `count` sends fail with [`TransportError::Failed`].
    pub fn fail_next_sends(&self, count: u64) {
        self.fail_sends_after(0, count);
    }

    /// Lets `pass` sends through, then fails the following `count`.
    pub fn fail_sends_after(&self, pass: u64, count: u64) {
        let mut state = self.0.lock();
        state.pass_before_failing = pass;
        state.fail_next_sends = count;
    }

    /// Returns the number of packets successfully sent.
    pub fn sends(&self) -> u64 {
        self.0.lock().sends
    }

    /// Returns the number of sends that failed by injection.
    pub fn failed_sends(&self) -> u64 {
        self.0.lock().failed_sends
    }

    /// Returns the buffer sizes passed to `open`, if it was called.
    pub fn opened(&self) -> Option<(usize, usize)> {
        self.0.lock().opened
    }

    /// Returns whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.0.lock().closed
    }
}

#[derive(Debug, thiserror::Error)]
#[error("injected send failure")]
struct InjectedFailure;

impl LoopbackTransport {
    /// Returns a control handle for this end.
    pub fn control(&self) -> LoopbackControl {
        self.control.clone()
    }

    /// Receives the next packet as an owned buffer.
    pub async fn recv_packet(&mut self) -> Result<Vec<u8>, TransportError> {
        self.recv.recv().await.ok_or(TransportError::Closed)
    }

    /// Returns the next packet if one is already queued.
    pub fn try_recv_packet(&mut self) -> Option<Vec<u8>> {
        self.recv.try_recv().ok()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &mut self,
        send_buffer_size: usize,
        recv_buffer_size: usize,
    ) -> Result<(), TransportError> {
        let mut state = self.control.0.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.opened = Some((send_buffer_size, recv_buffer_size));
        Ok(())
    }

    async fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if packet.len() > self.max_packet_size {
            return Err(TransportError::PacketTooLarge {
                len: packet.len(),
                max: self.max_packet_size,
            });
        }
        {
            let mut state = self.control.0.lock();
            if state.fail_next_sends > 0 && state.pass_before_failing > 0 {
                state.pass_before_failing -= 1;
            } else if state.fail_next_sends > 0 {
                state.fail_next_sends -= 1;
                state.failed_sends += 1;
                return Err(TransportError::Failed(Box::new(InjectedFailure)));
            }
        }
        self.send
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(packet.to_vec())
            .map_err(|_| TransportError::Closed)?;
        self.control.0.lock().sends += 1;
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let packet = self.recv.recv().await.ok_or(TransportError::Closed)?;
        let max = buf.len();
        let dest = buf
            .get_mut(..packet.len())
            .ok_or(TransportError::PacketTooLarge {
                len: packet.len(),
                max,
            })?;
        dest.copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn close(&mut self) {
        self.send = None;
        self.recv.close();
        self.control.0.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_cross_over() {
        let (mut a, mut b) = connected(16);
        a.send(b"hello").await.unwrap();
        let mut buf = [0; 16];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(a.control().sends(), 1);
    }

    #[tokio::test]
    async fn oversized_packets_are_rejected() {
        let (mut a, _b) = connected(4);
        assert!(matches!(
            a.send(b"hello").await,
            Err(TransportError::PacketTooLarge { len: 5, max: 4 })
        ));
    }

    #[tokio::test]
    async fn injected_failures() {
        let (mut a, mut b) = connected(16);
        a.control().fail_next_sends(2);
        assert!(a.send(b"x").await.is_err());
        assert!(a.send(b"x").await.is_err());
        a.send(b"y").await.unwrap();
        assert_eq!(b.recv_packet().await.unwrap(), b"y");
        assert_eq!(a.control().failed_sends(), 2);
    }

    #[tokio::test]
    async fn delayed_failures() {
        let (mut a, mut b) = connected(16);
        a.control().fail_sends_after(1, 1);
        a.send(b"x").await.unwrap();
        assert!(a.send(b"y").await.is_err());
        a.send(b"z").await.unwrap();
        assert_eq!(b.recv_packet().await.unwrap(), b"x");
        assert_eq!(b.recv_packet().await.unwrap(), b"z");
        assert_eq!(a.control().failed_sends(), 1);
        assert_eq!(a.control().sends(), 2);
    }

    #[tokio::test]
    async fn oversized_packets_are_rejected_on_receive() {
        let (mut a, mut b) = connected(16);
        a.send(b"hello").await.unwrap();
        let mut buf = [0; 4];
        assert!(matches!(
            b.recv(&mut buf).await,
            Err(TransportError::PacketTooLarge { len: 5, max: 4 })
        ));
    }

    #[tokio::test]
    async fn close_is_visible_to_peer() {
        let (mut a, mut b) = connected(16);
        a.close().await;
        assert!(a.control().is_closed());
        assert!(matches!(b.recv_packet().await, Err(TransportError::Closed)));
        assert!(matches!(a.send(b"x").await, Err(TransportError::Closed)));
    }
}
