// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pairs responses from the host with the request awaiting them.

use futures::channel::oneshot;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("transaction {outstanding} is still outstanding")]
pub struct TransactionBusy {
    pub outstanding: u32,
}

/// Tracks the single request that is blocked awaiting a response.
#[derive(Default)]
pub struct TransactionCorrelator {
    pending: Option<PendingTransaction>,
}

struct PendingTransaction {
    transaction_id: u32,
    expected_len: usize,
    reply: oneshot::Sender<Vec<u8>>,
}

impl TransactionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request awaiting a response of `expected_len` bytes.
    ///
    /// The returned receiver resolves with exactly `expected_len` bytes once
    /// a matching response arrives. A shorter response is zero-extended.
    pub fn register(
        &mut self,
        transaction_id: u32,
        expected_len: usize,
    ) -> Result<oneshot::Receiver<Vec<u8>>, TransactionBusy> {
        if let Some(pending) = &self.pending {
            // A waiter that has gone away no longer holds the slot.
            if !pending.reply.is_canceled() {
                return Err(TransactionBusy {
                    outstanding: pending.transaction_id,
                });
            }
        }
        let (send, recv) = oneshot::channel();
        self.pending = Some(PendingTransaction {
            transaction_id,
            expected_len,
            reply: send,
        });
        Ok(recv)
    }

    /// Offers an inbound response. Returns `true` if it completed the
    /// outstanding transaction.
    pub fn on_response(&mut self, transaction_id: u32, payload: &[u8]) -> bool {
        if self
            .pending
            .as_ref()
            .is_none_or(|p| p.transaction_id != transaction_id)
        {
            tracing::debug!(
                transaction_id,
                outstanding = self.pending.as_ref().map(|p| p.transaction_id),
                "dropping uncorrelated response"
            );
            return false;
        }

        let Some(pending) = self.pending.take() else {
            return false;
        };
        let len = pending.expected_len.min(payload.len());
        if len < pending.expected_len {
            tracing::debug!(
                transaction_id,
                len = payload.len(),
                expected = pending.expected_len,
                "short response"
            );
        }
        let mut buf = vec![0; pending.expected_len];
        buf[..len].copy_from_slice(&payload[..len]);
        // The waiter may have timed out in the meantime.
        let _ = pending.reply.send(buf);
        true
    }

    /// Forgets the outstanding transaction, if any.
    pub fn abandon(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!(
                transaction_id = pending.transaction_id,
                "abandoning transaction"
            );
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_response_wakes_waiter() {
        let mut correlator = TransactionCorrelator::new();
        let mut recv = correlator.register(7, 4).unwrap();
        assert!(!correlator.on_response(8, &[1, 2, 3, 4]));
        assert!(correlator.is_pending());
        assert!(correlator.on_response(7, &[1, 2, 3, 4, 5, 6]));
        assert!(!correlator.is_pending());
        assert_eq!(recv.try_recv().unwrap().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn short_response_is_zero_extended() {
        let mut correlator = TransactionCorrelator::new();
        let mut recv = correlator.register(1, 4).unwrap();
        assert!(correlator.on_response(1, &[9]));
        assert_eq!(recv.try_recv().unwrap().unwrap(), vec![9, 0, 0, 0]);
    }

    #[test]
    fn one_transaction_at_a_time() {
        let mut correlator = TransactionCorrelator::new();
        let _recv = correlator.register(1, 4).unwrap();
        let err = correlator.register(2, 4).unwrap_err();
        assert_eq!(err.outstanding, 1);
    }

    #[test]
    fn abandoned_waiter_frees_slot() {
        let mut correlator = TransactionCorrelator::new();
        drop(correlator.register(1, 4).unwrap());
        let _recv = correlator.register(2, 4).unwrap();
        correlator.abandon();
        assert!(!correlator.is_pending());
        assert!(!correlator.on_response(2, &[0; 4]));
    }

    #[test]
    fn response_without_ticket_is_dropped() {
        let mut correlator = TransactionCorrelator::new();
        assert!(!correlator.on_response(1, &[0; 8]));
    }
}
