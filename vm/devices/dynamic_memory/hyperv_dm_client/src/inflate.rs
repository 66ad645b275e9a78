// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Balloon inflation: surrendering guest pages to the host.
//!
//! Pages are allocated one at a time. Only single-page physical contiguity
//! can be relied on, so every reported range covers exactly one page. The
//! pages are reported in batches of at most
//! [`DynamicMemoryConfig::inflation_batch_pages`](crate::DynamicMemoryConfig)
//! ranges; every batch but the last has `more_pages` set.

use crate::balloon::clamp_inflation;
use crate::connection::DmConnection;
use crate::pages::GuestPages;
use crate::transport::Transport;
use crate::worker::WorkerState;
use hyperv_dm_protocol as protocol;
use protocol::MessageType;
use zerocopy::IntoBytes;

/// How a batch send ended.
enum BatchOutcome {
    Sent,
    GaveUp,
}

impl<G: GuestPages> WorkerState<G> {
    pub(crate) async fn handle_inflation<T: Transport>(
        &mut self,
        conn: &mut DmConnection<T>,
        requested: u32,
    ) {
        self.stats.inflation_requests += 1;

        let available = self.snapshot().available_pages;
        let target = clamp_inflation(
            u64::from(requested),
            available,
            self.config.reserved_floor_pages,
        );
        if target < u64::from(requested) {
            tracing::debug!(
                requested,
                target,
                available,
                floor = self.config.reserved_floor_pages,
                "clamped inflation request"
            );
        }
        tracing::debug!(target, "inflating balloon");

        let batch_limit = u64::from(self.config.inflation_batch_pages);
        let mut remaining = target;
        let mut inflated = 0;
        let mut batches_sent = 0;
        let mut batch = Vec::with_capacity(self.config.inflation_batch_pages as usize);
        loop {
            let chunk = remaining.min(batch_limit);
            batch.clear();
            let exhausted = self.allocate_batch(chunk, &mut batch);
            remaining -= chunk;
            let last = exhausted || remaining == 0;

            match self.send_batch(conn, &batch, !last).await {
                BatchOutcome::Sent => {
                    batches_sent += 1;
                    inflated += batch.len() as u64;
                    self.stats.inflated_pages += batch.len() as u64;
                }
                BatchOutcome::GaveUp => {
                    // The host never learned of these pages.
                    for range in &batch {
                        if let Some(page) = self.balloon.remove(range.start_page()) {
                            self.pages.free_page(page);
                        }
                    }
                    self.stats.abandoned_batches += 1;
                    if batches_sent > 0 {
                        // The host has seen `more_pages` and is waiting for
                        // the end of the transfer.
                        self.terminate_inflation(conn).await;
                    }
                    return;
                }
            }

            if last {
                if exhausted {
                    tracing::info!(
                        requested,
                        inflated,
                        "guest ran out of pages to surrender"
                    );
                }
                break;
            }
        }
    }

    /// Ends an inflation transfer cut short by send failures with an empty
    /// final batch. If that cannot be sent either, it is left pending for
    /// [`flush_inflation_end`](Self::flush_inflation_end).
    async fn terminate_inflation<T: Transport>(&mut self, conn: &mut DmConnection<T>) {
        match self.send_batch(conn, &[], false).await {
            BatchOutcome::Sent => self.inflation_end_pending = false,
            BatchOutcome::GaveUp => {
                tracing::error!("inflation transfer left open");
                self.inflation_end_pending = true;
            }
        }
    }

    /// Sends a pending end of an earlier inflation transfer, before any
    /// other outbound traffic.
    pub(crate) async fn flush_inflation_end<T: Transport>(
        &mut self,
        conn: &mut DmConnection<T>,
    ) {
        if self.inflation_end_pending {
            self.terminate_inflation(conn).await;
        }
    }

    /// Allocates up to `count` pages into the balloon, appending a range for
    /// each to `batch`. Returns `true` if allocation stopped early.
    fn allocate_batch(&mut self, count: u64, batch: &mut Vec<protocol::PageRange>) -> bool {
        for _ in 0..count {
            let Some(page) = self.pages.allocate_page() else {
                tracing::debug!(allocated = batch.len(), count, "page allocation failed");
                return true;
            };
            let pfn = self.pages.page_frame_number(&page);
            let Some(range) = protocol::PageRange::from_parts(pfn, 1) else {
                tracing::warn!(pfn, "page frame number does not fit a page range");
                self.pages.free_page(page);
                return true;
            };
            if let Err(page) = self.balloon.insert(pfn, page) {
                tracing::error!(pfn, "allocator returned a page already in the balloon");
                self.pages.free_page(page);
                return true;
            }
            batch.push(range);
        }
        false
    }

    async fn send_batch<T: Transport>(
        &mut self,
        conn: &mut DmConnection<T>,
        batch: &[protocol::PageRange],
        more_pages: bool,
    ) -> BatchOutcome {
        let header = protocol::InflationResponse {
            reserved: 0,
            count: protocol::RangeCount::new()
                .with_more_pages(more_pages)
                .with_range_count(batch.len() as u32),
        };
        let transaction_id = match conn.frame(
            MessageType::INFLATION_RESPONSE,
            &[header.as_bytes(), batch.as_bytes()],
        ) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to frame inflation response"
                );
                return BatchOutcome::GaveUp;
            }
        };

        let policy = &self.config.send_retry;
        let mut failures = 0;
        loop {
            match conn.send_framed().await {
                Ok(()) => {
                    tracing::trace!(
                        transaction_id,
                        ranges = batch.len(),
                        more_pages,
                        "sent inflation response"
                    );
                    return BatchOutcome::Sent;
                }
                Err(err) => {
                    failures += 1;
                    if !policy.should_retry(failures) {
                        tracing::error!(
                            error = &err as &dyn std::error::Error,
                            failures,
                            pages = batch.len(),
                            "giving up on inflation response"
                        );
                        return BatchOutcome::GaveUp;
                    }
                    self.stats.send_retries += 1;
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        failures,
                        "failed to send inflation response, retrying"
                    );
                    tokio::time::sleep(policy.backoff(failures)).await;
                }
            }
        }
    }
}
