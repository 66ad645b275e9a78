// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Balloon deflation: returning pages to the guest at the host's request.

use crate::connection::DmConnection;
use crate::pages::GuestPages;
use crate::transport::Transport;
use crate::worker::WorkerState;
use hyperv_dm_protocol as protocol;
use protocol::MessageType;

impl<G: GuestPages> WorkerState<G> {
    /// Frees every tracked page covered by `ranges`.
    ///
    /// A request split across several messages is answered once, after the
    /// message without `more_pages`.
    pub(crate) async fn handle_deflation<T: Transport>(
        &mut self,
        conn: &mut DmConnection<T>,
        ranges: &[protocol::PageRange],
        more_pages: bool,
    ) {
        self.stats.deflation_requests += 1;

        let mut freed = 0u64;
        let mut misses = 0u64;
        let mut first_miss = None;
        for range in ranges {
            let found = self.balloon.remove_range(range.pages());
            let missing = u64::from(range.page_count()) - found.len() as u64;
            for page in found {
                self.pages.free_page(page);
                freed += 1;
            }
            if missing > 0 {
                misses += missing;
                first_miss.get_or_insert(range.start_page());
            }
        }
        self.stats.deflated_pages += freed;
        self.stats.deflation_misses += misses;

        if let Some(pfn) = first_miss {
            tracing::warn!(
                misses,
                range_start = pfn,
                "host asked to deflate pages not in the balloon"
            );
        }
        tracing::debug!(
            ranges = ranges.len(),
            freed,
            more_pages,
            "deflated balloon"
        );

        if more_pages {
            return;
        }

        if let Err(err) = conn.send(MessageType::DEFLATION_RESPONSE, &[]).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to send deflation response"
            );
        }
    }
}
