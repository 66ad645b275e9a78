// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory pressure reporting.

use crate::pages::MemoryCounters;
use hyperv_dm_protocol as protocol;

/// The memory pressure figures sent in one status report.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub available_pages: u64,
    pub committed_pages: u64,
}

impl StatusSnapshot {
    /// Computes a snapshot from the current counters and the (cached) total
    /// page count.
    pub fn new(counters: &MemoryCounters, total_pages: u64) -> Self {
        let available_pages = counters
            .free
            .saturating_add(counters.purgeable)
            .saturating_add(counters.file_backed);
        Self {
            available_pages,
            committed_pages: total_pages.saturating_sub(available_pages),
        }
    }

    pub fn to_report(&self) -> protocol::StatusReport {
        protocol::StatusReport {
            available_pages: self.available_pages,
            committed_pages: self.committed_pages,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sums_available() {
        let counters = MemoryCounters {
            free: 100,
            purgeable: 20,
            file_backed: 3,
        };
        let snapshot = StatusSnapshot::new(&counters, 1000);
        assert_eq!(snapshot.available_pages, 123);
        assert_eq!(snapshot.committed_pages, 877);

        let report = snapshot.to_report();
        assert_eq!(report.available_pages, 123);
        assert_eq!(report.committed_pages, 877);
        assert_eq!(report.page_file_size_in_pages, 0);
        assert_eq!(report.zero_and_free_pages, 0);
    }

    #[test]
    fn committed_never_underflows() {
        let counters = MemoryCounters {
            free: u64::MAX,
            purgeable: 1,
            file_backed: 0,
        };
        let snapshot = StatusSnapshot::new(&counters, 10);
        assert_eq!(snapshot.available_pages, u64::MAX);
        assert_eq!(snapshot.committed_pages, 0);
    }
}
