// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tracking of pages withheld from the guest on behalf of the host.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::Range;

/// Pages currently in the balloon, ordered by page frame number.
pub struct BalloonPages<P> {
    pages: BTreeMap<u64, P>,
}

impl<P> Default for BalloonPages<P> {
    fn default() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }
}

impl<P> BalloonPages<P> {
    /// Records `page` under `pfn`. Returns the page back if `pfn` is already
    /// tracked.
    pub fn insert(&mut self, pfn: u64, page: P) -> Result<(), P> {
        match self.pages.entry(pfn) {
            Entry::Occupied(_) => Err(page),
            Entry::Vacant(entry) => {
                entry.insert(page);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, pfn: u64) -> Option<P> {
        self.pages.remove(&pfn)
    }

    /// Removes and returns the tracked pages within `pfns`.
    ///
    /// Costs time proportional to the pages found, not the width of the
    /// range.
    pub fn remove_range(&mut self, pfns: Range<u64>) -> Vec<P> {
        if pfns.is_empty() {
            return Vec::new();
        }
        let found: Vec<u64> = self.pages.range(pfns).map(|(&pfn, _)| pfn).collect();
        found
            .into_iter()
            .filter_map(|pfn| self.pages.remove(&pfn))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Removes and returns every tracked page.
    pub fn drain(&mut self) -> impl Iterator<Item = P> {
        std::mem::take(&mut self.pages).into_values()
    }
}

/// Returns how many of `requested` pages can be surrendered while keeping
/// `floor` pages available to the guest.
pub fn clamp_inflation(requested: u64, available: u64, floor: u64) -> u64 {
    if available >= requested.saturating_add(floor) {
        requested
    } else {
        available.saturating_sub(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_keeps_floor() {
        assert_eq!(clamp_inflation(100, 1000, 500), 100);
        assert_eq!(clamp_inflation(500, 1000, 500), 500);
        assert_eq!(clamp_inflation(600, 1000, 500), 500);
        assert_eq!(clamp_inflation(600, 400, 500), 0);
        assert_eq!(clamp_inflation(u64::MAX, 1000, 0), 1000);
        assert_eq!(clamp_inflation(0, 0, 500), 0);
    }

    #[test]
    fn duplicate_pfn_is_refused() {
        let mut pages = BalloonPages::default();
        pages.insert(5, "a").unwrap();
        assert_eq!(pages.insert(5, "b"), Err("b"));
        assert_eq!(pages.len(), 1);
        assert_eq!(pages.remove(5), Some("a"));
        assert!(pages.remove(5).is_none());
        assert!(pages.is_empty());
    }

    #[test]
    fn drain_empties() {
        let mut pages = BalloonPages::default();
        for pfn in 0..4 {
            pages.insert(pfn, pfn).unwrap();
        }
        let drained: Vec<_> = pages.drain().collect();
        assert_eq!(drained, [0, 1, 2, 3]);
        assert!(pages.is_empty());
    }

    #[test]
    fn remove_range_takes_only_covered_pages() {
        let mut pages = BalloonPages::default();
        for pfn in [3, 10, 11, 12, 40] {
            pages.insert(pfn, pfn).unwrap();
        }
        assert_eq!(pages.remove_range(10..12), [10, 11]);
        assert_eq!(pages.remove_range(12..12), [] as [u64; 0]);
        assert_eq!(pages.len(), 3);

        // A range far wider than the balloon.
        assert_eq!(pages.remove_range(0..1 << 40), [3, 12, 40]);
        assert!(pages.is_empty());
        assert!(pages.remove_range(0..u64::MAX).is_empty());
    }
}
