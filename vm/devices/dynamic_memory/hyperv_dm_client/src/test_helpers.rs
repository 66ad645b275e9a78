// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A simulated guest page allocator for tests and simulations.

use crate::pages::GuestPages;
use crate::pages::MemoryCounters;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;

/// The first page frame number handed out by [`SimulatedGuestPages`].
pub const FIRST_PFN: u64 = 0x10000;

/// A guest with a fixed pool of free pages.
///
/// Clones share state, so a test can keep one handle to observe and
/// perturb the allocator after handing another to the client.
#[derive(Clone)]
pub struct SimulatedGuestPages(Arc<Mutex<SimulatedState>>);

struct SimulatedState {
    total_pages: u64,
    pool: VecDeque<u64>,
    allocated: BTreeSet<u64>,
    freed: Vec<u64>,
    purgeable: u64,
    file_backed: u64,
    /// Allocations left before every further allocation fails.
    allocations_left: Option<u64>,
}

/// A page withheld by [`SimulatedGuestPages`].
#[derive(Debug)]
pub struct SimulatedPage {
    pfn: u64,
}

impl SimulatedGuestPages {
    /// Creates a guest of `total_pages` pages, `free_pages` of which can be
    /// allocated, starting at [`FIRST_PFN`].
    pub fn new(total_pages: u64, free_pages: u64) -> Self {
        Self(Arc::new(Mutex::new(SimulatedState {
            total_pages,
            pool: (FIRST_PFN..FIRST_PFN + free_pages).collect(),
            allocated: BTreeSet::new(),
            freed: Vec::new(),
            purgeable: 0,
            file_backed: 0,
            allocations_left: None,
        })))
    }

    /// Lets `count` more allocations succeed, then fails the rest.
    pub fn fail_after(&self, count: u64) {
        self.0.lock().allocations_left = Some(count);
    }

    /// Removes any allocation failure set by [`fail_after`](Self::fail_after).
    pub fn allow_allocations(&self) {
        self.0.lock().allocations_left = None;
    }

    pub fn set_purgeable(&self, pages: u64) {
        self.0.lock().purgeable = pages;
    }

    pub fn set_file_backed(&self, pages: u64) {
        self.0.lock().file_backed = pages;
    }

    /// Returns the PFNs currently allocated, in ascending order.
    pub fn allocated(&self) -> Vec<u64> {
        self.0.lock().allocated.iter().copied().collect()
    }

    /// Returns every PFN freed so far, in the order freed.
    pub fn freed(&self) -> Vec<u64> {
        self.0.lock().freed.clone()
    }

    /// Returns the number of pages that can still be allocated.
    pub fn free_pages(&self) -> u64 {
        self.0.lock().pool.len() as u64
    }
}

impl GuestPages for SimulatedGuestPages {
    type Page = SimulatedPage;

    fn allocate_page(&mut self) -> Option<SimulatedPage> {
        let mut state = self.0.lock();
        if let Some(left) = &mut state.allocations_left {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }
        let pfn = state.pool.pop_front()?;
        state.allocated.insert(pfn);
        Some(SimulatedPage { pfn })
    }

    fn page_frame_number(&self, page: &SimulatedPage) -> u64 {
        page.pfn
    }

    fn free_page(&mut self, page: SimulatedPage) {
        let mut state = self.0.lock();
        assert!(
            state.allocated.remove(&page.pfn),
            "freed unallocated pfn {:#x}",
            page.pfn
        );
        state.freed.push(page.pfn);
        state.pool.push_back(page.pfn);
    }

    fn total_pages(&self) -> u64 {
        self.0.lock().total_pages
    }

    fn counters(&self) -> MemoryCounters {
        let state = self.0.lock();
        MemoryCounters {
            free: state.pool.len() as u64,
            purgeable: state.purgeable,
            file_backed: state.file_backed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free() {
        let mut pages = SimulatedGuestPages::new(100, 3);
        let observer = pages.clone();
        let a = pages.allocate_page().unwrap();
        let b = pages.allocate_page().unwrap();
        assert_eq!(pages.page_frame_number(&a), FIRST_PFN);
        assert_eq!(observer.allocated(), [FIRST_PFN, FIRST_PFN + 1]);
        assert_eq!(observer.counters().free, 1);

        pages.free_page(b);
        assert_eq!(observer.freed(), [FIRST_PFN + 1]);
        assert_eq!(observer.free_pages(), 2);
        pages.free_page(a);
        assert!(observer.allocated().is_empty());
    }

    #[test]
    fn injected_failure() {
        let mut pages = SimulatedGuestPages::new(10, 10);
        pages.fail_after(1);
        assert!(pages.allocate_page().is_some());
        assert!(pages.allocate_page().is_none());
        pages.allow_allocations();
        assert!(pages.allocate_page().is_some());
    }

    #[test]
    fn pool_exhaustion() {
        let mut pages = SimulatedGuestPages::new(10, 1);
        let _page = pages.allocate_page().unwrap();
        assert!(pages.allocate_page().is_none());
    }
}
