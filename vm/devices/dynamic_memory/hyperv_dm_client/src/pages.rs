// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to guest physical memory.

/// Instantaneous guest memory counters, in pages.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    /// Pages not in use at all.
    pub free: u64,
    /// Pages the guest can discard on demand.
    pub purgeable: u64,
    /// Pages caching externally mapped files.
    pub file_backed: u64,
}

/// The guest's physical page allocator and memory statistics.
///
/// Pages returned by [`allocate_page`](Self::allocate_page) are withheld
/// from general guest use until passed back to
/// [`free_page`](Self::free_page).
pub trait GuestPages: Send {
    /// A single withheld, physically contiguous page.
    type Page: Send;

    /// Allocates one page, or returns `None` if the guest cannot spare one.
    fn allocate_page(&mut self) -> Option<Self::Page>;

    /// Returns the page frame number of `page`.
    fn page_frame_number(&self, page: &Self::Page) -> u64;

    /// Returns `page` to general guest use.
    fn free_page(&mut self, page: Self::Page);

    /// Returns the total number of physical pages in the guest.
    fn total_pages(&self) -> u64;

    /// Returns the current memory counters.
    fn counters(&self) -> MemoryCounters;
}
