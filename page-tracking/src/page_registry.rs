// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use alloc::vec::Vec;
use arm_pages::{PageSize, PageState, PhysPfn, PAGE_SHIFT};
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::mem_map::{MemoryMap, MAX_MEM_REGIONS};

/// Per-page metadata for every 4kB page of RAM.
///
/// Each field is only written with the lock of the principal that owns the state it describes
/// held: `host_state` and `host_share_guest_count` under the host lock, `refcount` under the lock
/// of whichever principal is pinning or allocating the page. The fields are atomics so the registry
/// itself can be shared without a lock of its own.
#[derive(Debug, Default)]
pub struct HypPage {
    host_state: AtomicU32,
    refcount: AtomicU16,
    order: AtomicU8,
    host_share_guest_count: AtomicU32,
}

impl HypPage {
    /// Returns the state of the page as seen by the host.
    pub fn host_state(&self) -> PageState {
        PageState::from_bits_retain(self.host_state.load(Ordering::Relaxed))
    }

    /// Records the state of the page as seen by the host.
    pub fn set_host_state(&self, state: PageState) {
        self.host_state.store(state.bits(), Ordering::Relaxed);
    }

    /// Returns the number of references held on the page.
    pub fn refcount(&self) -> u16 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Takes a reference on the page.
    pub fn ref_inc(&self) {
        let old = self.refcount.fetch_add(1, Ordering::Relaxed);
        assert!(old != u16::MAX, "page refcount overflow");
    }

    /// Drops a reference on the page and returns true if it was the last one.
    pub fn ref_dec_and_test(&self) -> bool {
        let old = self.refcount.fetch_sub(1, Ordering::Relaxed);
        assert!(old != 0, "page refcount underflow");
        old == 1
    }

    /// Drops a reference on the page.
    pub fn ref_dec(&self) {
        self.ref_dec_and_test();
    }

    /// Marks a free page as allocated with a single reference.
    pub fn set_refcounted(&self) {
        let old = self.refcount.swap(1, Ordering::Relaxed);
        assert!(old == 0, "allocating a page that is still referenced");
    }

    /// Returns the allocation order of the page.
    pub fn order(&self) -> u8 {
        self.order.load(Ordering::Relaxed)
    }

    /// Sets the allocation order of the page.
    pub fn set_order(&self, order: u8) {
        self.order.store(order, Ordering::Relaxed);
    }

    /// Returns the number of guests the host currently shares this page with.
    pub fn share_guest_count(&self) -> u32 {
        self.host_share_guest_count.load(Ordering::Relaxed)
    }

    /// Increments the guest share count.
    pub fn inc_share_guest_count(&self) {
        self.host_share_guest_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the guest share count, returning the new count.
    pub fn dec_share_guest_count(&self) -> u32 {
        let old = self.host_share_guest_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old != 0, "guest share count underflow");
        old - 1
    }
}

/// Maps a contiguous range of RAM to a slice of the page array.
#[derive(Debug, Clone, Copy)]
struct SparseMapEntry {
    base_pfn: u64,
    num_pages: u64,
    index: usize,
}

struct RegistryInner {
    spans: ArrayVec<SparseMapEntry, MAX_MEM_REGIONS>,
    pages: Vec<HypPage>,
}

/// Keeps a `HypPage` for every page of RAM in the system. Cheap to clone; all clones refer to the
/// same pages.
#[derive(Clone)]
pub struct PageRegistry {
    inner: Arc<RegistryInner>,
}

impl PageRegistry {
    /// Builds a registry covering every region of `mem_map`. All pages start out host-owned.
    pub fn new(mem_map: &MemoryMap) -> Self {
        let mut spans = ArrayVec::new();
        let mut index = 0;
        for region in mem_map.regions() {
            let num_pages = region.size() / PageSize::Size4k as u64;
            // Can't overflow: the map holds at most `MAX_MEM_REGIONS` regions.
            spans.push(SparseMapEntry {
                base_pfn: region.base() >> PAGE_SHIFT,
                num_pages,
                index,
            });
            index += num_pages as usize;
        }
        let mut pages = Vec::with_capacity(index);
        pages.resize_with(index, HypPage::default);
        Self {
            inner: Arc::new(RegistryInner { spans, pages }),
        }
    }

    /// Returns the metadata for the page `pfn`, or `None` if it isn't RAM.
    pub fn get(&self, pfn: PhysPfn) -> Option<&HypPage> {
        let pfn = pfn.bits();
        let span = self
            .inner
            .spans
            .iter()
            .find(|s| s.base_pfn <= pfn && pfn < s.base_pfn + s.num_pages)?;
        self.inner
            .pages
            .get(span.index + (pfn - span.base_pfn) as usize)
    }

    /// Returns the metadata for the page containing the physical address `addr`.
    pub fn get_by_addr(&self, addr: u64) -> Option<&HypPage> {
        self.get(PhysPfn::phys(addr >> PAGE_SHIFT))
    }

    /// Returns an iterator over the pages covering `[start, end)`. Yields `None` for any page that
    /// isn't RAM.
    pub fn range(&self, start: u64, end: u64) -> impl Iterator<Item = Option<&HypPage>> + '_ {
        let first = start >> PAGE_SHIFT;
        let last = PageSize::Size4k.round_up(end) >> PAGE_SHIFT;
        (first..last).map(move |pfn| self.get(PhysPfn::phys(pfn)))
    }

    /// Returns the number of tracked pages.
    pub fn num_pages(&self) -> usize {
        self.inner.pages.len()
    }
}
