// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use arm_pages::PhysPfn;

use crate::page_registry::PageRegistry;

/// Errors from setting up a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A page handed to the pool isn't RAM.
    PageNotTracked(u64),
    /// A page handed to the pool is still referenced.
    PageInUse(u64),
    /// The pool's page range overflows.
    InvalidRange,
}

/// Holds the result of pool operations.
pub type Result<T> = core::result::Result<T, Error>;

/// A refcounted allocator of hypervisor-owned pages.
///
/// Allocated pages hold one reference; `get_page()`/`put_page()` adjust the count stored in the
/// `PageRegistry` and the page returns to the pool when it drops to zero. The pool doesn't care
/// where its pages came from: any RAM page with a zero refcount can be admitted, which is how
/// pages from a vCPU memcache end up back in a guest's pool.
pub struct HypPool {
    registry: PageRegistry,
    free: BTreeSet<u64>,
}

impl HypPool {
    /// Creates a pool over `nr_pages` pages starting at `base`. The first `reserved_pages` are
    /// considered already allocated and keep one reference each.
    pub fn new(
        registry: PageRegistry,
        base: PhysPfn,
        nr_pages: u64,
        reserved_pages: u64,
    ) -> Result<Self> {
        let end = base.bits().checked_add(nr_pages).ok_or(Error::InvalidRange)?;
        let mut free = BTreeSet::new();
        for pfn in base.bits()..end {
            let page = registry
                .get(PhysPfn::phys(pfn))
                .ok_or(Error::PageNotTracked(pfn))?;
            if pfn - base.bits() < reserved_pages {
                page.set_refcounted();
            } else {
                if page.refcount() != 0 {
                    return Err(Error::PageInUse(pfn));
                }
                free.insert(pfn);
            }
            page.set_order(0);
        }
        Ok(Self { registry, free })
    }

    /// Creates a pool that holds no pages yet.
    pub fn empty(registry: PageRegistry) -> Self {
        Self {
            registry,
            free: BTreeSet::new(),
        }
    }

    /// Allocates a single page. The caller owns the returned reference.
    pub fn alloc_page(&mut self) -> Option<PhysPfn> {
        let pfn = self.free.pop_first()?;
        self.claim(pfn, 0);
        Some(PhysPfn::phys(pfn))
    }

    /// Allocates `nr_pages` physically contiguous pages, each holding one reference.
    pub fn alloc_pages_exact(&mut self, nr_pages: u64) -> Option<PhysPfn> {
        if nr_pages == 0 {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0;
        let mut prev = None;
        for &pfn in self.free.iter() {
            if prev.map(|p: u64| p + 1) == Some(pfn) {
                run_len += 1;
            } else {
                run_start = Some(pfn);
                run_len = 1;
            }
            prev = Some(pfn);
            if run_len == nr_pages {
                break;
            }
        }
        if run_len != nr_pages {
            return None;
        }
        let start = run_start?;
        for pfn in start..start + nr_pages {
            self.free.remove(&pfn);
            self.claim(pfn, 0);
        }
        Some(PhysPfn::phys(start))
    }

    fn claim(&self, pfn: u64, order: u8) {
        // Free pages are always tracked; `new()` and `put_page()` only admit tracked pages.
        if let Some(page) = self.registry.get(PhysPfn::phys(pfn)) {
            page.set_refcounted();
            page.set_order(order);
        }
    }

    /// Takes an additional reference on an allocated page.
    pub fn get_page(&self, pfn: PhysPfn) {
        if let Some(page) = self.registry.get(pfn) {
            page.ref_inc();
        }
    }

    /// Drops a reference on a page, returning it to the pool if it was the last.
    pub fn put_page(&mut self, pfn: PhysPfn) {
        if let Some(page) = self.registry.get(pfn) {
            if page.ref_dec_and_test() {
                self.free.insert(pfn.bits());
            }
        }
    }

    /// Returns the number of references held on `pfn`.
    pub fn page_count(&self, pfn: PhysPfn) -> u16 {
        self.registry.get(pfn).map(|p| p.refcount()).unwrap_or(0)
    }

    /// Returns the number of pages available for allocation.
    pub fn free_pages(&self) -> usize {
        self.free.len()
    }

    /// Removes every free page from the pool and returns them.
    pub fn drain(&mut self) -> Vec<PhysPfn> {
        let pages = core::mem::take(&mut self.free);
        pages.into_iter().map(PhysPfn::phys).collect()
    }

    /// Returns the registry backing this pool.
    pub fn registry(&self) -> &PageRegistry {
        &self.registry
    }
}

/// Pages topped up by the host for a vCPU to pay for guest page-table growth when the guest's own
/// pool runs dry.
#[derive(Debug, Default)]
pub struct HypMemcache {
    pages: Vec<PhysPfn>,
}

impl HypMemcache {
    /// Creates an empty memcache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page to the memcache.
    pub fn push(&mut self, pfn: PhysPfn) {
        self.pages.push(pfn);
    }

    /// Takes a page out of the memcache.
    pub fn pop(&mut self) -> Option<PhysPfn> {
        self.pages.pop()
    }

    /// Returns the number of pages held.
    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    /// Removes and returns every page held.
    pub fn drain(&mut self) -> Vec<PhysPfn> {
        core::mem::take(&mut self.pages)
    }
}
