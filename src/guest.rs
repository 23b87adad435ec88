// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use arm_page_tables::{
    Entry, LeafAttrs, Level, PageTable, PageTableAllocator, PageTableError, Prot, Pte, PtePolicy,
};
use arm_pages::{PageSize, PageState, PhysPfn, PAGE_SHIFT, PAGE_SIZE};
use log::warn;
use page_tracking::{HypMemcache, HypPool, MemRange, MemoryMap};
use sync::{Mutex, MutexGuard};

use crate::{Error, Result};

// Upper bound on the entries a single guest request may walk, to bound the time spent at EL2.
const REQUEST_WALK_BUDGET: i32 = 512;

/// Returns the permissions a guest gets for memory or MMIO handed to it.
pub fn default_guest_prot(is_memory: bool) -> Prot {
    if is_memory {
        Prot::RWX
    } else {
        Prot::RW | Prot::NORMAL_NC
    }
}

/// Static description of a guest.
#[derive(Clone, Debug)]
pub struct GuestVmConfig {
    /// Width of the guest's IPA space.
    pub ia_bits: u64,
    /// Protected guests own their memory; the host can only reclaim it at teardown.
    pub protected: bool,
    /// The guest declares its MMIO ranges before touching them.
    pub mmio_guard: bool,
    /// IPA range the guest firmware is loaded into, if any.
    pub pvmfw: Option<MemRange>,
    /// Host pages donated to back the guest's stage-2 tables.
    pub pool: MemRange,
}

/// Guest stage-2 flavour: every non-empty entry, annotations included, holds a table reference.
pub struct GuestPtePolicy;

impl PtePolicy for GuestPtePolicy {
    fn pte_is_counted(&self, entry: &Entry, _level: Level) -> bool {
        *entry != Entry::Empty
    }
}

fn guest_state(entry: &Entry) -> PageState {
    match entry {
        Entry::Leaf { attrs, .. } => {
            let mut state = attrs.state;
            if attrs.prot.rwx() != Prot::RWX {
                state |= PageState::RESTRICTED_PROT;
            }
            state
        }
        Entry::MmioGuard => PageState::NOPAGE | PageState::MMIO,
        _ => PageState::NOPAGE,
    }
}

/// Allocates guest table pages from the guest's pool, then from the vCPU's memcache.
pub struct GuestAllocator<'a> {
    pool: &'a mut HypPool,
    memcache: Option<&'a mut HypMemcache>,
}

impl PageTableAllocator for GuestAllocator<'_> {
    fn zalloc_page(&mut self) -> Option<PhysPfn> {
        if let Some(pfn) = self.pool.alloc_page() {
            return Some(pfn);
        }
        let pfn = self.memcache.as_mut()?.pop()?;
        if let Some(page) = self.pool.registry().get(pfn) {
            page.set_refcounted();
            page.set_order(0);
        }
        Some(pfn)
    }

    fn zalloc_pages_exact(&mut self, nr_pages: u64) -> Option<PhysPfn> {
        self.pool.alloc_pages_exact(nr_pages)
    }

    fn get_page(&mut self, pfn: PhysPfn) {
        self.pool.get_page(pfn)
    }

    // Pages that came from the memcache join the pool once freed.
    fn put_page(&mut self, pfn: PhysPfn) {
        self.pool.put_page(pfn)
    }

    fn page_count(&self, pfn: PhysPfn) -> u16 {
        self.pool.page_count(pfn)
    }
}

/// The physically contiguous run a guest request resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestRun {
    /// Physical address backing the requested IPA.
    pub phys: u64,
    /// Attributes shared by every entry of the run.
    pub attrs: LeafAttrs,
    /// Number of pages of the request covered by the run.
    pub nr_pages: u64,
}

// How a request walk ended early.
enum WalkStop {
    Done,
    Err(Error),
}

impl From<PageTableError> for WalkStop {
    fn from(e: PageTableError) -> Self {
        WalkStop::Err(e.into())
    }
}

// What a request walk found.
struct RequestWalk {
    ipa_start: u64,
    first: Option<Entry>,
    size: u64,
}

/// A guest stage-2 table, its page pool, and a record of the pages installed by the host.
pub struct GuestStage2 {
    pgt: Option<PageTable<GuestPtePolicy>>,
    pool: HypPool,
    mappings: BTreeMap<u64, u64>,
}

impl GuestStage2 {
    fn new(ia_bits: u64, mut pool: HypPool) -> Result<Self> {
        let pgt = PageTable::new(ia_bits, true, GuestPtePolicy, &mut pool)?;
        Ok(Self {
            pgt: Some(pgt),
            pool,
            mappings: BTreeMap::new(),
        })
    }

    /// Returns the guest table, or `NotFound` once it has been destroyed.
    pub fn pgt(&self) -> Result<&PageTable<GuestPtePolicy>> {
        self.pgt.as_ref().ok_or(Error::NotFound)
    }

    fn parts<'a>(
        &'a mut self,
        memcache: Option<&'a mut HypMemcache>,
    ) -> Result<(&'a mut PageTable<GuestPtePolicy>, GuestAllocator<'a>)> {
        let pgt = self.pgt.as_mut().ok_or(Error::NotFound)?;
        let alloc = GuestAllocator {
            pool: &mut self.pool,
            memcache,
        };
        Ok((pgt, alloc))
    }

    /// Returns the number of memcache pages needed to build a full table path.
    pub fn min_memcache_pages(&self) -> Result<usize> {
        let levels = 4 - self.pgt()?.start_level().index();
        Ok(levels as usize - 1)
    }

    /// Returns the guest entry translating `ipa` and its level.
    pub fn get_leaf(&self, ipa: u64) -> Result<(Pte, Level)> {
        Ok(self.pgt()?.get_leaf(ipa)?)
    }

    /// Returns the physical address and entry of the valid leaf mapping `ipa` with exactly
    /// `PAGE_SIZE << order` bytes.
    pub fn get_valid_leaf(&self, ipa: u64, order: u32) -> Result<(u64, Entry)> {
        let size = PAGE_SIZE << order;
        if order != 0 && size != PageSize::Size2M as u64 {
            return Err(Error::InvalidArgument);
        }
        let (pte, level) = warn_on_err!(self.get_leaf(ipa))?;
        let entry = pte.decode(level);
        let phys = entry.phys().ok_or(Error::NotFound)?;
        if level.granule() != size {
            return Err(Error::TooBig);
        }
        Ok((phys, entry))
    }

    /// Checks that the guest sees every page of `[ipa, ipa + size)` in `state`.
    pub fn check_page_state_range(&self, ipa: u64, size: u64, state: PageState) -> Result<()> {
        self.pgt()?.walk_leaves::<Error, _>(ipa, size, |visit| {
            if guest_state(&visit.entry) != state {
                return Err(Error::PermissionDenied);
            }
            Ok(())
        })
    }

    // Walks the entries from `ipa` onwards while they are in `desired` state (ignoring the bits
    // outside of `mask`) and look like a single run.
    fn walk_request(
        &self,
        ipa: u64,
        nr_pages: u64,
        desired: PageState,
        mask: PageState,
    ) -> Result<RequestWalk> {
        let size = nr_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(Error::InvalidArgument)?;
        let mut walk = RequestWalk {
            ipa_start: 0,
            first: None,
            size: 0,
        };
        let mut budget = REQUEST_WALK_BUDGET;
        let res = self.pgt()?.walk_leaves::<WalkStop, _>(ipa, size, |visit| {
            let state = guest_state(&visit.entry);
            if state & mask != desired {
                return Err(WalkStop::Err(if state.contains(PageState::NOPAGE) {
                    Error::Fault
                } else {
                    Error::PermissionDenied
                }));
            }
            budget -= 1;
            match walk.first {
                None => {
                    walk.first = Some(visit.entry);
                    walk.size = visit.granule();
                    walk.ipa_start = visit.entry_base();
                }
                Some(first) => {
                    if visit.entry.prot() != first.prot() {
                        return Err(WalkStop::Err(Error::InvalidArgument));
                    }
                    // Only physically contiguous mappings make up a run.
                    if let Some(phys) = first.phys() {
                        if visit.entry.phys() != Some(phys + walk.size) {
                            return Err(WalkStop::Done);
                        }
                    }
                    walk.size += visit.granule();
                }
            }
            budget -= 1;
            if budget > 0 {
                Ok(())
            } else {
                Err(WalkStop::Done)
            }
        });
        match res {
            Ok(()) | Err(WalkStop::Done) => Ok(walk),
            Err(WalkStop::Err(e)) => Err(e),
        }
    }

    /// Resolves a guest request to change the state of `nr_pages` pages from `ipa`, all currently
    /// in `desired` state, to the largest run that can be transitioned in one go.
    pub fn request_page_transition(
        &self,
        mem_map: &MemoryMap,
        ipa: u64,
        nr_pages: u64,
        desired: PageState,
        memcache_pages: usize,
    ) -> Result<GuestRun> {
        let walk = self.walk_request(ipa, nr_pages, desired, PageState::all())?;
        let Some(Entry::Leaf { phys, attrs, .. }) = walk.first else {
            warn!("guest request at {ipa:#x} found no mapping");
            return Err(Error::InvalidArgument);
        };
        if !mem_map.range_is_allowed_memory(phys, phys + walk.size) {
            return Err(Error::InvalidArgument);
        }
        if walk.ipa_start > ipa {
            return Err(Error::InvalidArgument);
        }
        // Transitions that don't line up with the mapping will need the block broken down.
        let offset = ipa - walk.ipa_start;
        if (offset != 0 || nr_pages * PAGE_SIZE < walk.size)
            && memcache_pages < self.min_memcache_pages()?
        {
            return Err(Error::TooBig);
        }
        if warn_on!(offset >= walk.size) {
            return Err(Error::InvalidArgument);
        }
        Ok(GuestRun {
            phys: phys + offset,
            attrs,
            nr_pages: ((walk.size - offset) >> PAGE_SHIFT).min(nr_pages),
        })
    }

    /// Remaps a run resolved by `request_page_transition()` in `state`.
    pub fn initiate_page_transition(
        &mut self,
        ipa: u64,
        run: &GuestRun,
        state: PageState,
        memcache: &mut HypMemcache,
    ) -> Result<()> {
        let (pgt, mut alloc) = self.parts(Some(memcache))?;
        pgt.map(
            ipa,
            run.nr_pages * PAGE_SIZE,
            run.phys,
            run.attrs.with_state(state),
            &mut alloc,
        )?;
        Ok(())
    }

    /// Returns the number of pages from `ipa` that are unmapped, with or without an MMIO guard.
    pub fn unmapped_run(&self, ipa: u64, nr_pages: u64) -> Result<u64> {
        let walk = self.walk_request(ipa, nr_pages, PageState::NOPAGE, !PageState::MMIO)?;
        Ok((walk.size >> PAGE_SHIFT).min(nr_pages))
    }

    /// Maps `[ipa, ipa + size)` to `phys` on behalf of the host.
    pub fn map(
        &mut self,
        ipa: u64,
        size: u64,
        phys: u64,
        attrs: LeafAttrs,
        memcache: Option<&mut HypMemcache>,
    ) -> Result<()> {
        let (pgt, mut alloc) = self.parts(memcache)?;
        pgt.map(ipa, size, phys, attrs, &mut alloc)?;
        for off in (0..size).step_by(PAGE_SIZE as usize) {
            self.mappings.insert(ipa + off, phys + off);
        }
        Ok(())
    }

    /// Unmaps `[ipa, ipa + size)`, returning the number of bytes that were mapped.
    pub fn unmap(&mut self, ipa: u64, size: u64) -> Result<u64> {
        let (pgt, mut alloc) = self.parts(None)?;
        let unmapped = pgt.unmap(ipa, size, &mut alloc)?;
        self.forget(ipa, size);
        Ok(unmapped)
    }

    /// Writes `annotation` over `[ipa, ipa + size)`.
    pub fn annotate(
        &mut self,
        ipa: u64,
        size: u64,
        annotation: Entry,
        memcache: Option<&mut HypMemcache>,
    ) -> Result<()> {
        let (pgt, mut alloc) = self.parts(memcache)?;
        pgt.annotate(ipa, size, annotation, &mut alloc)?;
        self.forget(ipa, size);
        Ok(())
    }

    fn forget(&mut self, ipa: u64, size: u64) {
        let end = ipa.saturating_add(size);
        let stale: Vec<u64> = self.mappings.range(ipa..end).map(|(ipa, _)| *ipa).collect();
        for ipa in stale {
            self.mappings.remove(&ipa);
        }
    }

    /// Returns the IPA of every page installed by the host that may still be mapped.
    pub fn mapped_pages(&self) -> Vec<u64> {
        self.mappings.keys().copied().collect()
    }

    pub fn relax_perms(&mut self, ipa: u64, prot: Prot) -> Result<()> {
        let (pgt, mut alloc) = self.parts(None)?;
        Ok(pgt.relax_perms(ipa, prot, &mut alloc)?)
    }

    pub fn wrprotect(&mut self, ipa: u64, size: u64) -> Result<()> {
        let (pgt, mut alloc) = self.parts(None)?;
        Ok(pgt.wrprotect(ipa, size, &mut alloc)?)
    }

    pub fn test_clear_young(&mut self, ipa: u64, size: u64, mkold: bool) -> Result<bool> {
        let (pgt, mut alloc) = self.parts(None)?;
        Ok(pgt.test_clear_young(ipa, size, mkold, &mut alloc)?)
    }

    pub fn mkyoung(&mut self, ipa: u64) -> Result<Pte> {
        let (pgt, mut alloc) = self.parts(None)?;
        Ok(pgt.mkyoung(ipa, &mut alloc)?)
    }

    /// Frees the table and returns every page of the pool.
    pub fn destroy(&mut self) -> Vec<PhysPfn> {
        if let Some(pgt) = self.pgt.take() {
            pgt.destroy(&mut self.pool);
        }
        self.mappings.clear();
        self.pool.drain()
    }
}

/// A guest VM as seen by the hypervisor.
pub struct GuestVm {
    handle: u64,
    config: GuestVmConfig,
    stage2: Mutex<GuestStage2>,
}

impl GuestVm {
    /// Creates a guest whose tables are allocated from `pool`.
    pub fn new(handle: u64, config: GuestVmConfig, pool: HypPool) -> Result<Self> {
        let stage2 = GuestStage2::new(config.ia_bits, pool)?;
        Ok(Self {
            handle,
            config,
            stage2: Mutex::new(stage2),
        })
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn config(&self) -> &GuestVmConfig {
        &self.config
    }

    pub fn is_protected(&self) -> bool {
        self.config.protected
    }

    pub fn has_mmio_guard(&self) -> bool {
        self.config.mmio_guard
    }

    /// Returns true if `[ipa, end)` overlaps the guest firmware.
    pub fn ipa_range_has_pvmfw(&self, ipa: u64, end: u64) -> bool {
        self.config
            .pvmfw
            .is_some_and(|fw| ipa < fw.end && fw.start < end)
    }

    /// Takes the guest's stage-2 lock.
    pub fn lock(&self) -> MutexGuard<'_, GuestStage2> {
        self.stage2.lock()
    }
}

/// A vCPU of a guest, with the pages the host topped up for it.
pub struct Vcpu {
    vm: Arc<GuestVm>,
    memcache: HypMemcache,
}

impl Vcpu {
    pub fn new(vm: Arc<GuestVm>) -> Self {
        Self {
            vm,
            memcache: HypMemcache::new(),
        }
    }

    pub fn vm(&self) -> &Arc<GuestVm> {
        &self.vm
    }

    pub fn memcache(&self) -> &HypMemcache {
        &self.memcache
    }

    /// Splits the vCPU into its VM and its memcache.
    pub fn parts(&mut self) -> (&GuestVm, &mut HypMemcache) {
        (&self.vm, &mut self.memcache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_pages::PhysAddr;
    use page_tracking::{MemFlags, MemoryMapBuilder, PageRegistry};

    const RAM: u64 = 0x4000_0000;

    fn stub_guest() -> (MemoryMap, GuestStage2) {
        let map = MemoryMapBuilder::new()
            .add_memory_region(PhysAddr::phys(RAM), 0x400_0000, MemFlags::empty())
            .unwrap()
            .build();
        let registry = PageRegistry::new(&map);
        let pool = HypPool::new(registry, PhysPfn::phys(0x43000), 32, 0).unwrap();
        (map, GuestStage2::new(40, pool).unwrap())
    }

    fn rwx() -> LeafAttrs {
        LeafAttrs::new(Prot::RWX)
    }

    #[test]
    fn request_covers_contiguous_run() {
        let (map, mut guest) = stub_guest();
        guest.map(0x10_0000, 0x4000, RAM + 0x8000, rwx(), None).unwrap();
        guest.map(0x10_4000, 0x1000, RAM + 0x1_0000, rwx(), None).unwrap();

        let run = guest
            .request_page_transition(&map, 0x10_0000, 8, PageState::OWNED, 0)
            .unwrap();
        assert_eq!(
            run,
            GuestRun {
                phys: RAM + 0x8000,
                attrs: rwx(),
                nr_pages: 4
            }
        );

        // Starting mid-run.
        let run = guest
            .request_page_transition(&map, 0x10_2000, 1, PageState::OWNED, 0)
            .unwrap();
        assert_eq!(run.phys, RAM + 0xa000);
        assert_eq!(run.nr_pages, 1);
    }

    #[test]
    fn request_errors() {
        let (map, mut guest) = stub_guest();
        assert_eq!(
            guest.request_page_transition(&map, 0x10_0000, 1, PageState::OWNED, 0),
            Err(Error::Fault)
        );
        let shared = rwx().with_state(PageState::SHARED_OWNED);
        guest.map(0x10_0000, 0x1000, RAM, shared, None).unwrap();
        assert_eq!(
            guest.request_page_transition(&map, 0x10_0000, 1, PageState::OWNED, 0),
            Err(Error::PermissionDenied)
        );
        guest.map(0x20_0000, 0x1000, RAM, rwx(), None).unwrap();
        let pxn = LeafAttrs::new(Prot::RWX | Prot::PXN);
        guest.map(0x20_1000, 0x1000, RAM + 0x1000, pxn, None).unwrap();
        assert_eq!(
            guest.request_page_transition(&map, 0x20_0000, 2, PageState::OWNED, 0),
            Err(Error::InvalidArgument)
        );
        // MMIO can't be transitioned.
        guest.map(0x30_0000, 0x1000, 0x900_0000, rwx(), None).unwrap();
        assert_eq!(
            guest.request_page_transition(&map, 0x30_0000, 1, PageState::OWNED, 0),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn partial_block_needs_memcache() {
        let (map, mut guest) = stub_guest();
        guest.map(0x20_0000, 0x20_0000, RAM + 0x20_0000, rwx(), None).unwrap();
        assert_eq!(
            guest.request_page_transition(&map, 0x20_1000, 1, PageState::OWNED, 0),
            Err(Error::TooBig)
        );
        let min = guest.min_memcache_pages().unwrap();
        assert_eq!(min, 2);
        let run = guest
            .request_page_transition(&map, 0x20_1000, 1, PageState::OWNED, min)
            .unwrap();
        assert_eq!(run.phys, RAM + 0x20_1000);
        assert_eq!(run.nr_pages, 1);

        let whole = guest
            .request_page_transition(&map, 0x20_0000, 512, PageState::OWNED, 0)
            .unwrap();
        assert_eq!(whole.nr_pages, 512);
    }

    #[test]
    fn transition_rewrites_state() {
        let (map, mut guest) = stub_guest();
        guest.map(0x10_0000, 0x2000, RAM, rwx(), None).unwrap();
        let mut mc = HypMemcache::new();
        let run = guest
            .request_page_transition(&map, 0x10_0000, 2, PageState::OWNED, 0)
            .unwrap();
        guest
            .initiate_page_transition(0x10_0000, &run, PageState::SHARED_OWNED, &mut mc)
            .unwrap();
        assert_eq!(
            guest.check_page_state_range(0x10_0000, 0x2000, PageState::SHARED_OWNED),
            Ok(())
        );
    }

    #[test]
    fn budget_bounds_the_walk() {
        let (map, mut guest) = stub_guest();
        // Misaligned with the block size, so every page gets its own entry.
        guest.map(0x1000, 300 * PAGE_SIZE, RAM + 0x1000, rwx(), None).unwrap();
        let run = guest
            .request_page_transition(&map, 0x1000, 300, PageState::OWNED, 0)
            .unwrap();
        assert_eq!(run.nr_pages, 256);
    }

    #[test]
    fn guarded_and_unmapped_runs() {
        let (_, mut guest) = stub_guest();
        guest.annotate(0x5000, 0x2000, Entry::MmioGuard, None).unwrap();
        assert_eq!(guest.unmapped_run(0x4000, 4), Ok(4));
        guest.map(0x8000, 0x1000, RAM, rwx(), None).unwrap();
        assert_eq!(guest.unmapped_run(0x4000, 8), Err(Error::PermissionDenied));
        assert_eq!(
            guest.check_page_state_range(0x5000, 0x2000, PageState::NOPAGE | PageState::MMIO),
            Ok(())
        );
    }

    #[test]
    fn valid_leaf_lookup() {
        let (_, mut guest) = stub_guest();
        guest.map(0x20_0000, 0x20_0000, RAM, rwx(), None).unwrap();
        assert_eq!(guest.get_valid_leaf(0x20_0000, 9).unwrap().0, RAM);
        assert_eq!(guest.get_valid_leaf(0x20_0000, 0), Err(Error::TooBig));
        assert_eq!(guest.get_valid_leaf(0x20_0000, 3), Err(Error::InvalidArgument));
        assert_eq!(guest.get_valid_leaf(0x1000, 9), Err(Error::NotFound));
        assert_eq!(guest.mapped_pages().len(), 512);
        assert_eq!(guest.unmap(0x20_0000, 0x20_0000), Ok(0x20_0000));
        assert!(guest.mapped_pages().is_empty());
    }

    #[test]
    fn memcache_backs_allocation() {
        let (_, mut guest) = stub_guest();
        guest.pool.drain();
        let mut mc = HypMemcache::new();
        assert_eq!(
            guest.map(0x1000, 0x1000, RAM, rwx(), Some(&mut mc)),
            Err(Error::OutOfMemory)
        );
        mc.push(PhysPfn::phys(0x40100));
        mc.push(PhysPfn::phys(0x40101));
        guest.map(0x1000, 0x1000, RAM, rwx(), Some(&mut mc)).unwrap();
        assert_eq!(mc.nr_pages(), 0);
        guest.unmap(0x1000, 0x1000).unwrap();
        // The freed tables now belong to the guest's pool.
        assert_eq!(guest.pool.free_pages(), 2);
    }
}
