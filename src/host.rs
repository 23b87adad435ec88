// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use alloc::vec::Vec;
use arm_page_tables::{
    Entry, LeafAttrs, Level, PageTable, PageTableError, PageTableResult, Prot, Pte, PtePolicy,
};
use arm_pages::{OwnerId, PageState};
use log::trace;
use page_tracking::{HypPool, MemRange, MemoryMap, PageRegistry};

use crate::platform::Iommu;
use crate::{Error, Result};

/// Permissions of the host's default identity mapping of RAM.
pub const HOST_MEM_PROT: Prot = Prot::RWX;
/// Permissions of the host's default identity mapping of MMIO.
pub const HOST_MMIO_PROT: Prot = Prot::RW.union(Prot::DEVICE);

/// Returns the permissions the host gets by default for RAM or MMIO.
pub fn default_host_prot(is_memory: bool) -> Prot {
    if is_memory {
        HOST_MEM_PROT
    } else {
        HOST_MMIO_PROT
    }
}

/// Host stage-2 flavour.
///
/// Default identity mappings hold no reference on their table: they can be rebuilt from a fault
/// at any time, so tables holding only those can be reclaimed. Anything else has to be installed at
/// page granularity, since the table is then the only record of that state.
pub struct HostPtePolicy {
    mem_map: MemoryMap,
}

impl PtePolicy for HostPtePolicy {
    fn force_pte(&self, addr: u64, end: u64, new: &Entry) -> bool {
        match new {
            Entry::Leaf { attrs, .. } => {
                *attrs != LeafAttrs::new(default_host_prot(self.mem_map.range_is_memory(addr, end)))
            }
            _ => true,
        }
    }

    fn pte_is_counted(&self, entry: &Entry, _level: Level) -> bool {
        match *entry {
            Entry::Empty => false,
            Entry::Owned(_) | Entry::MmioGuard | Entry::Table(_) => true,
            Entry::Leaf { phys, attrs, young } => {
                let default = LeafAttrs::new(default_host_prot(self.mem_map.addr_is_memory(phys)));
                !(young && attrs == default)
            }
        }
    }
}

// The host's view of an MMIO page, from its stage-2 entry.
fn host_mmio_state(entry: &Entry) -> PageState {
    match entry {
        Entry::Empty => PageState::OWNED,
        Entry::Leaf { attrs, .. } => {
            let mut state = attrs.state;
            if attrs.prot.rwx() != HOST_MMIO_PROT.rwx() {
                state |= PageState::RESTRICTED_PROT;
            }
            state
        }
        _ => PageState::NOPAGE,
    }
}

// Drops the host mappings of `[start, start + size)` that can be rebuilt on demand.
fn unmap_reg(
    pgt: &mut PageTable<HostPtePolicy>,
    pool: &mut HypPool,
    iommu: &dyn Iommu,
    start: u64,
    size: u64,
) -> Result<()> {
    pgt.reclaim_leaves(start, size, pool)?;
    iommu.host_stage2_idmap(start, start + size, Prot::empty());
    iommu.host_stage2_idmap_complete(false);
    Ok(())
}

/// The host's stage-2 table and the pool backing it. Only ever accessed with the host lock held.
pub struct HostComponent {
    pgt: PageTable<HostPtePolicy>,
    pool: HypPool,
    mem_map: MemoryMap,
    registry: PageRegistry,
    iommu: Arc<dyn Iommu>,
}

impl HostComponent {
    /// Creates an empty host stage-2 translating `ia_bits` of IPA space, with its tables allocated
    /// from `pool`.
    pub fn new(
        mem_map: MemoryMap,
        registry: PageRegistry,
        mut pool: HypPool,
        ia_bits: u64,
        iommu: Arc<dyn Iommu>,
    ) -> Result<Self> {
        let policy = HostPtePolicy {
            mem_map: mem_map.clone(),
        };
        let pgt = PageTable::new(ia_bits, true, policy, &mut pool)?;
        Ok(Self {
            pgt,
            pool,
            mem_map,
            registry,
            iommu,
        })
    }

    /// Returns the host stage-2 table.
    pub fn pgt(&self) -> &PageTable<HostPtePolicy> {
        &self.pgt
    }

    /// Maps every RAM region with the default host permissions.
    pub fn prepopulate(&mut self) -> Result<()> {
        let regions: Vec<MemRange> = self.mem_map.regions().map(|r| r.range()).collect();
        for range in regions {
            self.idmap_locked(range.start, range.size(), LeafAttrs::new(HOST_MEM_PROT), false)?;
        }
        Ok(())
    }

    // Runs `op` against the table, evicting every rebuildable mapping and retrying once if the pool
    // ran dry.
    fn retry_on_oom<T, F>(&mut self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut PageTable<HostPtePolicy>, &mut HypPool) -> PageTableResult<T>,
    {
        match op(&mut self.pgt, &mut self.pool) {
            Err(PageTableError::InsufficientPtePages) => {
                self.unmap_unmoveable_regs()?;
                Ok(op(&mut self.pgt, &mut self.pool)?)
            }
            res => Ok(res?),
        }
    }

    /// Tears down the mappings of everything outside of the moveable ranges.
    pub fn unmap_unmoveable_regs(&mut self) -> Result<()> {
        let Self {
            pgt,
            pool,
            mem_map,
            iommu,
            ..
        } = self;
        let ia_end = 1u64 << pgt.ia_bits();
        let mut addr = 0;
        for reg in mem_map.moveable_regions() {
            let start = reg.start.min(ia_end);
            if start > addr {
                unmap_reg(pgt, pool, iommu.as_ref(), addr, start - addr)?;
            }
            addr = addr.max(reg.end.min(ia_end));
        }
        if ia_end > addr {
            unmap_reg(pgt, pool, iommu.as_ref(), addr, ia_end - addr)?;
        }
        Ok(())
    }

    /// Identity maps `[addr, addr + size)` with `attrs`, mirroring the change in the IOMMU if
    /// `update_iommu` is set.
    pub fn idmap_locked(
        &mut self,
        addr: u64,
        size: u64,
        attrs: LeafAttrs,
        update_iommu: bool,
    ) -> Result<()> {
        self.retry_on_oom(|pgt, pool| pgt.map(addr, size, addr, attrs, pool))?;
        if update_iommu {
            self.iommu.host_stage2_idmap(addr, addr + size, attrs.prot);
            self.iommu.host_stage2_idmap_complete(!attrs.prot.is_empty());
        }
        Ok(())
    }

    /// Records `owner` as the owner of `[addr, addr + size)` in the host stage-2.
    ///
    /// Handing pages back to the host restores the default identity mapping; anything else leaves
    /// an owner annotation and, for RAM, records the pages as `NOPAGE | nopage_state`.
    pub fn set_owner_inner(
        &mut self,
        addr: u64,
        size: u64,
        owner: OwnerId,
        is_memory: bool,
        nopage_state: PageState,
        update_iommu: bool,
    ) -> Result<()> {
        trace!("host stage-2: {addr:#x}+{size:#x} now owned by {owner}");
        if owner.is_host() {
            let attrs = LeafAttrs::new(default_host_prot(is_memory));
            self.idmap_locked(addr, size, attrs, false)?;
        } else {
            self.retry_on_oom(|pgt, pool| pgt.annotate(addr, size, Entry::Owned(owner), pool))?;
        }
        if update_iommu {
            let prot = if owner.is_host() {
                HOST_MEM_PROT
            } else {
                Prot::empty()
            };
            self.iommu.host_stage2_idmap(addr, addr + size, prot);
            self.iommu.host_stage2_idmap_complete(!prot.is_empty());
        }
        if is_memory {
            let state = if owner.is_host() {
                PageState::OWNED
            } else {
                PageState::NOPAGE | nopage_state
            };
            self.update_page_state(addr, size, state);
        }
        Ok(())
    }

    /// Records `owner` as the owner of `[addr, addr + size)`, updating the IOMMU.
    pub fn set_owner_locked(&mut self, addr: u64, size: u64, owner: OwnerId) -> Result<()> {
        let is_memory = self.mem_map.addr_is_memory(addr);
        self.set_owner_inner(addr, size, owner, is_memory, PageState::empty(), true)
    }

    /// Sets the host state of every RAM page in the range.
    pub fn update_page_state(&self, addr: u64, size: u64, state: PageState) {
        for page in self.registry.range(addr, addr + size).flatten() {
            page.set_host_state(state);
        }
    }

    /// Checks that the host sees every page of `[addr, addr + size)` in `state`. The range must not
    /// cross a memory range boundary. Checking for `OWNED` also requires pages to be unpinned.
    pub fn check_page_state_range(&self, addr: u64, size: u64, state: PageState) -> Result<()> {
        let end = addr.checked_add(size).ok_or(Error::InvalidArgument)?;
        let (_, range) = self.mem_map.find_mem_range(addr);
        if size == 0 || !range.contains(end - 1) {
            return Err(Error::InvalidArgument);
        }
        self.check_page_state_inner(addr, size, state, state.is_owned())
    }

    /// As `check_page_state_range()`, with an explicit choice of whether pinned pages are rejected.
    pub fn check_page_state_inner(
        &self,
        addr: u64,
        size: u64,
        state: PageState,
        check_refcount: bool,
    ) -> Result<()> {
        let (reg, _) = self.mem_map.find_mem_range(addr);
        let Some(reg) = reg else {
            return self.pgt.walk_leaves::<Error, _>(addr, size, |visit| {
                if host_mmio_state(&visit.entry) != state {
                    return Err(Error::PermissionDenied);
                }
                Ok(())
            });
        };
        if reg.is_nomap() {
            return Err(Error::PermissionDenied);
        }
        for page in self.registry.range(addr, addr + size) {
            let page = page.ok_or(Error::InvalidArgument)?;
            if page.host_state() != state {
                return Err(Error::PermissionDenied);
            }
            if check_refcount && page.refcount() != 0 {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(())
    }

    /// Moves RAM pages the host still maps (or is about to map again) to `state`.
    pub fn set_page_state_range(&mut self, addr: u64, size: u64, state: PageState) -> Result<()> {
        let unmapped = self
            .registry
            .get_by_addr(addr)
            .is_some_and(|p| p.host_state().contains(PageState::NOPAGE));
        if unmapped {
            self.idmap_locked(addr, size, LeafAttrs::new(HOST_MEM_PROT), true)?;
        }
        self.update_page_state(addr, size, state);
        Ok(())
    }

    // Narrows `range` to the largest block around `addr` that it fully includes and that nothing
    // is mapped or annotated in.
    fn adjust_range(&self, addr: u64, range: &mut MemRange) -> Result<()> {
        let (pte, level) = self.pgt.get_leaf(addr)?;
        let entry = pte.decode(level);
        if entry.is_valid() {
            return Err(Error::Again);
        }
        if entry != Entry::Empty {
            // Something else owns the page; only unmapped RAM can carry an annotation.
            let mapped = self
                .registry
                .get_by_addr(addr)
                .is_some_and(|p| !p.host_state().contains(PageState::NOPAGE));
            warn_on!(mapped);
            return Err(Error::PermissionDenied);
        }

        let mut level = Some(level);
        let mut cur = *range;
        while let Some(l) = level {
            let start = l.page_size().round_down(addr);
            cur = MemRange::new(start, start + l.granule());
            level = l.next();
            if level.map_or(true, |next| next.supports_block_mapping() && range.includes(&cur)) {
                break;
            }
        }
        *range = cur;
        Ok(())
    }

    /// Restores the default identity mapping around a host stage-2 translation fault at `addr`.
    pub fn idmap_fault(&mut self, addr: u64) -> Result<()> {
        let (reg, mut range) = self.mem_map.find_mem_range(addr);
        let is_memory = reg.is_some();
        self.adjust_range(addr, &mut range)?;
        let attrs = LeafAttrs::new(default_host_prot(is_memory));
        self.idmap_locked(range.start, range.size(), attrs, !is_memory)
    }

    /// Returns the host stage-2 entry translating `addr` and its level.
    pub fn get_leaf(&self, addr: u64) -> Result<(Pte, Level)> {
        Ok(self.pgt.get_leaf(addr)?)
    }

    /// Pins the page-level tables translating `[addr, addr + size)`.
    pub fn get_pages(&mut self, addr: u64, size: u64) -> Result<()> {
        self.retry_on_oom(|pgt, pool| pgt.get_pages(addr, size, pool))
    }

    /// Unpins the tables pinned by `get_pages()`.
    pub fn put_pages(&mut self, addr: u64, size: u64) -> Result<()> {
        Ok(self.pgt.put_pages(addr, size, &mut self.pool)?)
    }
}
