// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arm_page_tables::{Entry, LeafAttrs, Level, PageTable, Prot, PtePolicy};
use arm_pages::PageState;
use page_tracking::HypPool;

use crate::{Error, Result};

/// Width of the hypervisor's own address space.
pub const HYP_VA_BITS: u64 = 48;

/// Default permissions of hypervisor mappings of RAM.
pub const PAGE_HYP: Prot = Prot::RW;
/// Default permissions of hypervisor mappings of MMIO.
pub const PAGE_HYP_DEVICE: Prot = Prot::RW.union(Prot::DEVICE);

/// Returns the permissions the hypervisor maps RAM or MMIO with.
pub fn default_hyp_prot(is_memory: bool) -> Prot {
    if is_memory {
        PAGE_HYP
    } else {
        PAGE_HYP_DEVICE
    }
}

/// Hypervisor stage-1 flavour: only live mappings hold table references.
pub struct HypPtePolicy;

impl PtePolicy for HypPtePolicy {
    fn pte_is_counted(&self, entry: &Entry, _level: Level) -> bool {
        entry.is_valid()
    }
}

fn hyp_state(entry: &Entry) -> PageState {
    match entry {
        Entry::Leaf { attrs, .. } => {
            let mut state = attrs.state;
            if attrs.prot.rwx() != PAGE_HYP.rwx() {
                state |= PageState::RESTRICTED_PROT;
            }
            state
        }
        _ => PageState::NOPAGE,
    }
}

/// The hypervisor's own page table, mapping physical memory at a fixed offset. Only ever accessed
/// with the hyp lock held.
pub struct HypComponent {
    pgt: PageTable<HypPtePolicy>,
    pool: HypPool,
    va_offset: u64,
}

impl HypComponent {
    /// Creates an empty hypervisor table whose linear map starts at `va_offset`.
    pub fn new(mut pool: HypPool, va_offset: u64) -> Result<Self> {
        let pgt = PageTable::new(HYP_VA_BITS, false, HypPtePolicy, &mut pool)?;
        Ok(Self {
            pgt,
            pool,
            va_offset,
        })
    }

    /// Returns the hypervisor VA of `phys` in the linear map.
    pub fn hyp_va(&self, phys: u64) -> u64 {
        phys + self.va_offset
    }

    /// Returns the physical address behind a linear-map VA.
    pub fn hyp_pa(&self, va: u64) -> Option<u64> {
        va.checked_sub(self.va_offset)
    }

    #[cfg(any(test, feature = "selftest"))]
    pub fn pool_mut(&mut self) -> &mut HypPool {
        &mut self.pool
    }

    /// Checks that the hypervisor sees every page of `[phys, phys + size)` in `state`.
    pub fn check_page_state_range(&self, phys: u64, size: u64, state: PageState) -> Result<()> {
        self.pgt
            .walk_leaves::<Error, _>(self.hyp_va(phys), size, |visit| {
                if hyp_state(&visit.entry) != state {
                    return Err(Error::PermissionDenied);
                }
                Ok(())
            })
    }

    /// Maps `[phys, phys + size)` into the linear map.
    pub fn create_mappings(&mut self, phys: u64, size: u64, attrs: LeafAttrs) -> Result<()> {
        let va = self.hyp_va(phys);
        self.pgt.map(va, size, phys, attrs, &mut self.pool)?;
        Ok(())
    }

    /// Removes the linear mapping of `[phys, phys + size)`, returning the number of bytes that were
    /// mapped.
    pub fn unmap(&mut self, phys: u64, size: u64) -> Result<u64> {
        let va = self.hyp_va(phys);
        Ok(self.pgt.unmap(va, size, &mut self.pool)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm_pages::{PhysAddr, PhysPfn};
    use page_tracking::{MemFlags, MemoryMapBuilder, PageRegistry};

    fn stub_hyp() -> HypComponent {
        let map = MemoryMapBuilder::new()
            .add_memory_region(PhysAddr::phys(0x4000_0000), 0x20_0000, MemFlags::empty())
            .unwrap()
            .build();
        let registry = PageRegistry::new(&map);
        let pool = HypPool::new(registry, PhysPfn::phys(0x40000), 32, 0).unwrap();
        HypComponent::new(pool, 1 << 46).unwrap()
    }

    #[test]
    fn linear_map_states() {
        let mut hyp = stub_hyp();
        let phys = 0x4010_0000;
        assert_eq!(hyp.hyp_pa(hyp.hyp_va(phys)), Some(phys));
        assert_eq!(hyp.hyp_pa(phys), None);
        assert_eq!(
            hyp.check_page_state_range(phys, 0x1000, PageState::NOPAGE),
            Ok(())
        );

        let borrowed = LeafAttrs::new(PAGE_HYP).with_state(PageState::SHARED_BORROWED);
        hyp.create_mappings(phys, 0x2000, borrowed).unwrap();
        assert_eq!(
            hyp.check_page_state_range(phys, 0x2000, PageState::SHARED_BORROWED),
            Ok(())
        );
        assert_eq!(
            hyp.check_page_state_range(phys, 0x3000, PageState::SHARED_BORROWED),
            Err(Error::PermissionDenied)
        );

        hyp.create_mappings(phys + 0x2000, 0x1000, LeafAttrs::new(PAGE_HYP_DEVICE))
            .unwrap();
        assert_eq!(
            hyp.check_page_state_range(phys + 0x2000, 0x1000, PageState::OWNED),
            Ok(())
        );
        hyp.create_mappings(phys + 0x3000, 0x1000, LeafAttrs::new(Prot::R))
            .unwrap();
        assert_eq!(
            hyp.check_page_state_range(phys + 0x3000, 0x1000, PageState::RESTRICTED_PROT),
            Ok(())
        );

        assert_eq!(hyp.unmap(phys, 0x2000), Ok(0x2000));
        assert_eq!(hyp.unmap(phys, 0x2000), Ok(0));
    }
}
