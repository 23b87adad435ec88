// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::Arc;
use arm_page_tables::LeafAttrs;
use arm_pages::{OwnerId, PageSize, PageState, PhysPfn, PAGE_SHIFT};
use log::info;
use page_tracking::{HypPool, MemRange, MemoryMap, PageRegistry};

use crate::host::HostComponent;
use crate::hyp::{HypComponent, PAGE_HYP};
use crate::mem_protect::MemProtect;
use crate::platform::{Iommu, NoIommu, Platform, PsciMemProtect, PsciMemProtectCounter};
use crate::{Error, Result};

/// Default width of the host's IPA space.
pub const DEFAULT_HOST_IA_BITS: u64 = 40;

/// Describes the system a `MemProtect` is set up for. Both pools are carved out of RAM and handed
/// to the hypervisor before the host gets to run.
pub struct MemProtectBuilder {
    mem_map: MemoryMap,
    hyp_pool: MemRange,
    host_pool: MemRange,
    host_ia_bits: u64,
    hyp_va_offset: u64,
    iommu: Arc<dyn Iommu>,
    psci: Arc<dyn PsciMemProtect>,
    platform: Arc<dyn Platform>,
}

impl MemProtectBuilder {
    /// Starts describing a system whose RAM is laid out by `mem_map`.
    pub fn new(mem_map: MemoryMap, platform: Arc<dyn Platform>) -> Self {
        Self {
            mem_map,
            hyp_pool: MemRange::new(0, 0),
            host_pool: MemRange::new(0, 0),
            host_ia_bits: DEFAULT_HOST_IA_BITS,
            hyp_va_offset: 0,
            iommu: Arc::new(NoIommu),
            psci: Arc::new(PsciMemProtectCounter::new()),
            platform,
        }
    }

    /// Pages backing the hypervisor's own page table.
    pub fn hyp_pool(mut self, range: MemRange) -> Self {
        self.hyp_pool = range;
        self
    }

    /// Pages backing the host stage-2 table.
    pub fn host_pool(mut self, range: MemRange) -> Self {
        self.host_pool = range;
        self
    }

    pub fn host_ia_bits(mut self, ia_bits: u64) -> Self {
        self.host_ia_bits = ia_bits;
        self
    }

    /// Offset of the hypervisor's linear map of physical memory.
    pub fn hyp_va_offset(mut self, offset: u64) -> Self {
        self.hyp_va_offset = offset;
        self
    }

    pub fn iommu(mut self, iommu: Arc<dyn Iommu>) -> Self {
        self.iommu = iommu;
        self
    }

    pub fn psci(mut self, psci: Arc<dyn PsciMemProtect>) -> Self {
        self.psci = psci;
        self
    }

    fn check_carveout(&self, range: &MemRange) -> Result<()> {
        if range.start >= range.end
            || !PageSize::Size4k.is_aligned(range.start)
            || !PageSize::Size4k.is_aligned(range.end)
            || !self.mem_map.range_is_memory(range.start, range.end)
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Builds the host and hypervisor tables: the host identity maps all of RAM, minus the two
    /// pools which end up owned by the hypervisor.
    pub fn build(self) -> Result<MemProtect> {
        self.check_carveout(&self.hyp_pool)?;
        self.check_carveout(&self.host_pool)?;
        if self.hyp_pool.start < self.host_pool.end && self.host_pool.start < self.hyp_pool.end {
            return Err(Error::InvalidArgument);
        }

        let registry = PageRegistry::new(&self.mem_map);
        let pool = |range: &MemRange| {
            HypPool::new(
                registry.clone(),
                PhysPfn::phys(range.start >> PAGE_SHIFT),
                range.size() >> PAGE_SHIFT,
                0,
            )
        };
        let mut hyp = HypComponent::new(pool(&self.hyp_pool)?, self.hyp_va_offset)?;
        let mut host = HostComponent::new(
            self.mem_map.clone(),
            registry.clone(),
            pool(&self.host_pool)?,
            self.host_ia_bits,
            self.iommu.clone(),
        )?;
        host.prepopulate()?;
        for carveout in [self.hyp_pool, self.host_pool] {
            hyp.create_mappings(carveout.start, carveout.size(), LeafAttrs::new(PAGE_HYP))?;
            host.set_owner_inner(
                carveout.start,
                carveout.size(),
                OwnerId::HYP,
                true,
                PageState::empty(),
                true,
            )?;
        }
        info!(
            "stage-2 protection: {} pages of RAM, host IPA size {} bits",
            self.mem_map.num_pages(),
            self.host_ia_bits
        );

        Ok(MemProtect::new(
            self.mem_map,
            registry,
            host,
            hyp,
            self.iommu,
            self.psci,
            self.platform,
        ))
    }
}
