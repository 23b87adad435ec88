// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Collaborators the ownership tracker notifies or defers to but doesn't implement itself.

use arm_page_tables::Prot;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::fault::HostCpuContext;
use crate::Result;

/// The IOMMU driver mirroring the host stage-2 identity map.
pub trait Iommu: Send + Sync {
    /// Makes `[start, end)` accessible to host DMA with `prot`, or inaccessible if `prot` is empty.
    fn host_stage2_idmap(&self, start: u64, end: u64, prot: Prot);

    /// Ends a batch of `host_stage2_idmap()` calls. `mapped` is false if the batch removed access.
    fn host_stage2_idmap_complete(&self, mapped: bool);

    /// Offers a host data abort on MMIO to the driver. Returns true if the driver emulated it.
    fn host_dabt_handler(&self, _ctx: &mut HostCpuContext, _esr: u64, _addr: u64) -> bool {
        false
    }
}

/// A system without an IOMMU.
pub struct NoIommu;

impl Iommu for NoIommu {
    fn host_stage2_idmap(&self, _start: u64, _end: u64, _prot: Prot) {}

    fn host_stage2_idmap_complete(&self, _mapped: bool) {}
}

/// Tracks how many pages the host can't see, so that firmware can scrub memory on reset while any
/// are outstanding.
pub trait PsciMemProtect: Send + Sync {
    fn inc(&self, nr_pages: u64);
    fn dec(&self, nr_pages: u64);
}

/// A `PsciMemProtect` that just keeps the count.
#[derive(Debug, Default)]
pub struct PsciMemProtectCounter {
    count: AtomicU64,
}

impl PsciMemProtectCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of pages currently protected.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl PsciMemProtect for PsciMemProtectCounter {
    fn inc(&self, nr_pages: u64) {
        self.count.fetch_add(nr_pages, Ordering::Relaxed);
    }

    fn dec(&self, nr_pages: u64) {
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(nr_pages))
            });
    }
}

/// Platform services the ownership operations rely on.
pub trait Platform: Send + Sync {
    /// Scrubs `[phys, phys + size)` before it's handed back to the host.
    fn poison_page(&self, phys: u64, size: u64);

    /// Copies the guest firmware image into the freshly donated `[phys, phys + size)`, which the
    /// guest will see at `ipa`.
    fn load_pvmfw_pages(&self, _ipa: u64, _phys: u64, _size: u64) -> Result<()> {
        Ok(())
    }

    /// Translates a host virtual address through the host's stage-1, as `AT S1E1R` would.
    fn translate_far(&self, far: u64) -> Option<u64>;

    /// Returns true if the CPU implements memory tagging.
    fn has_mte(&self) -> bool {
        false
    }
}
