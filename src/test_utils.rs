// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! A small simulated machine for the unit tests: 64MB of RAM at 1GB, a 2MB no-map carve-out above
//! it, and MMIO everywhere else.

use alloc::sync::Arc;
use alloc::vec::Vec;
use arm_page_tables::Prot;
use arm_pages::PhysAddr;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};
use page_tracking::{MemFlags, MemRange, MemoryMapBuilder};
use std::sync::Mutex;

use crate::fault::HostCpuContext;
use crate::guest::{GuestVm, GuestVmConfig, Vcpu};
use crate::mem_protect::MemProtect;
use crate::platform::{Iommu, Platform, PsciMemProtectCounter};
use crate::{MemProtectBuilder, Result};

pub use arm_pages::{PAGE_SHIFT, PAGE_SIZE};

pub const RAM_BASE: u64 = 0x4000_0000;
pub const RAM_SIZE: u64 = 0x400_0000;
pub const NOMAP_BASE: u64 = 0x5000_0000;
pub const NOMAP_SIZE: u64 = 0x20_0000;
pub const MMIO_BASE: u64 = 0x900_0000;
pub const HYP_POOL: MemRange = MemRange::new(RAM_BASE, RAM_BASE + 0x20_0000);
pub const HOST_POOL: MemRange = MemRange::new(RAM_BASE + 0x20_0000, RAM_BASE + 0x60_0000);
pub const HYP_VA_OFFSET: u64 = 1 << 46;
/// Start of the RAM the tests hand around; everything from here to the end of RAM is host-owned.
pub const HOST_RAM: u64 = RAM_BASE + 0x100_0000;
pub const GUEST_IA_BITS: u64 = 40;

// Guest table pools are carved out of [0x4080_0000, 0x4100_0000).
const GUEST_POOLS: u64 = RAM_BASE + 0x80_0000;
const GUEST_POOL_SIZE: u64 = 32 * PAGE_SIZE;

/// Returns the pfn of the `n`th page of host RAM.
pub fn host_pfn(n: u64) -> u64 {
    (HOST_RAM >> PAGE_SHIFT) + n
}

/// An IOMMU that records every notification.
#[derive(Default)]
pub struct RecordingIommu {
    pub idmaps: Mutex<Vec<(u64, u64, Prot)>>,
    pub completes: Mutex<Vec<bool>>,
    pub emulate_dabt: AtomicBool,
}

impl RecordingIommu {
    /// Returns true if the last notification covering `addr` removed access.
    pub fn unmapped(&self, addr: u64) -> bool {
        let idmaps = self.idmaps.lock().unwrap();
        idmaps
            .iter()
            .rev()
            .find(|(start, end, _)| (*start..*end).contains(&addr))
            .is_some_and(|(_, _, prot)| prot.is_empty())
    }
}

impl Iommu for RecordingIommu {
    fn host_stage2_idmap(&self, start: u64, end: u64, prot: Prot) {
        self.idmaps.lock().unwrap().push((start, end, prot));
    }

    fn host_stage2_idmap_complete(&self, mapped: bool) {
        self.completes.lock().unwrap().push(mapped);
    }

    fn host_dabt_handler(&self, _ctx: &mut HostCpuContext, _esr: u64, _addr: u64) -> bool {
        self.emulate_dabt.load(Ordering::Relaxed)
    }
}

/// A platform with an identity stage-1 that records poisoned and firmware-loaded pages.
#[derive(Default)]
pub struct TestPlatform {
    pub poisoned: Mutex<Vec<(u64, u64)>>,
    pub pvmfw_loads: Mutex<Vec<(u64, u64, u64)>>,
    pub fail_translation: AtomicBool,
}

impl Platform for TestPlatform {
    fn poison_page(&self, phys: u64, size: u64) {
        self.poisoned.lock().unwrap().push((phys, size));
    }

    fn load_pvmfw_pages(&self, ipa: u64, phys: u64, size: u64) -> Result<()> {
        self.pvmfw_loads.lock().unwrap().push((ipa, phys, size));
        Ok(())
    }

    fn translate_far(&self, far: u64) -> Option<u64> {
        if self.fail_translation.load(Ordering::Relaxed) {
            None
        } else {
            Some(far)
        }
    }
}

/// A booted `MemProtect` plus handles on its collaborators.
pub struct TestEnv {
    pub mp: MemProtect,
    pub iommu: Arc<RecordingIommu>,
    pub psci: Arc<PsciMemProtectCounter>,
    pub platform: Arc<TestPlatform>,
    next_guest_pool: Cell<u64>,
}

impl TestEnv {
    pub fn new() -> Self {
        let map = MemoryMapBuilder::new()
            .add_memory_region(PhysAddr::phys(RAM_BASE), RAM_SIZE, MemFlags::empty())
            .unwrap()
            .add_memory_region(PhysAddr::phys(NOMAP_BASE), NOMAP_SIZE, MemFlags::NOMAP)
            .unwrap()
            .build();
        let iommu = Arc::new(RecordingIommu::default());
        let psci = Arc::new(PsciMemProtectCounter::new());
        let platform = Arc::new(TestPlatform::default());
        let mp = MemProtectBuilder::new(map, platform.clone())
            .hyp_pool(HYP_POOL)
            .host_pool(HOST_POOL)
            .hyp_va_offset(HYP_VA_OFFSET)
            .iommu(iommu.clone())
            .psci(psci.clone())
            .build()
            .unwrap();
        Self {
            mp,
            iommu,
            psci,
            platform,
            next_guest_pool: Cell::new(GUEST_POOLS),
        }
    }

    /// Returns a guest config with a fresh table pool.
    pub fn guest_config(&self, protected: bool) -> GuestVmConfig {
        let start = self.next_guest_pool.get();
        self.next_guest_pool.set(start + GUEST_POOL_SIZE);
        GuestVmConfig {
            ia_bits: GUEST_IA_BITS,
            protected,
            mmio_guard: protected,
            pvmfw: None,
            pool: MemRange::new(start, start + GUEST_POOL_SIZE),
        }
    }

    /// Creates a guest and returns its first vCPU.
    pub fn vcpu(&self, protected: bool) -> Vcpu {
        Vcpu::new(self.mp.create_guest(self.guest_config(protected)).unwrap())
    }

    /// Creates a guest from `config` and returns its first vCPU.
    pub fn vcpu_with(&self, config: GuestVmConfig) -> Vcpu {
        Vcpu::new(self.mp.create_guest(config).unwrap())
    }
}

/// Returns true if the guest sees the page at `ipa` in `state`.
pub fn guest_state_is(vm: &GuestVm, ipa: u64, state: arm_pages::PageState) -> bool {
    vm.lock()
        .check_page_state_range(ipa, PAGE_SIZE, state)
        .is_ok()
}

/// The registry fields of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageSnapshot {
    pub host_state: arm_pages::PageState,
    pub refcount: u16,
    pub order: u8,
    pub share_guest_count: u32,
}

/// Reads the registry entry of the page at `phys`.
pub fn snapshot(mp: &MemProtect, phys: u64) -> PageSnapshot {
    let page = mp.registry().get_by_addr(phys).unwrap();
    PageSnapshot {
        host_state: page.host_state(),
        refcount: page.refcount(),
        order: page.order(),
        share_guest_count: page.share_guest_count(),
    }
}

const VIEW_STATES: [arm_pages::PageState; 4] = [
    arm_pages::PageState::OWNED,
    arm_pages::PageState::SHARED_OWNED,
    arm_pages::PageState::SHARED_BORROWED,
    arm_pages::PageState::NOPAGE,
];

fn hyp_view(mp: &MemProtect, phys: u64) -> arm_pages::PageState {
    VIEW_STATES
        .into_iter()
        .find(|&s| mp.hyp_check_page_state(phys, PAGE_SIZE, s).is_ok())
        .unwrap()
}

fn guest_view(vm: &GuestVm, ipa: u64) -> arm_pages::PageState {
    VIEW_STATES
        .into_iter()
        .find(|&s| {
            guest_state_is(vm, ipa, s)
                || guest_state_is(vm, ipa, s | arm_pages::PageState::RESTRICTED_PROT)
        })
        .unwrap()
}

/// Checks that exactly one principal owns the RAM page at `phys` and that every principal
/// borrowing it borrows from an owner that shares it. `guests` lists each guest that maps the
/// page and the IPA it is mapped at.
pub fn assert_one_owner(mp: &MemProtect, phys: u64, guests: &[(&Arc<GuestVm>, u64)]) {
    use arm_pages::PageState;
    let mut views = vec![
        ("host", snapshot(mp, phys).host_state),
        ("hyp", hyp_view(mp, phys)),
    ];
    for &(vm, ipa) in guests {
        views.push(("guest", guest_view(vm, ipa)));
    }
    let owners: Vec<_> = views
        .iter()
        .filter(|(_, s)| *s == PageState::OWNED || *s == PageState::SHARED_OWNED)
        .collect();
    assert_eq!(owners.len(), 1, "{phys:#x} seen as {views:?}");
    let borrowed = views.iter().any(|(_, s)| *s == PageState::SHARED_BORROWED);
    if borrowed {
        assert_eq!(owners[0].1, PageState::SHARED_OWNED, "{phys:#x} seen as {views:?}");
    }
}
