// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use arm_page_tables::{Level, Pte};
use arm_pages::{OwnerId, PageState, PhysPfn, PAGE_SHIFT, PAGE_SIZE};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use log::{debug, warn};
use page_tracking::{HypPool, MemoryMap, PageRegistry};
use sync::{Mutex, Once};

use crate::fault::HostCpuContext;
use crate::guest::{GuestVm, GuestVmConfig, Vcpu};
use crate::host::HostComponent;
use crate::hyp::HypComponent;
use crate::platform::{Iommu, Platform, PsciMemProtect};
use crate::{Error, Result};

/// Called with the host's context before an abort is injected into it.
pub type IllegalAbortNotifier = fn(&HostCpuContext);

/// Offered host stage-2 permission faults, with the ESR and faulting address. Returns true if
/// the fault was handled.
pub type PermFaultHandler = fn(&mut HostCpuContext, u64, u64) -> bool;

/// Converts `nr_pages` pages from `pfn` into a physical byte range, rejecting ranges that wrap.
pub(crate) fn pfn_range(pfn: u64, nr_pages: u64) -> Result<(u64, u64)> {
    let addr = pfn.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
    let size = nr_pages
        .checked_mul(PAGE_SIZE)
        .ok_or(Error::InvalidArgument)?;
    addr.checked_add(size).ok_or(Error::InvalidArgument)?;
    Ok((addr, size))
}

// Guest handles are allocated from here up; 0 names the host.
const FIRST_GUEST_HANDLE: u64 = 0x1000;

/// Stage-2 ownership tracking for the host, the hypervisor and every guest.
///
/// All transitions between principals go through here. Each one takes the locks of the principals
/// involved (see `locking`), checks that both ends agree on the current state of the pages, and
/// only then updates both sides.
pub struct MemProtect {
    pub(crate) host: Mutex<HostComponent>,
    pub(crate) hyp: Mutex<HypComponent>,
    mem_map: MemoryMap,
    registry: PageRegistry,
    iommu: Arc<dyn Iommu>,
    psci: Arc<dyn PsciMemProtect>,
    platform: Arc<dyn Platform>,
    finalized: AtomicBool,
    illegal_abt_notifier: Once<IllegalAbortNotifier>,
    perm_fault_handler: Once<PermFaultHandler>,
    vms: Mutex<BTreeMap<u64, Arc<GuestVm>>>,
    next_handle: AtomicU64,
}

impl MemProtect {
    pub(crate) fn new(
        mem_map: MemoryMap,
        registry: PageRegistry,
        host: HostComponent,
        hyp: HypComponent,
        iommu: Arc<dyn Iommu>,
        psci: Arc<dyn PsciMemProtect>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            host: Mutex::new(host),
            hyp: Mutex::new(hyp),
            mem_map,
            registry,
            iommu,
            psci,
            platform,
            finalized: AtomicBool::new(false),
            illegal_abt_notifier: Once::new(),
            perm_fault_handler: Once::new(),
            vms: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(FIRST_GUEST_HANDLE),
        }
    }

    pub fn mem_map(&self) -> &MemoryMap {
        &self.mem_map
    }

    pub fn registry(&self) -> &PageRegistry {
        &self.registry
    }

    pub(crate) fn iommu(&self) -> &dyn Iommu {
        self.iommu.as_ref()
    }

    pub(crate) fn psci(&self) -> &dyn PsciMemProtect {
        self.psci.as_ref()
    }

    pub(crate) fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// Closes module registration. Can only be done once.
    pub fn prot_finalize(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    /// Installs the callback run before an abort is injected into the host. Only one can be set.
    pub fn register_illegal_abt_notifier(&self, notifier: IllegalAbortNotifier) -> Result<()> {
        let mut installed = false;
        self.illegal_abt_notifier.call_once(|| {
            installed = true;
            notifier
        });
        if !installed {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub(crate) fn illegal_abt_notifier(&self) -> Option<IllegalAbortNotifier> {
        self.illegal_abt_notifier.get().copied()
    }

    /// Installs the module handler for host stage-2 permission faults. Only one can be set, and
    /// only before `prot_finalize()`.
    pub fn register_host_perm_fault_handler(&self, handler: PermFaultHandler) -> Result<()> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(Error::PermissionDenied);
        }
        let mut installed = false;
        self.perm_fault_handler.call_once(|| {
            installed = true;
            handler
        });
        if !installed {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub(crate) fn perm_fault_handler(&self) -> Option<PermFaultHandler> {
        self.perm_fault_handler.get().copied()
    }

    /// Maps the largest free block around the host's faulting `addr` back in.
    pub fn host_stage2_idmap(&self, addr: u64) -> Result<()> {
        self.host.lock().idmap_fault(addr)
    }

    /// Returns the host stage-2 entry translating `phys` and its level.
    pub fn host_stage2_get_leaf(&self, phys: u64) -> Result<(Pte, Level)> {
        self.host.lock().get_leaf(phys)
    }

    /// Records `owner` as the owner of `[addr, addr + size)` in the host stage-2.
    pub fn host_stage2_set_owner(&self, addr: u64, size: u64, owner: u64) -> Result<()> {
        let owner = OwnerId::new(owner).ok_or(Error::InvalidArgument)?;
        self.host.lock().set_owner_locked(addr, size, owner)
    }

    /// Checks the host's view of `[addr, addr + size)`.
    pub fn host_check_page_state(&self, addr: u64, size: u64, state: PageState) -> Result<()> {
        self.host.lock().check_page_state_range(addr, size, state)
    }

    /// Checks the hypervisor's view of `[phys, phys + size)`.
    pub fn hyp_check_page_state(&self, phys: u64, size: u64, state: PageState) -> Result<()> {
        self.hyp.lock().check_page_state_range(phys, size, state)
    }

    /// Checks a guest's view of `[ipa, ipa + size)`.
    pub fn guest_check_page_state(
        &self,
        vm: &GuestVm,
        ipa: u64,
        size: u64,
        state: PageState,
    ) -> Result<()> {
        vm.lock().check_page_state_range(ipa, size, state)
    }

    /// Returns the hypervisor VA of `phys`.
    pub fn hyp_va(&self, phys: u64) -> u64 {
        self.hyp.lock().hyp_va(phys)
    }

    /// Creates a guest. The host pages of `config.pool` are donated to the hypervisor to back the
    /// guest's stage-2 tables.
    pub fn create_guest(&self, config: GuestVmConfig) -> Result<Arc<GuestVm>> {
        let pfn = config.pool.start >> PAGE_SHIFT;
        let nr_pages = config.pool.size() >> PAGE_SHIFT;
        if nr_pages == 0 || config.pool.start & (PAGE_SIZE - 1) != 0 {
            return Err(Error::InvalidArgument);
        }
        self.host_donate_hyp(pfn, nr_pages, false)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let vm = HypPool::new(self.registry.clone(), PhysPfn::phys(pfn), nr_pages, 0)
            .map_err(Error::from)
            .and_then(|pool| GuestVm::new(handle, config, pool));
        let vm = match vm {
            Ok(vm) => Arc::new(vm),
            Err(e) => {
                warn_on_err!(self.hyp_donate_host(pfn, nr_pages))?;
                return Err(e);
            }
        };
        debug!("created guest {handle:#x}");
        self.vms.lock().insert(handle, vm.clone());
        Ok(vm)
    }

    /// Looks up a guest by handle.
    pub fn get_vm(&self, handle: u64) -> Option<Arc<GuestVm>> {
        self.vms.lock().get(&handle).cloned()
    }

    /// Tears down a guest: every page it was given goes back to the host and its table pages are
    /// returned to the host.
    ///
    /// Pages that can't be reclaimed yet (`Busy`) are left in place and the guest stays
    /// registered, so the host can retry once they have been released.
    pub fn teardown_guest(&self, handle: u64) -> Result<()> {
        let vm = self.get_vm(handle).ok_or(Error::NotFound)?;
        let pages = vm.lock().mapped_pages();
        let mut res = Ok(());
        for ipa in pages {
            if let Err(e) = self.reclaim_guest_mapping(&vm, ipa) {
                debug!("guest {handle:#x}: {ipa:#x} not reclaimed: {e:?}");
                res = res.and(Err(e));
            }
        }
        res?;

        if self.vms.lock().remove(&handle).is_none() {
            return Err(Error::NotFound);
        }
        let pool_pages = vm.lock().destroy();
        for pfn in pool_pages {
            self.hyp_donate_host(pfn.bits(), 1)?;
        }
        debug!("destroyed guest {handle:#x}");
        Ok(())
    }

    fn reclaim_guest_mapping(&self, vm: &GuestVm, ipa: u64) -> Result<()> {
        let (pte, level) = vm.lock().get_leaf(ipa)?;
        let entry = pte.decode(level);
        let Some(phys) = entry.phys() else {
            return Ok(());
        };
        let base = level.page_size().round_down(ipa);
        let order = match level {
            Level::L3 => 0,
            Level::L2 => 9,
            _ => {
                warn!("guest {:#x}: unexpected {level:?} mapping at {ipa:#x}", vm.handle());
                return Ok(());
            }
        };
        let state = entry.state().unwrap_or(PageState::OWNED) - PageState::RESTRICTED_PROT;
        if !vm.is_protected() && state == PageState::SHARED_BORROWED {
            self.host_unshare_guest(base >> PAGE_SHIFT, vm, 1 << order)
        } else {
            self.host_reclaim_page(vm, phys >> PAGE_SHIFT, base, order)
        }
    }

    /// Donates host pages to a vCPU's memcache, so the hypervisor can grow the guest's table on its
    /// behalf.
    pub fn topup_vcpu_memcache(&self, vcpu: &mut Vcpu, pfns: &[u64]) -> Result<()> {
        let (_, memcache) = vcpu.parts();
        for &pfn in pfns {
            self.host_donate_hyp(pfn, 1, false)?;
            memcache.push(PhysPfn::phys(pfn));
        }
        Ok(())
    }

    /// Returns every page left in a vCPU's memcache to the host.
    pub fn reclaim_vcpu_memcache(&self, vcpu: &mut Vcpu) -> Result<()> {
        let (_, memcache) = vcpu.parts();
        for pfn in memcache.drain() {
            self.hyp_donate_host(pfn.bits(), 1)?;
        }
        Ok(())
    }
}
