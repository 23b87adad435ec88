// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Guest requests that involve the hypervisor or no one else: hyp and FF-A shares, MMIO guards and
//! MMIO assignment.

use arm_page_tables::{Entry, LeafAttrs, Level};
use arm_pages::{PageSize, PageState, PAGE_SIZE};
use arm_regs::{fault_ipa, AbortSyndrome};
use log::trace;

use crate::guest::{default_guest_prot, GuestStage2, GuestVm, Vcpu};
use crate::hyp::{HypComponent, PAGE_HYP};
use crate::locking::{Guest, Hyp, NoLock};
use crate::mem_protect::{pfn_range, MemProtect};
use crate::{Error, Result};

// Returns true if the guest has an MMIO guard on the page containing `ipa`.
fn is_ioguard_page(guest: &GuestStage2, ipa: u64) -> bool {
    guest
        .get_leaf(ipa)
        .is_ok_and(|(pte, level)| level == Level::L3 && pte.decode(level) == Entry::MmioGuard)
}

// Checks that the MMIO guard at `ipa` can be dropped in favor of a real mapping.
fn check_removable_ioguard(vm: &GuestVm, guest: &GuestStage2, ipa: u64) -> Result<()> {
    if !vm.has_mmio_guard() || !PageSize::Size4k.is_aligned(ipa) {
        return Err(Error::InvalidArgument);
    }
    if is_ioguard_page(guest, ipa) {
        return Ok(());
    }
    let (pte, _) = guest.get_leaf(ipa)?;
    if pte.valid() {
        Err(Error::Exists)
    } else {
        Err(Error::InvalidArgument)
    }
}

impl MemProtect {
    /// Shares a guest page with the hypervisor and returns the hypervisor VA it is mapped at.
    pub fn guest_share_hyp_page(&self, vcpu: &mut Vcpu, ipa: u64) -> Result<u64> {
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(NoLock, Guest(vm), Hyp, |l| {
            let run = l.guest.request_page_transition(
                self.mem_map(),
                ipa,
                1,
                PageState::OWNED,
                memcache.nr_pages(),
            )?;
            if cfg!(feature = "el2-debug") {
                l.hyp
                    .check_page_state_range(run.phys, PAGE_SIZE, PageState::NOPAGE)?;
            }
            let attrs = LeafAttrs::new(PAGE_HYP).with_state(PageState::SHARED_BORROWED);
            l.hyp
                .create_mappings(run.phys, PAGE_SIZE, attrs)
                .map_err(|e| {
                    // Only the guest can fix a shortage of guest pages; this one is ours.
                    if e == Error::OutOfMemory {
                        Error::Busy
                    } else {
                        e
                    }
                })?;
            warn_on_err!(l.guest.initiate_page_transition(
                ipa,
                &run,
                PageState::SHARED_OWNED,
                memcache
            ))?;
            trace!("guest {:#x} shared {ipa:#x} with hyp", vm.handle());
            Ok(l.hyp.hyp_va(run.phys))
        })
    }

    /// Ends a share started with `guest_share_hyp_page()`.
    pub fn guest_unshare_hyp_page(&self, vcpu: &mut Vcpu, ipa: u64) -> Result<()> {
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(NoLock, Guest(vm), Hyp, |l| {
            let run = l.guest.request_page_transition(
                self.mem_map(),
                ipa,
                1,
                PageState::SHARED_OWNED,
                memcache.nr_pages(),
            )?;
            l.hyp
                .check_page_state_range(run.phys, PAGE_SIZE, PageState::SHARED_BORROWED)?;
            let unmapped = l.hyp.unmap(run.phys, PAGE_SIZE)?;
            warn_on!(unmapped != PAGE_SIZE);
            warn_on_err!(l
                .guest
                .initiate_page_transition(ipa, &run, PageState::OWNED, memcache))
        })
    }

    /// Marks a guest page as shared with the secure world and returns its physical address. The
    /// FF-A proxy tracks the share itself.
    pub fn guest_share_ffa_page(&self, vcpu: &mut Vcpu, ipa: u64) -> Result<u64> {
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(NoLock, Guest(vm), NoLock, |l| {
            let run = l.guest.request_page_transition(
                self.mem_map(),
                ipa,
                1,
                PageState::OWNED,
                memcache.nr_pages(),
            )?;
            l.guest
                .initiate_page_transition(ipa, &run, PageState::SHARED_OWNED, memcache)?;
            Ok(run.phys)
        })
    }

    /// Ends an FF-A share of a guest page.
    pub fn guest_unshare_ffa_page(&self, vcpu: &mut Vcpu, ipa: u64) -> Result<()> {
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(NoLock, Guest(vm), NoLock, |l| {
            let run = l.guest.request_page_transition(
                self.mem_map(),
                ipa,
                1,
                PageState::SHARED_OWNED,
                memcache.nr_pages(),
            )?;
            l.guest
                .initiate_page_transition(ipa, &run, PageState::OWNED, memcache)
        })
    }

    /// Declares up to `nr_pages` unmapped pages from `ipa` as MMIO the guest intends to access.
    /// Returns the number of pages guarded, which may be short of `nr_pages` if the walk ran out of
    /// budget.
    pub fn install_ioguard_page(&self, vcpu: &mut Vcpu, ipa: u64, nr_pages: u64) -> Result<u64> {
        let (vm, memcache) = vcpu.parts();
        if !vm.has_mmio_guard() || !PageSize::Size4k.is_aligned(ipa) {
            return Err(Error::InvalidArgument);
        }
        self.with_principals_locked(NoLock, Guest(vm), NoLock, |l| {
            let nr_guarded = l.guest.unmapped_run(ipa, nr_pages)?;
            l.guest
                .annotate(ipa, nr_guarded * PAGE_SIZE, Entry::MmioGuard, Some(memcache))?;
            Ok(nr_guarded)
        })
    }

    /// Returns true if the guest data abort described by `esr`, `hpfar` and `far` hit MMIO the
    /// guest declared. Guests without MMIO guards may access any MMIO.
    pub fn check_ioguard_page(&self, vcpu: &Vcpu, esr: u64, hpfar: u64, far: u64) -> bool {
        let syndrome = AbortSyndrome::new(esr);
        if !syndrome.is_valid_dabt() {
            return false;
        }
        let vm = vcpu.vm();
        if !vm.has_mmio_guard() {
            return true;
        }
        let ipa = fault_ipa(hpfar, far);
        let end = ipa + syndrome.access_size() - 1;
        self.with_principals_locked(NoLock, Guest(vm), NoLock, |l| {
            let mut guarded = is_ioguard_page(&l.guest, ipa);
            if PageSize::Size4k.round_down(end) != PageSize::Size4k.round_down(ipa) {
                guarded &= is_ioguard_page(&l.guest, end);
            }
            guarded
        })
    }

    /// Maps hypervisor-owned MMIO at `pfn` into the guest at `gfn`, in place of the MMIO guard the
    /// guest put there.
    pub fn install_guest_mmio(&self, vcpu: &mut Vcpu, pfn: u64, gfn: u64) -> Result<()> {
        let (phys, size) = pfn_range(pfn, 1)?;
        let (ipa, _) = pfn_range(gfn, 1)?;
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(NoLock, Guest(vm), Hyp, |l| {
            check_removable_ioguard(vm, &l.guest, ipa)?;
            l.hyp.check_page_state_range(phys, size, PageState::OWNED)?;
            l.guest.unmap(ipa, size)?;
            hyp_donate_guest(&mut l.hyp, &mut l.guest, phys, ipa, self.is_memory(phys), memcache)
        })
    }

    fn is_memory(&self, phys: u64) -> bool {
        self.mem_map().addr_is_memory(phys)
    }
}

// Moves a hypervisor-owned page into the guest. Both locks are held and the hypervisor is known to
// own the page.
fn hyp_donate_guest(
    hyp: &mut HypComponent,
    guest: &mut GuestStage2,
    phys: u64,
    ipa: u64,
    is_memory: bool,
    memcache: &mut page_tracking::HypMemcache,
) -> Result<()> {
    guest.check_page_state_range(ipa, PAGE_SIZE, PageState::NOPAGE)?;
    let unmapped = hyp.unmap(phys, PAGE_SIZE)?;
    warn_on!(unmapped != PAGE_SIZE);
    let attrs = LeafAttrs::new(default_guest_prot(is_memory));
    warn_on_err!(guest.map(ipa, PAGE_SIZE, phys, attrs, Some(memcache)))
}
