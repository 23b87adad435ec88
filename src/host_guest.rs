// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Transitions between the host and its guests.
//!
//! Guests request shares of their own pages with the host; the host donates or shares pages with
//! guests and reclaims them when the guest goes away. Both sides are always checked under the host
//! and guest locks before either is changed.

use arm_page_tables::{Entry, LeafAttrs, Prot};
use arm_pages::{OwnerId, PageSize, PageState, PAGE_SIZE};
use log::{error, trace, warn};

use crate::guest::{default_guest_prot, GuestVm, Vcpu};
use crate::locking::{Guest, Host, NoLock};
use crate::mem_protect::{pfn_range, MemProtect};
use crate::{Error, Result};

/// One physically contiguous chunk of a scatter-gather donation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SglistEntry {
    pub pfn: u64,
    pub gfn: u64,
    /// log2 of the number of pages in the chunk.
    pub order: u32,
}

impl SglistEntry {
    fn ranges(&self) -> Result<(u64, u64, u64)> {
        let nr_pages = 1u64
            .checked_shl(self.order)
            .ok_or(Error::InvalidArgument)?;
        let (phys, size) = pfn_range(self.pfn, nr_pages)?;
        let (ipa, _) = pfn_range(self.gfn, nr_pages)?;
        Ok((phys, ipa, size))
    }
}

impl MemProtect {
    /// Shares up to `nr_pages` guest pages from `ipa` with the host. Returns the number of pages
    /// actually shared, which is less than requested if the pages aren't physically contiguous.
    pub fn guest_share_host(&self, vcpu: &mut Vcpu, ipa: u64, nr_pages: u64) -> Result<u64> {
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(Host, Guest(vm), NoLock, |l| {
            let run = l.guest.request_page_transition(
                self.mem_map(),
                ipa,
                nr_pages,
                PageState::OWNED,
                memcache.nr_pages(),
            )?;
            let size = run.nr_pages * PAGE_SIZE;
            l.host
                .check_page_state_range(run.phys, size, PageState::NOPAGE)?;
            warn_on_err!(l.guest.initiate_page_transition(
                ipa,
                &run,
                PageState::SHARED_OWNED,
                memcache
            ))?;
            warn_on_err!(l
                .host
                .set_page_state_range(run.phys, size, PageState::SHARED_BORROWED))?;
            self.psci().dec(run.nr_pages);
            trace!("guest {:#x} shared {ipa:#x}+{size:#x} with host", vm.handle());
            Ok(run.nr_pages)
        })
    }

    /// Takes back pages the guest shared with the host. Returns the number of pages unshared.
    pub fn guest_unshare_host(&self, vcpu: &mut Vcpu, ipa: u64, nr_pages: u64) -> Result<u64> {
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(Host, Guest(vm), NoLock, |l| {
            let run = l.guest.request_page_transition(
                self.mem_map(),
                ipa,
                nr_pages,
                PageState::SHARED_OWNED,
                memcache.nr_pages(),
            )?;
            let size = run.nr_pages * PAGE_SIZE;
            l.host
                .check_page_state_range(run.phys, size, PageState::SHARED_BORROWED)?;
            warn_on_err!(l
                .guest
                .initiate_page_transition(ipa, &run, PageState::OWNED, memcache))?;
            self.psci().inc(run.nr_pages);
            warn_on_err!(l.host.set_owner_locked(run.phys, size, OwnerId::GUEST))?;
            Ok(run.nr_pages)
        })
    }

    /// Shares `nr_pages` host pages with a guest at `gfn`, mapped with `prot`. A page may be shared
    /// with several guests at once.
    pub fn host_share_guest(
        &self,
        pfn: u64,
        gfn: u64,
        vcpu: &mut Vcpu,
        prot: Prot,
        nr_pages: u64,
    ) -> Result<()> {
        if !(prot - Prot::RWX).is_empty() {
            return Err(Error::InvalidArgument);
        }
        let (phys, size) = pfn_range(pfn, nr_pages)?;
        let (ipa, _) = pfn_range(gfn, nr_pages)?;
        self.mem_map()
            .check_range_allowed_memory(phys, phys + size)?;
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(Host, Guest(vm), NoLock, |l| {
            l.guest.check_page_state_range(ipa, size, PageState::NOPAGE)?;
            for page in self.registry().range(phys, phys + size) {
                let page = page.ok_or(Error::InvalidArgument)?;
                let state = page.host_state();
                let shareable = (state == PageState::OWNED && page.refcount() == 0)
                    || (state == PageState::SHARED_OWNED && page.share_guest_count() > 0);
                if !shareable {
                    return Err(Error::PermissionDenied);
                }
            }
            let attrs = LeafAttrs::new(prot).with_state(PageState::SHARED_BORROWED);
            if let Err(e) = l.guest.map(ipa, size, phys, attrs, Some(memcache)) {
                let _ = warn_on_err!(l.guest.unmap(ipa, size));
                return Err(e);
            }
            for page in self.registry().range(phys, phys + size).flatten() {
                page.set_host_state(PageState::SHARED_OWNED);
                page.inc_share_guest_count();
            }
            Ok(())
        })
    }

    /// Removes a page or block the host shared with `vm` at `gfn`. The host gets exclusive
    /// ownership back once no guest shares the page anymore.
    pub fn host_unshare_guest(&self, gfn: u64, vm: &GuestVm, nr_pages: u64) -> Result<()> {
        let (ipa, size) = pfn_range(gfn, nr_pages)?;
        if size != PAGE_SIZE && size != PageSize::Size2M as u64 {
            return Err(Error::InvalidArgument);
        }
        if ipa & (size - 1) != 0 {
            return Err(Error::InvalidArgument);
        }
        self.with_principals_locked(Host, Guest(vm), NoLock, |l| {
            let (pte, level) = l.guest.get_leaf(ipa)?;
            let entry = pte.decode(level);
            let Some(attrs) = entry.attrs() else {
                return Err(Error::NotFound);
            };
            if level.granule() != size {
                return Err(Error::TooBig);
            }
            if attrs.state - PageState::RESTRICTED_PROT != PageState::SHARED_BORROWED {
                return Err(Error::PermissionDenied);
            }
            let phys = entry.phys().ok_or(Error::NotFound)?;
            for page in self.registry().range(phys, phys + size) {
                let page = page.ok_or(Error::InvalidArgument)?;
                if page.host_state() != PageState::SHARED_OWNED {
                    return Err(Error::PermissionDenied);
                }
                if warn_on!(page.share_guest_count() == 0) {
                    return Err(Error::InvalidArgument);
                }
            }
            let unmapped = l.guest.unmap(ipa, size)?;
            warn_on!(unmapped != size);
            for page in self.registry().range(phys, phys + size).flatten() {
                if page.dec_share_guest_count() == 0 {
                    page.set_host_state(PageState::OWNED);
                }
            }
            Ok(())
        })
    }

    /// Gives `nr_pages` host pages to a guest at `gfn`.
    pub fn host_donate_guest(&self, pfn: u64, gfn: u64, vcpu: &mut Vcpu, nr_pages: u64) -> Result<()> {
        let (phys, size) = pfn_range(pfn, nr_pages)?;
        let (ipa, _) = pfn_range(gfn, nr_pages)?;
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(Host, Guest(vm), NoLock, |l| {
            l.host.check_page_state_range(phys, size, PageState::OWNED)?;
            l.guest.check_page_state_range(ipa, size, PageState::NOPAGE)?;

            let is_memory = self.mem_map().range_is_memory(phys, phys + size);
            if is_memory {
                self.iommu().host_stage2_idmap(phys, phys + size, Prot::empty());
                self.iommu().host_stage2_idmap_complete(false);
            }
            warn_on_err!(l.host.set_owner_inner(
                phys,
                size,
                OwnerId::GUEST,
                is_memory,
                PageState::empty(),
                false
            ))?;
            self.psci().inc(nr_pages);

            let mut res = Ok(());
            if vm.ipa_range_has_pvmfw(ipa, ipa + size) {
                res = warn_on_err!(self.platform().load_pvmfw_pages(ipa, phys, size));
            }
            if res.is_ok() {
                let attrs = LeafAttrs::new(default_guest_prot(is_memory));
                res = l.guest.map(ipa, size, phys, attrs, Some(memcache));
                if res.is_err() {
                    let _ = warn_on_err!(l.guest.unmap(ipa, size));
                }
            }
            if let Err(e) = res {
                self.psci().dec(nr_pages);
                warn_on_err!(l.host.set_owner_locked(phys, size, OwnerId::HOST))?;
                return Err(e);
            }
            Ok(())
        })
    }

    /// Donates a scatter-gather list of host chunks to a guest. Either every chunk is donated or,
    /// if any fails the checks, none is.
    pub fn host_donate_sglist_guest(&self, vcpu: &mut Vcpu, sglist: &[SglistEntry]) -> Result<()> {
        let Some(first) = sglist.first() else {
            return Err(Error::InvalidArgument);
        };
        let (first_phys, _, _) = first.ranges()?;
        let is_memory = self.mem_map().addr_is_memory(first_phys);
        let (vm, memcache) = vcpu.parts();
        self.with_principals_locked(Host, Guest(vm), NoLock, |l| {
            for sg in sglist {
                let (phys, ipa, size) = sg.ranges()?;
                if self.mem_map().range_is_memory(phys, phys + size) != is_memory {
                    return Err(Error::InvalidArgument);
                }
                l.host.check_page_state_range(phys, size, PageState::OWNED)?;
                l.guest.check_page_state_range(ipa, size, PageState::NOPAGE)?;
            }

            for sg in sglist {
                let (phys, ipa, size) = sg.ranges()?;
                if is_memory {
                    self.iommu().host_stage2_idmap(phys, phys + size, Prot::empty());
                }
                warn_on_err!(l.host.set_owner_inner(
                    phys,
                    size,
                    OwnerId::GUEST,
                    is_memory,
                    PageState::empty(),
                    false
                ))?;
                self.psci().inc(size / PAGE_SIZE);
                let attrs = LeafAttrs::new(default_guest_prot(is_memory));
                warn_on_err!(l.guest.map(ipa, size, phys, attrs, Some(&mut *memcache)))?;
            }
            if is_memory {
                self.iommu().host_stage2_idmap_complete(false);
            }
            Ok(())
        })
    }

    /// Lets a protected guest give the page at `ipa` back to the host. Returns the physical address
    /// of the page, or 0 if there was nothing to give back.
    pub fn guest_relinquish_to_host(&self, vcpu: &mut Vcpu, ipa: u64) -> Result<u64> {
        let (vm, memcache) = vcpu.parts();
        if !vm.is_protected() {
            return Ok(0);
        }
        let ipa = PageSize::Size4k.round_down(ipa);
        self.with_principals_locked(Host, Guest(vm), NoLock, |l| {
            let (pte, level) = l.guest.get_leaf(ipa)?;
            let entry = pte.decode(level);
            let Some(block_phys) = entry.phys() else {
                return Ok(0);
            };
            if l
                .guest
                .check_page_state_range(ipa, PAGE_SIZE, PageState::OWNED)
                .is_err()
            {
                return Err(Error::PermissionDenied);
            }
            let phys = block_phys + (ipa - level.page_size().round_down(ipa));
            if !self.mem_map().range_is_allowed_memory(phys, phys + PAGE_SIZE) {
                return Err(Error::InvalidArgument);
            }
            l.guest.annotate(ipa, PAGE_SIZE, Entry::Empty, Some(memcache))?;
            self.platform().poison_page(phys, PAGE_SIZE);
            self.psci().dec(1);
            warn_on_err!(l.host.set_owner_locked(phys, PAGE_SIZE, OwnerId::HOST))?;
            Ok(phys)
        })
    }

    /// Takes the `1 << order` pages at `pfn`, mapped by `vm` at `ipa`, back from a guest that is
    /// being torn down.
    pub fn host_reclaim_page(&self, vm: &GuestVm, pfn: u64, ipa: u64, order: u32) -> Result<()> {
        let nr_pages = 1u64.checked_shl(order).ok_or(Error::InvalidArgument)?;
        let (phys, size) = pfn_range(pfn, nr_pages)?;
        self.with_principals_locked(Host, Guest(vm), NoLock, |l| {
            let (leaf_phys, entry) = l.guest.get_valid_leaf(ipa, order)?;
            if leaf_phys != phys {
                return Err(Error::InvalidArgument);
            }
            let state = entry.state().unwrap_or(PageState::OWNED);
            let mut still_shared = false;
            if state == PageState::OWNED {
                let _ = warn_on_err!(l.host.check_page_state_range(phys, size, PageState::NOPAGE));
                if self.mem_map().addr_is_memory(phys) {
                    self.platform().poison_page(phys, size);
                }
                self.psci().dec(nr_pages);
            } else if state == PageState::SHARED_BORROWED {
                let _ = warn_on_err!(l.host.check_page_state_range(
                    phys,
                    size,
                    PageState::SHARED_OWNED
                ));
                // Other guests may still be sharing the page.
                for page in self.registry().range(phys, phys + size).flatten() {
                    if page.share_guest_count() > 0 && page.dec_share_guest_count() > 0 {
                        still_shared = true;
                    }
                }
            } else if state == PageState::SHARED_OWNED {
                if l
                    .host
                    .check_page_state_range(phys, size, PageState::SHARED_BORROWED)
                    .is_err()
                {
                    return Err(Error::Busy);
                }
            } else {
                error!("guest {:#x}: reclaiming {ipa:#x} in state {state}", vm.handle());
                panic!("unexpected guest page state {state} on reclaim");
            }
            let unmapped = l.guest.unmap(ipa, size)?;
            warn_on!(unmapped != size);
            if still_shared {
                return Ok(());
            }
            warn_on_err!(l.host.set_owner_locked(phys, size, OwnerId::HOST))
        })
    }

    /// Returns the physical address backing `ipa` in `vm` if it is mapped by a `1 << order` page
    /// leaf.
    pub fn guest_get_valid_phys_page(&self, vm: &GuestVm, ipa: u64, order: u32) -> Result<u64> {
        let (phys, _) = vm.lock().get_valid_leaf(ipa, order)?;
        Ok(phys)
    }

    /// Relaxes the permissions of a page the host shared with a non-protected guest.
    pub fn host_relax_perms_guest(&self, gfn: u64, vcpu: &Vcpu, prot: Prot) -> Result<()> {
        if !(prot - Prot::RWX).is_empty() {
            return Err(Error::InvalidArgument);
        }
        let vm = self.unprotected(vcpu.vm())?;
        let (ipa, _) = pfn_range(gfn, 1)?;
        self.with_principals_locked(NoLock, Guest(vm), NoLock, |l| l.guest.relax_perms(ipa, prot))
    }

    /// Removes write access from pages the host shared with a non-protected guest.
    pub fn host_wrprotect_guest(&self, gfn: u64, vm: &GuestVm, nr_pages: u64) -> Result<()> {
        let vm = self.unprotected(vm)?;
        let (ipa, size) = pfn_range(gfn, nr_pages)?;
        self.with_principals_locked(NoLock, Guest(vm), NoLock, |l| l.guest.wrprotect(ipa, size))
    }

    /// Tests (and clears, if `mkold` is set) the access flag over a range of a non-protected guest.
    pub fn host_test_clear_young_guest(
        &self,
        gfn: u64,
        nr_pages: u64,
        mkold: bool,
        vm: &GuestVm,
    ) -> Result<bool> {
        let vm = self.unprotected(vm)?;
        let (ipa, size) = pfn_range(gfn, nr_pages)?;
        self.with_principals_locked(NoLock, Guest(vm), NoLock, |l| {
            l.guest.test_clear_young(ipa, size, mkold)
        })
    }

    /// Sets the access flag of a page of a non-protected guest.
    pub fn host_mkyoung_guest(&self, gfn: u64, vcpu: &Vcpu) -> Result<()> {
        let vm = self.unprotected(vcpu.vm())?;
        let (ipa, _) = pfn_range(gfn, 1)?;
        self.with_principals_locked(NoLock, Guest(vm), NoLock, |l| {
            l.guest.mkyoung(ipa).map(|_| ())
        })
    }

    fn unprotected<'v>(&self, vm: &'v GuestVm) -> Result<&'v GuestVm> {
        if vm.is_protected() {
            warn!("host tried to manage protected guest {:#x}", vm.handle());
            return Err(Error::PermissionDenied);
        }
        Ok(vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use alloc::vec::Vec;
    use arm_page_tables::Level;
    use page_tracking::MemRange;

    const GFN: u64 = 0x100;
    const IPA: u64 = GFN << 12;

    #[test]
    fn donate_then_guest_shares_back() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(true);
        let pfn = host_pfn(0);
        let phys = pfn << PAGE_SHIFT;

        mp.host_donate_guest(pfn, GFN, &mut vcpu, 2).unwrap();
        assert_eq!(
            mp.host_check_page_state(phys, 2 * PAGE_SIZE, PageState::NOPAGE),
            Ok(())
        );
        assert!(guest_state_is(vcpu.vm(), IPA, PageState::OWNED));
        assert_one_owner(mp, phys, &[(vcpu.vm(), IPA)]);
        assert!(env.iommu.unmapped(phys));
        assert_eq!(env.psci.count(), 2);
        // The host can't give the same page away twice.
        let mut other = env.vcpu(true);
        assert_eq!(
            mp.host_donate_guest(pfn, GFN, &mut other, 1),
            Err(Error::PermissionDenied)
        );

        assert_eq!(mp.guest_share_host(&mut vcpu, IPA, 2), Ok(2));
        assert!(guest_state_is(vcpu.vm(), IPA + PAGE_SIZE, PageState::SHARED_OWNED));
        assert_eq!(
            mp.host_check_page_state(phys, 2 * PAGE_SIZE, PageState::SHARED_BORROWED),
            Ok(())
        );
        assert_one_owner(mp, phys, &[(vcpu.vm(), IPA)]);
        assert_eq!(env.psci.count(), 0);
        // Already shared.
        assert_eq!(
            mp.guest_share_host(&mut vcpu, IPA, 1),
            Err(Error::PermissionDenied)
        );

        assert_eq!(mp.guest_unshare_host(&mut vcpu, IPA, 1), Ok(1));
        assert!(guest_state_is(vcpu.vm(), IPA, PageState::OWNED));
        assert!(guest_state_is(vcpu.vm(), IPA + PAGE_SIZE, PageState::SHARED_OWNED));
        assert_eq!(
            mp.host_check_page_state(phys, PAGE_SIZE, PageState::NOPAGE),
            Ok(())
        );
        assert_eq!(env.psci.count(), 1);
    }

    #[test]
    fn share_of_unmapped_ipa_faults() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(true);
        assert_eq!(
            env.mp.guest_share_host(&mut vcpu, IPA, 1),
            Err(Error::Fault)
        );
    }

    #[test]
    fn pvmfw_is_loaded_on_donation() {
        let env = TestEnv::new();
        let mut config = env.guest_config(true);
        config.pvmfw = Some(MemRange::new(IPA, IPA + 4 * PAGE_SIZE));
        let mut vcpu = env.vcpu_with(config);
        let pfn = host_pfn(8);
        env.mp.host_donate_guest(pfn, GFN + 1, &mut vcpu, 1).unwrap();
        env.mp.host_donate_guest(pfn + 1, GFN + 8, &mut vcpu, 1).unwrap();
        let loads = env.platform.pvmfw_loads.lock().unwrap().clone();
        assert_eq!(loads, vec![(IPA + PAGE_SIZE, pfn << PAGE_SHIFT, PAGE_SIZE)]);
    }

    #[test]
    fn share_with_several_guests() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut a = env.vcpu(false);
        let mut b = env.vcpu(false);
        let pfn = host_pfn(16);
        let phys = pfn << PAGE_SHIFT;

        assert_eq!(
            mp.host_share_guest(pfn, GFN, &mut a, Prot::RWX | Prot::DEVICE, 1),
            Err(Error::InvalidArgument)
        );
        mp.host_share_guest(pfn, GFN, &mut a, Prot::RW, 1).unwrap();
        mp.host_share_guest(pfn, GFN + 1, &mut b, Prot::RWX, 1).unwrap();
        assert_eq!(
            mp.host_check_page_state(phys, PAGE_SIZE, PageState::SHARED_OWNED),
            Ok(())
        );
        assert_eq!(mp.registry().get_by_addr(phys).unwrap().share_guest_count(), 2);
        assert_one_owner(mp, phys, &[(a.vm(), IPA), (b.vm(), IPA + PAGE_SIZE)]);
        assert!(guest_state_is(
            a.vm(),
            IPA,
            PageState::SHARED_BORROWED | PageState::RESTRICTED_PROT
        ));
        // Same IPA twice.
        assert_eq!(
            mp.host_share_guest(pfn, GFN, &mut a, Prot::RW, 1),
            Err(Error::PermissionDenied)
        );
        // Shared pages can't be donated.
        assert_eq!(
            mp.host_donate_hyp(pfn, 1, false),
            Err(Error::PermissionDenied)
        );

        mp.host_unshare_guest(GFN, a.vm(), 1).unwrap();
        assert_eq!(
            mp.host_check_page_state(phys, PAGE_SIZE, PageState::SHARED_OWNED),
            Ok(())
        );
        assert_eq!(
            mp.host_unshare_guest(GFN, a.vm(), 1),
            Err(Error::NotFound)
        );
        mp.host_unshare_guest(GFN + 1, b.vm(), 1).unwrap();
        assert_eq!(
            mp.host_check_page_state(phys, PAGE_SIZE, PageState::OWNED),
            Ok(())
        );
    }

    #[test]
    fn round_trips_restore_the_registry() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(true);
        let vm = vcpu.vm().clone();
        let pfn = host_pfn(60);
        let phys = pfn << PAGE_SHIFT;
        let before = snapshot(mp, phys);

        mp.host_donate_guest(pfn, GFN, &mut vcpu, 1).unwrap();
        assert_one_owner(mp, phys, &[(&vm, IPA)]);
        assert_eq!(mp.guest_share_host(&mut vcpu, IPA, 1), Ok(1));
        assert_one_owner(mp, phys, &[(&vm, IPA)]);
        assert_eq!(mp.guest_unshare_host(&mut vcpu, IPA, 1), Ok(1));
        mp.host_reclaim_page(&vm, pfn, IPA, 0).unwrap();
        assert_one_owner(mp, phys, &[(&vm, IPA)]);
        assert_eq!(snapshot(mp, phys), before);

        let mut other = env.vcpu(false);
        let other_vm = other.vm().clone();
        mp.host_share_guest(pfn, GFN, &mut other, Prot::R, 1).unwrap();
        mp.host_share_guest(pfn, GFN + 1, &mut vcpu, Prot::RW, 1).unwrap();
        assert_one_owner(mp, phys, &[(&other_vm, IPA), (&vm, IPA + PAGE_SIZE)]);
        assert_eq!(snapshot(mp, phys).share_guest_count, 2);
        mp.host_unshare_guest(GFN, &other_vm, 1).unwrap();
        mp.host_reclaim_page(&vm, pfn, IPA + PAGE_SIZE, 0).unwrap();
        assert_one_owner(mp, phys, &[(&other_vm, IPA), (&vm, IPA + PAGE_SIZE)]);
        assert_eq!(snapshot(mp, phys), before);
    }

    #[test]
    fn share_guest_rejections() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(false);
        assert_eq!(
            mp.host_share_guest(NOMAP_BASE >> PAGE_SHIFT, GFN, &mut vcpu, Prot::RW, 1),
            Err(Error::PermissionDenied)
        );
        assert_eq!(
            mp.host_share_guest(MMIO_BASE >> PAGE_SHIFT, GFN, &mut vcpu, Prot::RW, 1),
            Err(Error::PermissionDenied)
        );
        let last = (RAM_BASE + RAM_SIZE) >> PAGE_SHIFT;
        assert_eq!(
            mp.host_share_guest(last - 1, GFN, &mut vcpu, Prot::RW, 2),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            mp.host_share_guest(u64::MAX, GFN, &mut vcpu, Prot::RW, 1),
            Err(Error::InvalidArgument)
        );
        // Pinned for DMA.
        let pfn = host_pfn(3);
        mp.host_use_dma(pfn << PAGE_SHIFT, PAGE_SIZE).unwrap();
        assert_eq!(
            mp.host_share_guest(pfn, GFN, &mut vcpu, Prot::RW, 1),
            Err(Error::PermissionDenied)
        );
    }

    #[test]
    fn share_failing_for_table_pages_is_rolled_back() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(false);
        // Each share in a fresh 1GiB region takes new table pages until the guest runs dry.
        let mut gfn = 0;
        let mut pfn = host_pfn(0);
        let err = loop {
            match mp.host_share_guest(pfn, gfn, &mut vcpu, Prot::RW, 1) {
                Ok(()) => {
                    gfn += 1 << 18;
                    pfn += 1;
                }
                Err(e) => break e,
            }
        };
        assert_eq!(err, Error::OutOfMemory);
        let phys = pfn << PAGE_SHIFT;
        assert_eq!(mp.host_check_page_state(phys, PAGE_SIZE, PageState::OWNED), Ok(()));
        assert_eq!(snapshot(mp, phys).share_guest_count, 0);
        assert!(guest_state_is(vcpu.vm(), gfn << PAGE_SHIFT, PageState::NOPAGE));
        assert!(!vcpu.vm().lock().mapped_pages().contains(&(gfn << PAGE_SHIFT)));
        assert_one_owner(mp, phys, &[]);
    }

    #[test]
    fn unshare_guest_block() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(false);
        let pfn = (HOST_RAM + 0x20_0000) >> PAGE_SHIFT;
        let gfn = 0x200;
        mp.host_share_guest(pfn, gfn, &mut vcpu, Prot::RWX, 512).unwrap();
        let (_, level) = vcpu.vm().lock().get_leaf(gfn << PAGE_SHIFT).unwrap();
        assert_eq!(level, Level::L2);
        assert_eq!(mp.host_unshare_guest(gfn, vcpu.vm(), 3), Err(Error::InvalidArgument));
        assert_eq!(mp.host_unshare_guest(gfn, vcpu.vm(), 1), Err(Error::TooBig));
        mp.host_unshare_guest(gfn, vcpu.vm(), 512).unwrap();
        assert_eq!(
            mp.host_check_page_state(pfn << PAGE_SHIFT, 0x20_0000, PageState::OWNED),
            Ok(())
        );
    }

    #[test]
    fn relinquish_returns_page_to_host() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(true);
        let pfn = host_pfn(20);
        let phys = pfn << PAGE_SHIFT;
        mp.host_donate_guest(pfn, GFN, &mut vcpu, 1).unwrap();
        assert_eq!(mp.guest_relinquish_to_host(&mut vcpu, IPA + 0x123), Ok(phys));
        assert!(guest_state_is(vcpu.vm(), IPA, PageState::NOPAGE));
        assert_eq!(
            mp.host_check_page_state(phys, PAGE_SIZE, PageState::OWNED),
            Ok(())
        );
        assert_eq!(
            env.platform.poisoned.lock().unwrap().clone(),
            vec![(phys, PAGE_SIZE)]
        );
        assert_eq!(env.psci.count(), 0);
        // Nothing left to give back.
        assert_eq!(mp.guest_relinquish_to_host(&mut vcpu, IPA), Ok(0));

        mp.host_donate_guest(pfn, GFN, &mut vcpu, 1).unwrap();
        mp.guest_share_host(&mut vcpu, IPA, 1).unwrap();
        assert_eq!(
            mp.guest_relinquish_to_host(&mut vcpu, IPA),
            Err(Error::PermissionDenied)
        );

        let mut unprotected = env.vcpu(false);
        assert_eq!(mp.guest_relinquish_to_host(&mut unprotected, IPA), Ok(0));
    }

    #[test]
    fn reclaim_by_state() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(true);
        let pfn = host_pfn(24);
        let phys = pfn << PAGE_SHIFT;

        mp.host_donate_guest(pfn, GFN, &mut vcpu, 2).unwrap();
        mp.guest_share_host(&mut vcpu, IPA + PAGE_SIZE, 1).unwrap();
        let vm = vcpu.vm().clone();
        assert_eq!(
            mp.host_reclaim_page(&vm, pfn + 1, IPA, 0),
            Err(Error::InvalidArgument)
        );

        mp.host_reclaim_page(&vm, pfn, IPA, 0).unwrap();
        assert_eq!(
            mp.host_check_page_state(phys, PAGE_SIZE, PageState::OWNED),
            Ok(())
        );
        mp.host_reclaim_page(&vm, pfn + 1, IPA + PAGE_SIZE, 0)
            .unwrap();
        assert_eq!(
            mp.host_check_page_state(phys + PAGE_SIZE, PAGE_SIZE, PageState::OWNED),
            Ok(())
        );
        assert!(guest_state_is(&vm, IPA + PAGE_SIZE, PageState::NOPAGE));
        assert_eq!(env.psci.count(), 0);
        assert_eq!(env.platform.poisoned.lock().unwrap().len(), 1);
        assert_eq!(mp.host_reclaim_page(&vm, pfn, IPA, 0), Err(Error::NotFound));
    }

    #[test]
    fn sglist_is_all_or_nothing() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(true);
        let base = host_pfn(32);
        let sglist = [
            SglistEntry { pfn: base, gfn: GFN, order: 1 },
            SglistEntry { pfn: base + 4, gfn: GFN + 2, order: 0 },
        ];
        mp.host_share_hyp(base + 4).unwrap();
        assert_eq!(
            mp.host_donate_sglist_guest(&mut vcpu, &sglist),
            Err(Error::PermissionDenied)
        );
        assert_eq!(
            mp.host_check_page_state(base << PAGE_SHIFT, 2 * PAGE_SIZE, PageState::OWNED),
            Ok(())
        );
        mp.host_unshare_hyp(base + 4).unwrap();

        let mixed = [
            sglist[0],
            SglistEntry { pfn: MMIO_BASE >> PAGE_SHIFT, gfn: GFN + 2, order: 0 },
        ];
        assert_eq!(
            mp.host_donate_sglist_guest(&mut vcpu, &mixed),
            Err(Error::InvalidArgument)
        );

        mp.host_donate_sglist_guest(&mut vcpu, &sglist).unwrap();
        for ipa in [IPA, IPA + PAGE_SIZE, IPA + 2 * PAGE_SIZE] {
            assert!(guest_state_is(vcpu.vm(), ipa, PageState::OWNED));
        }
        assert_eq!(env.psci.count(), 3);
    }

    #[test]
    fn nonprotected_helpers() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(false);
        let pfn = host_pfn(40);
        mp.host_share_guest(pfn, GFN, &mut vcpu, Prot::R, 1).unwrap();
        mp.host_relax_perms_guest(GFN, &vcpu, Prot::RW).unwrap();
        assert_eq!(
            vcpu.vm().lock().get_leaf(IPA).map(|(pte, l)| pte.decode(l).prot()),
            Ok(Some(Prot::RW))
        );
        mp.host_wrprotect_guest(GFN, vcpu.vm(), 1).unwrap();
        assert_eq!(
            vcpu.vm().lock().get_leaf(IPA).map(|(pte, l)| pte.decode(l).prot()),
            Ok(Some(Prot::R))
        );
        assert_eq!(mp.host_test_clear_young_guest(GFN, 1, true, vcpu.vm()), Ok(true));
        assert_eq!(mp.host_test_clear_young_guest(GFN, 1, false, vcpu.vm()), Ok(false));
        mp.host_mkyoung_guest(GFN, &vcpu).unwrap();
        assert_eq!(mp.host_test_clear_young_guest(GFN, 1, false, vcpu.vm()), Ok(true));

        let protected = env.vcpu(true);
        assert_eq!(
            mp.host_mkyoung_guest(GFN, &protected),
            Err(Error::PermissionDenied)
        );
        assert_eq!(
            mp.host_relax_perms_guest(GFN, &vcpu, Prot::DEVICE),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn teardown_returns_everything() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let mut vcpu = env.vcpu(true);
        let handle = vcpu.vm().handle();
        let pool = vcpu.vm().config().pool;
        let base = host_pfn(48);
        mp.host_donate_guest(base, GFN, &mut vcpu, 4).unwrap();
        mp.guest_share_host(&mut vcpu, IPA, 1).unwrap();
        mp.topup_vcpu_memcache(&mut vcpu, &[base + 8, base + 9]).unwrap();
        mp.reclaim_vcpu_memcache(&mut vcpu).unwrap();
        mp.teardown_guest(handle).unwrap();

        assert!(mp.get_vm(handle).is_none());
        let pages: Vec<u64> = (0..4).map(|i| (base + i) << PAGE_SHIFT).collect();
        for phys in pages {
            assert_eq!(
                mp.host_check_page_state(phys, PAGE_SIZE, PageState::OWNED),
                Ok(())
            );
        }
        assert_eq!(
            mp.host_check_page_state(pool.start, pool.size(), PageState::OWNED),
            Ok(())
        );
        assert_eq!(env.psci.count(), 0);
        assert_eq!(mp.teardown_guest(handle), Err(Error::NotFound));
    }
}
