// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Boot-time check of the ownership transitions.
//!
//! A single hypervisor page is walked through every host, hypervisor and guest transition. After
//! each step the result and the state of the page as seen by each principal are compared against
//! what the transition graph allows.

use arm_pages::{PageState, PhysPfn, PAGE_SHIFT, PAGE_SIZE};
use log::info;
use thiserror::Error;

use crate::guest::{GuestVm, Vcpu};
use crate::mem_protect::MemProtect;
use crate::{Error, Result};

/// A failed self-test step.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SelftestError {
    #[error("{step}: expected {expected:?}, got {got:?}")]
    UnexpectedResult {
        step: &'static str,
        expected: Result<()>,
        got: Result<()>,
    },
    #[error("{step}: {principal} doesn't see the page as {expected}")]
    UnexpectedState {
        step: &'static str,
        principal: &'static str,
        expected: PageState,
    },
    #[error("relinquish returned {got:#x}")]
    WrongPage { got: u64 },
    #[error("the self-test guest must be protected")]
    NotProtected,
    #[error("no hypervisor page to test with")]
    NoPage,
}

type SelftestResult = core::result::Result<(), SelftestError>;

const EPERM: Result<()> = Err(Error::PermissionDenied);

/// What each principal should currently see.
struct Expected {
    host: PageState,
    hyp: PageState,
    guest: [PageState; 2],
}

struct Checker<'a> {
    mp: &'a MemProtect,
    vm: &'a GuestVm,
    phys: u64,
    ipa: u64,
    expected: Expected,
}

impl Checker<'_> {
    fn states(&self, step: &'static str) -> SelftestResult {
        let unexpected = |principal, expected| SelftestError::UnexpectedState {
            step,
            principal,
            expected,
        };
        let host = self.expected.host;
        self.mp
            .host_check_page_state(self.phys, PAGE_SIZE, host)
            .map_err(|_| unexpected("host", host))?;
        let hyp = self.expected.hyp;
        self.mp
            .hyp_check_page_state(self.phys, PAGE_SIZE, hyp)
            .map_err(|_| unexpected("hyp", hyp))?;
        let guest = self.vm.lock();
        for (i, &state) in self.expected.guest.iter().enumerate() {
            guest
                .check_page_state_range(self.ipa + i as u64 * PAGE_SIZE, PAGE_SIZE, state)
                .map_err(|_| unexpected("guest", state))?;
        }
        Ok(())
    }

    fn expect(&self, step: &'static str, got: Result<()>, expected: Result<()>) -> SelftestResult {
        if got != expected {
            return Err(SelftestError::UnexpectedResult {
                step,
                expected,
                got,
            });
        }
        self.states(step)
    }
}

impl MemProtect {
    /// Walks a page taken from the hypervisor pool through the ownership transitions, using
    /// `vcpu`'s guest as the guest principal. The guest must be protected and must not map
    /// anything at the bottom of the upper half of its IPA space.
    ///
    /// The page goes back to the pool once the test passes.
    pub fn ownership_selftest(&self, vcpu: &mut Vcpu) -> SelftestResult {
        let vm = vcpu.vm().clone();
        if !vm.is_protected() {
            return Err(SelftestError::NotProtected);
        }
        let pfn = self
            .hyp
            .lock()
            .pool_mut()
            .alloc_page()
            .ok_or(SelftestError::NoPage)?;
        let page = self.registry().get(pfn).ok_or(SelftestError::NoPage)?;
        // Transitions treat referenced host pages as pinned.
        page.ref_dec();

        let phys = pfn.bits() << PAGE_SHIFT;
        let pfn = pfn.bits();
        let ipa = 1u64 << (vm.config().ia_bits - 1);
        let gfn = ipa >> PAGE_SHIFT;
        let va = self.hyp_va(phys);
        let mut t = Checker {
            mp: self,
            vm: &vm,
            phys,
            ipa,
            expected: Expected {
                host: PageState::NOPAGE,
                hyp: PageState::OWNED,
                guest: [PageState::NOPAGE; 2],
            },
        };
        t.states("initial")?;

        // Owned by the hypervisor: the host can't do anything with it.
        t.expect("donate hyp-owned to hyp", self.host_donate_hyp(pfn, 1, false), EPERM)?;
        t.expect("share hyp-owned with hyp", self.host_share_hyp(pfn), EPERM)?;
        t.expect("unshare hyp-owned from hyp", self.host_unshare_hyp(pfn), EPERM)?;
        t.expect("share hyp-owned with ffa", self.host_share_ffa(pfn, 1), EPERM)?;
        t.expect("unshare hyp-owned from ffa", self.host_unshare_ffa(pfn, 1), EPERM)?;
        t.expect("pin hyp-owned", self.hyp_pin_shared_mem(va, va + 1), EPERM)?;
        t.expect(
            "share hyp-owned with guest",
            self.host_share_guest(pfn, gfn, vcpu, arm_page_tables::Prot::RWX, 1),
            EPERM,
        )?;
        t.expect(
            "unshare unmapped gfn",
            self.host_unshare_guest(gfn, &vm, 1),
            Err(Error::NotFound),
        )?;
        t.expect("donate hyp-owned to guest", self.host_donate_guest(pfn, gfn, vcpu, 1), EPERM)?;

        t.expected.host = PageState::OWNED;
        t.expected.hyp = PageState::NOPAGE;
        t.expect("hyp donates to host", self.hyp_donate_host(pfn, 1), Ok(()))?;

        // Owned by the host.
        t.expect("hyp donates host-owned", self.hyp_donate_host(pfn, 1), EPERM)?;
        t.expect("unshare unshared from hyp", self.host_unshare_hyp(pfn), EPERM)?;
        t.expect("unshare unshared from ffa", self.host_unshare_ffa(pfn, 1), EPERM)?;
        t.expect("pin unshared", self.hyp_pin_shared_mem(va, va + 1), EPERM)?;
        t.expect(
            "unshare unmapped gfn again",
            self.host_unshare_guest(gfn, &vm, 1),
            Err(Error::NotFound),
        )?;

        t.expected.host = PageState::SHARED_OWNED;
        t.expected.hyp = PageState::SHARED_BORROWED;
        t.expect("share with hyp", self.host_share_hyp(pfn), Ok(()))?;
        t.expect("share with hyp twice", self.host_share_hyp(pfn), EPERM)?;
        t.expect("donate hyp-shared to hyp", self.host_donate_hyp(pfn, 1, false), EPERM)?;
        t.expect("share hyp-shared with ffa", self.host_share_ffa(pfn, 1), EPERM)?;
        t.expect("hyp donates hyp-shared", self.hyp_donate_host(pfn, 1), EPERM)?;
        t.expect(
            "share hyp-shared with guest",
            self.host_share_guest(pfn, gfn, vcpu, arm_page_tables::Prot::RWX, 1),
            EPERM,
        )?;
        t.expect("donate hyp-shared to guest", self.host_donate_guest(pfn, gfn, vcpu, 1), EPERM)?;

        t.expect("pin", self.hyp_pin_shared_mem(va, va + 1), Ok(()))?;
        t.expect("pin twice", self.hyp_pin_shared_mem(va, va + 1), Ok(()))?;
        t.expect("unshare pinned", self.host_unshare_hyp(pfn), Err(Error::Busy))?;
        self.hyp_unpin_shared_mem(va, va + 1);
        t.expect("unshare still pinned", self.host_unshare_hyp(pfn), Err(Error::Busy))?;
        self.hyp_unpin_shared_mem(va, va + 1);

        t.expected.host = PageState::OWNED;
        t.expected.hyp = PageState::NOPAGE;
        t.expect("unshare from hyp", self.host_unshare_hyp(pfn), Ok(()))?;

        t.expected.host = PageState::SHARED_OWNED;
        t.expect("share with ffa", self.host_share_ffa(pfn, 1), Ok(()))?;
        t.expect("share with ffa twice", self.host_share_ffa(pfn, 1), EPERM)?;
        t.expect("share ffa-shared with hyp", self.host_share_hyp(pfn), EPERM)?;
        t.expect("donate ffa-shared to hyp", self.host_donate_hyp(pfn, 1, false), EPERM)?;
        t.expect("pin ffa-shared", self.hyp_pin_shared_mem(va, va + 1), EPERM)?;
        t.expected.host = PageState::OWNED;
        t.expect("unshare from ffa", self.host_unshare_ffa(pfn, 1), Ok(()))?;
        t.expect("unshare from ffa twice", self.host_unshare_ffa(pfn, 1), EPERM)?;

        // Shared with the guest at two IPAs.
        t.expected.host = PageState::SHARED_OWNED;
        t.expected.guest[0] = PageState::SHARED_BORROWED;
        t.expect(
            "share with guest",
            self.host_share_guest(pfn, gfn, vcpu, arm_page_tables::Prot::RWX, 1),
            Ok(()),
        )?;
        t.expect(
            "share with guest at the same gfn",
            self.host_share_guest(pfn, gfn, vcpu, arm_page_tables::Prot::RWX, 1),
            EPERM,
        )?;
        t.expect("share guest-shared with ffa", self.host_share_ffa(pfn, 1), EPERM)?;
        t.expect("share guest-shared with hyp", self.host_share_hyp(pfn), EPERM)?;
        t.expect("donate guest-shared to hyp", self.host_donate_hyp(pfn, 1, false), EPERM)?;
        t.expect("pin guest-shared", self.hyp_pin_shared_mem(va, va + 1), EPERM)?;
        t.expect(
            "donate guest-shared to guest",
            self.host_donate_guest(pfn, gfn + 1, vcpu, 1),
            EPERM,
        )?;
        t.expected.guest[1] = PageState::SHARED_BORROWED;
        t.expect(
            "share with guest at a second gfn",
            self.host_share_guest(pfn, gfn + 1, vcpu, arm_page_tables::Prot::RWX, 1),
            Ok(()),
        )?;
        t.expected.guest[0] = PageState::NOPAGE;
        t.expect("unshare first gfn", self.host_unshare_guest(gfn, &vm, 1), Ok(()))?;
        t.expected.host = PageState::OWNED;
        t.expected.guest[1] = PageState::NOPAGE;
        t.expect("unshare second gfn", self.host_unshare_guest(gfn + 1, &vm, 1), Ok(()))?;

        // Donated to the guest, then given back.
        t.expected.host = PageState::NOPAGE;
        t.expected.guest[0] = PageState::OWNED;
        t.expect("donate to guest", self.host_donate_guest(pfn, gfn, vcpu, 1), Ok(()))?;
        t.expect("donate to guest twice", self.host_donate_guest(pfn, gfn, vcpu, 1), EPERM)?;
        t.expect("share guest-owned with hyp", self.host_share_hyp(pfn), EPERM)?;
        t.expect("share guest-owned with ffa", self.host_share_ffa(pfn, 1), EPERM)?;
        t.expect("unshare guest-owned", self.host_unshare_guest(gfn, &vm, 1), EPERM)?;
        t.expect("pin guest-owned", self.hyp_pin_shared_mem(va, va + 1), EPERM)?;
        t.expected.host = PageState::OWNED;
        t.expected.guest[0] = PageState::NOPAGE;
        let relinquished = self.guest_relinquish_to_host(vcpu, ipa);
        t.expect("relinquish", relinquished.map(|_| ()), Ok(()))?;
        match relinquished {
            Ok(got) if got != phys => return Err(SelftestError::WrongPage { got }),
            _ => (),
        }

        t.expected.host = PageState::NOPAGE;
        t.expected.hyp = PageState::OWNED;
        t.expect("donate back to hyp", self.host_donate_hyp(pfn, 1, false), Ok(()))?;

        page.set_refcounted();
        self.hyp.lock().pool_mut().put_page(PhysPfn::phys(pfn));
        info!("ownership self-test passed on {phys:#x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn transitions_follow_the_graph() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(true);
        assert_eq!(env.mp.ownership_selftest(&mut vcpu), Ok(()));
        // The guest holds nothing afterwards.
        assert!(vcpu.vm().lock().mapped_pages().is_empty());
        assert_eq!(env.psci.count(), 0);
        assert_eq!(env.platform.poisoned.lock().unwrap().len(), 1);
        env.mp.teardown_guest(vcpu.vm().handle()).unwrap();
    }

    #[test]
    fn needs_a_protected_guest() {
        let env = TestEnv::new();
        let mut vcpu = env.vcpu(false);
        assert_eq!(
            env.mp.ownership_selftest(&mut vcpu),
            Err(SelftestError::NotProtected)
        );
    }
}
