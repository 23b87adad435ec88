// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Transitions between the host and the hypervisor.

use arm_page_tables::{LeafAttrs, Prot};
use arm_pages::{OwnerId, PageSize, PageState};
use log::{debug, warn};

use crate::hyp::{default_hyp_prot, PAGE_HYP};
use crate::locking::{Host, Hyp, NoLock};
use crate::mem_protect::{pfn_range, MemProtect};
use crate::{Error, Result};

impl MemProtect {
    /// Shares a host page with the hypervisor. The host keeps ownership; the hypervisor maps the
    /// page in its linear map.
    pub fn host_share_hyp(&self, pfn: u64) -> Result<()> {
        let (addr, size) = pfn_range(pfn, 1)?;
        self.with_principals_locked(Host, NoLock, Hyp, |l| {
            l.host.check_page_state_range(addr, size, PageState::OWNED)?;
            if cfg!(feature = "el2-debug") {
                l.hyp.check_page_state_range(addr, size, PageState::NOPAGE)?;
            }
            let attrs = LeafAttrs::new(PAGE_HYP).with_state(PageState::SHARED_BORROWED);
            if let Err(e) = l.hyp.create_mappings(addr, size, attrs) {
                if e != Error::OutOfMemory {
                    warn!("hyp mapping of shared page {addr:#x} failed: {e:?}");
                }
                let _ = warn_on_err!(l.hyp.unmap(addr, size));
                return Err(e);
            }
            warn_on_err!(l
                .host
                .set_page_state_range(addr, size, PageState::SHARED_OWNED))
        })
    }

    /// Stops sharing a host page with the hypervisor. Fails with `Busy` while the hypervisor still
    /// has it pinned.
    pub fn host_unshare_hyp(&self, pfn: u64) -> Result<()> {
        let (addr, size) = pfn_range(pfn, 1)?;
        self.with_principals_locked(Host, NoLock, Hyp, |l| {
            l.host
                .check_page_state_range(addr, size, PageState::SHARED_OWNED)?;
            l.hyp
                .check_page_state_range(addr, size, PageState::SHARED_BORROWED)?;
            let page = self
                .registry()
                .get_by_addr(addr)
                .ok_or(Error::InvalidArgument)?;
            if page.refcount() != 0 {
                return Err(Error::Busy);
            }
            let unmapped = l.hyp.unmap(addr, size)?;
            warn_on!(unmapped != size);
            warn_on_err!(l.host.set_page_state_range(addr, size, PageState::OWNED))
        })
    }

    /// Gives `nr_pages` host pages to the hypervisor, mapped with the default hypervisor
    /// permissions. MMIO is only accepted if `accept_mmio` is set.
    pub fn host_donate_hyp(&self, pfn: u64, nr_pages: u64, accept_mmio: bool) -> Result<()> {
        let (addr, size) = pfn_range(pfn, nr_pages)?;
        let prot = default_hyp_prot(self.mem_map().range_is_memory(addr, addr + size));
        self.host_donate_hyp_prot(pfn, nr_pages, accept_mmio, prot)
    }

    /// As `host_donate_hyp()`, with the hypervisor mapping the pages with `prot`.
    pub fn host_donate_hyp_prot(
        &self,
        pfn: u64,
        nr_pages: u64,
        accept_mmio: bool,
        prot: Prot,
    ) -> Result<()> {
        let (addr, size) = pfn_range(pfn, nr_pages)?;
        if !accept_mmio && !self.mem_map().range_is_memory(addr, addr + size) {
            return Err(Error::PermissionDenied);
        }
        self.with_principals_locked(Host, NoLock, Hyp, |l| {
            l.host.check_page_state_range(addr, size, PageState::OWNED)?;
            if cfg!(feature = "el2-debug") {
                l.hyp.check_page_state_range(addr, size, PageState::NOPAGE)?;
            }
            l.hyp.create_mappings(addr, size, LeafAttrs::new(prot))?;
            warn_on_err!(l.host.set_owner_locked(addr, size, OwnerId::HYP))
        })?;
        debug!("host donated {nr_pages} pages at {addr:#x} to hyp");
        Ok(())
    }

    /// Hands `nr_pages` hypervisor pages back to the host.
    pub fn hyp_donate_host(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        let (addr, size) = pfn_range(pfn, nr_pages)?;
        self.with_principals_locked(Host, NoLock, Hyp, |l| {
            l.hyp.check_page_state_range(addr, size, PageState::OWNED)?;
            if cfg!(feature = "el2-debug") {
                l.host.check_page_state_range(addr, size, PageState::NOPAGE)?;
            }
            let unmapped = l.hyp.unmap(addr, size)?;
            warn_on!(unmapped != size);
            warn_on_err!(l.host.set_owner_locked(addr, size, OwnerId::HOST))
        })
    }

    /// Pins the pages backing the hypervisor VAs `[from, to)`, which must be shared by the host.
    /// The host can't unshare them until they are unpinned.
    pub fn hyp_pin_shared_mem(&self, from: u64, to: u64) -> Result<()> {
        let start = PageSize::Size4k.round_down(from);
        let end = PageSize::Size4k.round_up(to);
        if end <= start {
            return Err(Error::InvalidArgument);
        }
        let size = end - start;
        self.with_principals_locked(Host, NoLock, Hyp, |l| {
            let phys = l.hyp.hyp_pa(start).ok_or(Error::InvalidArgument)?;
            l.host
                .check_page_state_range(phys, size, PageState::SHARED_OWNED)?;
            l.hyp
                .check_page_state_range(phys, size, PageState::SHARED_BORROWED)?;
            for page in self.registry().range(phys, phys + size).flatten() {
                page.ref_inc();
            }
            Ok(())
        })
    }

    /// Drops the pins taken by `hyp_pin_shared_mem()`.
    pub fn hyp_unpin_shared_mem(&self, from: u64, to: u64) {
        let start = PageSize::Size4k.round_down(from);
        let end = PageSize::Size4k.round_up(to);
        self.with_principals_locked(Host, NoLock, Hyp, |l| {
            let Some(phys) = l.hyp.hyp_pa(start) else {
                warn!("unpinning {from:#x} outside of the linear map");
                return;
            };
            for page in self.registry().range(phys, phys + (end - start)).flatten() {
                page.ref_dec();
            }
        })
    }

    /// Returns the number of references held on the page at `phys`.
    pub fn page_refcount(&self, phys: u64) -> Option<u16> {
        self.registry().get_by_addr(phys).map(|p| p.refcount())
    }
}
