// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Operations that only change the host's own view of its pages: FF-A shares, DMA pins, module
//! permission changes and lazy page-table pinning.

use arm_page_tables::{LeafAttrs, Prot};
use arm_pages::{OwnerId, PageSize, PageState};
use log::debug;

use crate::host::HOST_MMIO_PROT;
use crate::locking::{Host, NoLock};
use crate::mem_protect::{pfn_range, MemProtect};
use crate::{Error, Result};

/// Permissions a module may set on host pages.
pub const MODULE_PROT_ALLOWLIST: Prot = Prot::RWX
    .union(Prot::DEVICE)
    .union(Prot::NORMAL_NC)
    .union(Prot::PXN)
    .union(Prot::UXN);

impl MemProtect {
    /// Marks host memory as shared with the secure world through FF-A.
    pub fn host_share_ffa(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        let (addr, size) = self.host_memory_range(pfn, nr_pages)?;
        self.with_principals_locked(Host, NoLock, NoLock, |l| {
            l.host.check_page_state_range(addr, size, PageState::OWNED)?;
            l.host
                .set_page_state_range(addr, size, PageState::SHARED_OWNED)
        })
    }

    /// Ends an FF-A share started with `host_share_ffa()`.
    pub fn host_unshare_ffa(&self, pfn: u64, nr_pages: u64) -> Result<()> {
        let (addr, size) = self.host_memory_range(pfn, nr_pages)?;
        self.with_principals_locked(Host, NoLock, NoLock, |l| {
            l.host
                .check_page_state_range(addr, size, PageState::SHARED_OWNED)?;
            l.host.set_page_state_range(addr, size, PageState::OWNED)
        })
    }

    fn host_memory_range(&self, pfn: u64, nr_pages: u64) -> Result<(u64, u64)> {
        let (addr, size) = pfn_range(pfn, nr_pages)?;
        if !self.mem_map().range_is_memory(addr, addr + size) {
            return Err(Error::InvalidArgument);
        }
        Ok((addr, size))
    }

    /// Pins `[phys, phys + size)` for host DMA. RAM pages get a reference, which keeps them from
    /// being donated or shared until `host_unuse_dma()`. MMIO is tainted for good.
    pub fn host_use_dma(&self, phys: u64, size: u64) -> Result<()> {
        if size == 0 || !PageSize::Size4k.is_aligned(phys) || !PageSize::Size4k.is_aligned(size) {
            return Err(Error::InvalidArgument);
        }
        let end = phys.checked_add(size).ok_or(Error::InvalidArgument)?;
        let (reg, range) = self.mem_map().find_mem_range(phys);
        if !range.contains(end - 1) {
            return Err(Error::InvalidArgument);
        }
        let is_memory = reg.is_some();
        self.with_principals_locked(Host, NoLock, NoLock, |l| {
            if !is_memory {
                if l
                    .host
                    .check_page_state_range(phys, size, PageState::TAINTED)
                    .is_ok()
                {
                    return Ok(());
                }
                l.host
                    .check_page_state_inner(phys, size, PageState::OWNED, false)?;
                let attrs = LeafAttrs::new(HOST_MMIO_PROT).with_state(PageState::TAINTED);
                return l.host.idmap_locked(phys, size, attrs, false);
            }
            l.host
                .check_page_state_inner(phys, size, PageState::OWNED, false)?;
            for page in self.registry().range(phys, end).flatten() {
                page.ref_inc();
            }
            Ok(())
        })
    }

    /// Drops the DMA pins taken by `host_use_dma()`.
    pub fn host_unuse_dma(&self, phys: u64, size: u64) -> Result<()> {
        if !PageSize::Size4k.is_aligned(phys) || !PageSize::Size4k.is_aligned(size) {
            return Err(Error::InvalidArgument);
        }
        let end = phys.checked_add(size).ok_or(Error::InvalidArgument)?;
        if !self.mem_map().range_is_memory(phys, end) {
            return Ok(());
        }
        self.with_principals_locked(Host, NoLock, NoLock, |_| {
            let unpinned = self
                .registry()
                .range(phys, end)
                .any(|page| page.map_or(true, |p| p.refcount() == 0));
            if warn_on!(unpinned) {
                return Err(Error::InvalidArgument);
            }
            for page in self.registry().range(phys, end).flatten() {
                page.ref_dec();
            }
            Ok(())
        })
    }

    /// Lets a hypervisor module change the host's permissions on `nr_pages` pages from `pfn`.
    /// An empty `prot` takes the pages away from the host altogether.
    ///
    /// RAM pages must either all be pristine host pages or all already be under the module's
    /// control.
    pub fn module_change_host_page_prot(
        &self,
        pfn: u64,
        prot: Prot,
        nr_pages: u64,
        update_iommu: bool,
    ) -> Result<()> {
        if !(prot - MODULE_PROT_ALLOWLIST).is_empty() {
            return Err(Error::InvalidArgument);
        }
        let (addr, size) = pfn_range(pfn, nr_pages)?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let (reg, range) = self.mem_map().find_mem_range(addr);
        if addr + size > range.end {
            return Err(Error::PermissionDenied);
        }
        let is_memory = reg.is_some();

        self.with_principals_locked(Host, NoLock, NoLock, |l| {
            if is_memory {
                let module_owned = |p: Option<&page_tracking::HypPage>| {
                    p.is_some_and(|p| p.host_state().contains(PageState::MODULE_OWNED))
                };
                let mut pages = self.registry().range(addr, addr + size);
                if pages.next().is_some_and(module_owned) {
                    if !pages.all(module_owned) {
                        return Err(Error::PermissionDenied);
                    }
                } else {
                    l.host
                        .check_page_state_inner(addr, size, PageState::OWNED, true)?;
                }
            }

            if prot.is_empty() {
                warn_on_err!(l.host.set_owner_inner(
                    addr,
                    size,
                    OwnerId::PROTECTED,
                    is_memory,
                    PageState::MODULE_OWNED,
                    update_iommu
                ))?;
                return Ok(());
            }
            warn_on_err!(l
                .host
                .idmap_locked(addr, size, LeafAttrs::new(prot), update_iommu))?;
            if is_memory {
                let state = if prot == Prot::RWX {
                    PageState::OWNED
                } else {
                    PageState::MODULE_OWNED
                };
                l.host.update_page_state(addr, size, state);
            }
            debug!("module set host prot {prot:?} on {addr:#x}+{size:#x}");
            Ok(())
        })
    }

    /// Pins (`enable`) or unpins the page-level host tables covering `nr_pages` pristine pages, so
    /// that later permission changes on them never need to allocate.
    pub fn host_lazy_pte(&self, pfn: u64, nr_pages: u64, enable: bool) -> Result<()> {
        let (addr, size) = pfn_range(pfn, nr_pages)?;
        let (reg, range) = self.mem_map().find_mem_range(addr);
        if reg.is_none() || addr + size > range.end {
            return Err(Error::PermissionDenied);
        }
        self.with_principals_locked(Host, NoLock, NoLock, |l| {
            l.host
                .check_page_state_inner(addr, size, PageState::OWNED, true)?;
            if enable {
                l.host.get_pages(addr, size)
            } else {
                l.host.put_pages(addr, size)
            }
        })
    }
}
