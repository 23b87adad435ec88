// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Stage-2 memory ownership and protection
//!
//! Tracks which principal owns every page of physical memory and MMIO, and keeps the stage-2
//! translations of the host, the hypervisor and each guest consistent with that ownership.
//!
//! ## Principals
//!
//! - Host - Identity-mapped by its stage-2, which is faulted in lazily. Pages it doesn't own are
//!   left unmapped and annotated with their owner.
//! - Hypervisor - Maps what it owns or borrows in its linear map.
//! - Guests - Each has its own stage-2, grown from a pool of host-donated pages and topped up
//!   through per-vCPU memcaches.
//!
//! The state of a page (owned, shared-owned, shared-borrowed, no access) is kept in the
//! software bits of each principal's leaf entries, plus in the `PageRegistry` for host pages
//! shared with guests. Every transition checks both ends before changing either.
//!
//! ## Key types
//!
//! - `MemProtectBuilder` - Describes RAM and the hypervisor's page pools, and builds a
//!   `MemProtect`.
//! - `MemProtect` - Entry point for all transitions, host abort handling and guest lifetime.
//! - `GuestVm` / `Vcpu` - A guest's stage-2 and a vCPU's memcache.
//!
//! ## Locking
//!
//! Host, then guest, then hypervisor. The order is enforced by the types passed to
//! `with_principals_locked()`.

#![no_std]

extern crate alloc;

#[macro_use]
mod error;

mod config;
mod fault;
mod guest;
mod guest_hyp;
mod host;
mod host_guest;
mod host_hyp;
mod host_only;
mod hyp;
mod locking;
mod mem_protect;
mod platform;
mod ptdump;
#[cfg(any(test, feature = "selftest"))]
mod selftest;

pub use config::{MemProtectBuilder, DEFAULT_HOST_IA_BITS};
pub use error::{Error, Result};
pub use fault::{El1Regs, El2Regs, HostCpuContext};
pub use guest::{default_guest_prot, GuestVm, GuestVmConfig, Vcpu};
pub use host::{HOST_MEM_PROT, HOST_MMIO_PROT};
pub use host_guest::SglistEntry;
pub use host_only::MODULE_PROT_ALLOWLIST;
pub use hyp::{default_hyp_prot, PAGE_HYP, PAGE_HYP_DEVICE};
pub use mem_protect::{IllegalAbortNotifier, MemProtect, PermFaultHandler};
pub use platform::{Iommu, NoIommu, Platform, PsciMemProtect, PsciMemProtectCounter};
pub use ptdump::{PtdumpLog, PtdumpOp, PTDUMP_HOST_HANDLE, PTDUMP_LOGS_PER_PAGE};
#[cfg(any(test, feature = "selftest"))]
pub use selftest::SelftestError;

#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(test)]
mod test_utils;
