// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Arm64 page types
//!
//! - `RawAddr` and `Pfn` are addresses and frame numbers tagged with the address space they live
//!   in: physical, guest IPA or hypervisor virtual.
//! - `PageSize` enumerates the translation granules of a 4kB-granule stage-2 table.
//! - `OwnerId` names the principal recorded in an invalid stage-2 entry.
//! - `PageState` is the per-page ownership state shared by all three principals.
#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod memory_type;
mod owner_id;
mod page;
mod state;

pub use memory_type::MemType;
pub use owner_id::OwnerId;
pub use page::*;
pub use state::PageState;
