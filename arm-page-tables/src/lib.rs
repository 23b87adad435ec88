// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Stage-2 style translation tables for Arm64.
//!
//! ## Key types
//!
//! - `Pte` is a raw descriptor and `Entry` its decoded form: nothing, an owner annotation, an
//!   MMIO-guard annotation, a next-level table or a leaf mapping. Only `Pte::encode()` and
//!   `Pte::decode()` know the bit layout.
//! - `PageTable` is a software walker over 4kB-granule tables, with blocks split on demand and
//!   tables freed when they stop holding counted entries.
//! - `PtePolicy` lets each table owner decide which entries hold a reference on their table page
//!   and when mappings must be built from pages rather than blocks.
//! - `PageTableAllocator` provides and refcounts table pages. `HypPool` from the `page-tracking`
//!   crate implements it.
#![no_std]

extern crate alloc;

// Include std when running unit tests.
#[cfg(test)]
#[macro_use]
extern crate std;

/// Table levels and input-address geometry.
mod level;
mod page_table;
/// Descriptor encoding.
mod pte;
/// Provides stubs for test harnesses.
#[cfg(test)]
mod test_stubs;

pub use level::{Geometry, Level, ENTRIES_PER_PAGE};
pub use page_table::Error as PageTableError;
pub use page_table::Result as PageTableResult;
pub use page_table::{LeafVisit, PageTable, PageTableAllocator, PtePolicy};
pub use pte::{Entry, LeafAttrs, Prot, Pte, MMIO_GUARD_NOTE};
