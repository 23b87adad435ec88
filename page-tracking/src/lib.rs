// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Physical page tracking
//!
//! ## Key types
//!
//! - `MemoryMap` - Sorted description of system RAM, used to classify any physical address as
//!   memory or MMIO and to decide which ranges may be shared, donated or used for DMA.
//! - `PageRegistry` - A `HypPage` for every page of RAM: the host's view of its state, its
//!   refcount, its allocation order and how many guests the host shares it with.
//! - `HypPool` - Refcounted page allocator backing the stage-2 tables of each principal.
//! - `HypMemcache` - Host-donated pages a vCPU can spend when its guest's pool is exhausted.
//!
//! ## Initialization
//!
//! `MemoryMap` -> `PageRegistry` -> one `HypPool` per page-table owner

#![no_std]

extern crate alloc;

mod hyp_pool;
mod mem_map;
mod page_registry;

pub use hyp_pool::Error as PoolError;
pub use hyp_pool::Result as PoolResult;
pub use hyp_pool::{HypMemcache, HypPool};
pub use mem_map::Error as MemMapError;
pub use mem_map::Result as MemMapResult;
pub use mem_map::{MemFlags, MemRange, MemRegion, MemoryMap, MemoryMapBuilder, MAX_MEM_REGIONS};
pub use page_registry::{HypPage, PageRegistry};

#[cfg(test)]
#[macro_use]
extern crate std;
