// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use arm_pages::PhysAddr;
use page_tracking::*;

use super::level::Level;
use super::page_table::PtePolicy;
use super::pte::Entry;

pub struct StubState {
    pub map: MemoryMap,
    pub pool: HypPool,
}

/// 16MB of RAM at 2GB, the first 256 pages of which back the pool.
pub fn stub_sys_memory() -> StubState {
    const MEM_BASE: u64 = 0x8000_0000;
    const MEM_SIZE: u64 = 16 * 1024 * 1024;
    let map = MemoryMapBuilder::new()
        .add_memory_region(PhysAddr::phys(MEM_BASE), MEM_SIZE, MemFlags::empty())
        .unwrap()
        .build();
    let registry = PageRegistry::new(&map);
    let pool = HypPool::new(registry, PhysAddr::phys(MEM_BASE).pfn(), 256, 0).unwrap();
    StubState { map, pool }
}

/// Every non-empty entry holds a reference.
pub struct CountNonZero;

impl PtePolicy for CountNonZero {
    fn pte_is_counted(&self, entry: &Entry, _level: Level) -> bool {
        *entry != Entry::Empty
    }
}

/// Only tables and annotations hold references; mappings can be dropped and rebuilt.
pub struct CountOnlyAnnotations;

impl PtePolicy for CountOnlyAnnotations {
    fn pte_is_counted(&self, entry: &Entry, _level: Level) -> bool {
        matches!(entry, Entry::Table(_) | Entry::Owned(_) | Entry::MmioGuard)
    }
}

/// Never uses blocks.
pub struct ForceEverything;

impl PtePolicy for ForceEverything {
    fn force_pte(&self, _addr: u64, _end: u64, _new: &Entry) -> bool {
        true
    }

    fn pte_is_counted(&self, entry: &Entry, _level: Level) -> bool {
        *entry != Entry::Empty
    }
}
