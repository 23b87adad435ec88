// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arm_pages::{PageSize, PAGE_SHIFT};

/// Number of descriptors in a single table page.
pub const ENTRIES_PER_PAGE: u64 = 4096 / 8;
const BITS_PER_LEVEL: u64 = 9;
// Stage-2 roots may be built from up to 16 concatenated pages.
const MAX_CONCAT_ROOT_BITS: u64 = BITS_PER_LEVEL + 4;

/// A level of a 4kB-granule translation table, from the root (level 0) down to pages (level 3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    L0 = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl Level {
    /// The level mapping 4kB pages.
    pub const LAST: Level = Level::L3;

    /// Returns the level with the given index.
    pub fn from_index(index: u64) -> Option<Self> {
        match index {
            0 => Some(Level::L0),
            1 => Some(Level::L1),
            2 => Some(Level::L2),
            3 => Some(Level::L3),
            _ => None,
        }
    }

    /// Returns the index of the level.
    pub fn index(&self) -> u64 {
        *self as u64
    }

    /// Returns the position of the table index selected from the input address at this level.
    pub fn shift(&self) -> u64 {
        PAGE_SHIFT + (3 - self.index()) * BITS_PER_LEVEL
    }

    /// Returns the size of the range covered by one entry at this level.
    pub fn granule(&self) -> u64 {
        1 << self.shift()
    }

    /// Returns the granule as a `PageSize`.
    pub fn page_size(&self) -> PageSize {
        match self {
            Level::L0 => PageSize::Size512G,
            Level::L1 => PageSize::Size1G,
            Level::L2 => PageSize::Size2M,
            Level::L3 => PageSize::Size4k,
        }
    }

    /// Returns the next level (in order of decreasing granule) in the hierarchy.
    pub fn next(&self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    /// Returns true if this is the page level.
    pub fn is_last(&self) -> bool {
        *self == Self::LAST
    }

    /// Returns true if an entry at this level can map memory directly, as a block or a page.
    pub fn supports_block_mapping(&self) -> bool {
        *self >= Level::L1
    }
}

/// Describes where translation starts for a given input-address size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    ia_bits: u64,
    start_level: Level,
}

impl Geometry {
    /// Computes the start level for an `ia_bits`-wide input address space. When `concatenate` is
    /// set, the root may span several pages so as to skip a level, the way stage-2 tables do.
    pub fn new(ia_bits: u64, concatenate: bool) -> Option<Self> {
        if !(PAGE_SHIFT + 1..=48).contains(&ia_bits) {
            return None;
        }
        let levels = (ia_bits - PAGE_SHIFT + BITS_PER_LEVEL - 1) / BITS_PER_LEVEL;
        let mut start_level = Level::from_index(4 - levels)?;
        if concatenate {
            if let Some(next) = start_level.next() {
                if ia_bits - next.shift() <= MAX_CONCAT_ROOT_BITS {
                    start_level = next;
                }
            }
        }
        Some(Self {
            ia_bits,
            start_level,
        })
    }

    /// Returns the width of the input address space.
    pub fn ia_bits(&self) -> u64 {
        self.ia_bits
    }

    /// Returns one past the last translatable input address.
    pub fn ia_end(&self) -> u64 {
        1 << self.ia_bits
    }

    /// Returns the level of the root table.
    pub fn start_level(&self) -> Level {
        self.start_level
    }

    /// Returns the number of descriptors in a table at `level`.
    pub fn entries(&self, level: Level) -> u64 {
        if level == self.start_level {
            1 << (self.ia_bits - level.shift())
        } else {
            ENTRIES_PER_PAGE
        }
    }

    /// Returns the number of pages backing the root table.
    pub fn root_pages(&self) -> u64 {
        (self.entries(self.start_level) + ENTRIES_PER_PAGE - 1) / ENTRIES_PER_PAGE
    }

    /// Returns the size of the input range translated by a whole table at `level`.
    pub fn table_span(&self, level: Level) -> u64 {
        self.entries(level) << level.shift()
    }

    /// Returns the index of the descriptor for `addr` in a table at `level`.
    pub fn index(&self, level: Level, addr: u64) -> usize {
        ((addr >> level.shift()) & (self.entries(level) - 1)) as usize
    }
}
