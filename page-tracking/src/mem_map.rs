// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arm_pages::{MemType, PageSize, PhysAddr};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::{fmt, result};

/// The maximum number of regions in a `MemoryMap`. Statically sized since the map is built before
/// the hypervisor's pools exist.
pub const MAX_MEM_REGIONS: usize = 32;

type RegionVec = ArrayVec<MemRegion, MAX_MEM_REGIONS>;
type RangeVec = ArrayVec<MemRange, MAX_MEM_REGIONS>;

bitflags! {
    /// Attributes of a memory region.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// RAM that must never be handed to guests or used for DMA.
        const NOMAP = 1 << 0;
    }
}

/// Describes a contiguous region of system RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    base: u64,
    size: u64,
    flags: MemFlags,
}

impl MemRegion {
    /// Returns the 4kB page-aligned base address of the region.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Returns the total size of the region.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the address one past the end of the region.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Returns the region's attributes.
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Returns true if the region may not be shared or used for DMA.
    pub fn is_nomap(&self) -> bool {
        self.flags.contains(MemFlags::NOMAP)
    }

    /// Returns the region as a half-open range.
    pub fn range(&self) -> MemRange {
        MemRange::new(self.base, self.end())
    }
}

/// A half-open `[start, end)` interval of physical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub start: u64,
    pub end: u64,
}

impl MemRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Returns true if `addr` lies within the range.
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Returns true if `other` is entirely inside this range.
    pub fn includes(&self, other: &MemRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns the length of the range in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Errors from building or querying the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Region base or size isn't page aligned.
    UnalignedRegion,

    /// Region overlaps with another one.
    OverlappingRegion,

    /// No more entries available in the memory map.
    OutOfSpace,

    /// A range starts in one memory range and ends in another.
    RangeCrossesRegion,

    /// A range is outside of RAM or in a region marked `NOMAP`.
    RangeNotAllowed,
}

/// Holds the result of memory map operations.
pub type Result<T> = result::Result<T, Error>;

/// Sorted, immutable description of system RAM. Anything outside of it is MMIO.
///
/// Also records the moveable ranges: address ranges whose host identity mapping is rebuilt on
/// demand and may therefore be torn down to recycle page-table pages. All RAM is moveable; further
/// ranges (typically device memory the host may touch) are added with
/// `MemoryMapBuilder::add_moveable_region()`.
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    // Maintained in sorted order.
    regions: RegionVec,
    // Maintained in sorted order.
    moveable: RangeVec,
}

/// A builder for a `MemoryMap`. Call `add_memory_region()` once for each range of RAM in the
/// system.
#[derive(Default)]
pub struct MemoryMapBuilder {
    inner: MemoryMap,
}

fn insert_sorted(ranges: &mut RangeVec, range: MemRange) -> Result<()> {
    let mut index = 0;
    for other in ranges.iter() {
        if other.start >= range.end {
            break;
        } else if range.start < other.end {
            return Err(Error::OverlappingRegion);
        }
        index += 1;
    }
    ranges
        .try_insert(index, range)
        .map_err(|_| Error::OutOfSpace)
}

impl MemoryMapBuilder {
    /// Creates an empty memory map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a range of RAM with the given attributes. Must not overlap with any previously-added
    /// region.
    pub fn add_memory_region(mut self, base: PhysAddr, size: u64, flags: MemFlags) -> Result<Self> {
        if !PageSize::Size4k.is_aligned(base.bits())
            || !PageSize::Size4k.is_aligned(size)
            || size == 0
        {
            return Err(Error::UnalignedRegion);
        }
        let end = base
            .bits()
            .checked_add(size)
            .ok_or(Error::UnalignedRegion)?;
        let region = MemRegion {
            base: base.bits(),
            size,
            flags,
        };
        let mut index = 0;
        for other in &self.inner.regions {
            if other.base() >= end {
                break;
            } else if region.base() < other.end() {
                return Err(Error::OverlappingRegion);
            }
            index += 1;
        }
        self.inner
            .regions
            .try_insert(index, region)
            .map_err(|_| Error::OutOfSpace)?;
        insert_sorted(&mut self.inner.moveable, region.range())?;
        Ok(self)
    }

    /// Marks a range outside of RAM as moveable.
    pub fn add_moveable_region(mut self, base: PhysAddr, size: u64) -> Result<Self> {
        if !PageSize::Size4k.is_aligned(base.bits()) || !PageSize::Size4k.is_aligned(size) {
            return Err(Error::UnalignedRegion);
        }
        let end = base
            .bits()
            .checked_add(size)
            .ok_or(Error::UnalignedRegion)?;
        insert_sorted(&mut self.inner.moveable, MemRange::new(base.bits(), end))?;
        Ok(self)
    }

    /// Returns the constructed `MemoryMap`.
    pub fn build(self) -> MemoryMap {
        self.inner
    }
}

impl MemoryMap {
    /// Looks up the region containing `addr`. When there is none, the returned range is the gap
    /// between the neighbouring regions that contains `addr`.
    pub fn find_mem_range(&self, addr: u64) -> (Option<&MemRegion>, MemRange) {
        let mut range = MemRange::new(0, u64::MAX);
        let mut left = 0;
        let mut right = self.regions.len();
        while left < right {
            let cur = left + (right - left) / 2;
            let reg = &self.regions[cur];
            if addr < reg.base() {
                right = cur;
                range.end = reg.base();
            } else if addr >= reg.end() {
                left = cur + 1;
                range.start = reg.end();
            } else {
                return (Some(reg), reg.range());
            }
        }
        (None, range)
    }

    /// Returns whether `addr` is RAM.
    pub fn addr_is_memory(&self, addr: u64) -> bool {
        self.find_mem_range(addr).0.is_some()
    }

    /// Returns the memory type backing `addr`.
    pub fn mem_type(&self, addr: u64) -> MemType {
        MemType::from_is_memory(self.addr_is_memory(addr))
    }

    /// Returns whether `[start, end)` is entirely within a single RAM region.
    pub fn range_is_memory(&self, start: u64, end: u64) -> bool {
        let (reg, range) = self.find_mem_range(start);
        reg.is_some() && end > start && range.contains(end - 1)
    }

    /// As `range_is_memory()`, but also rejects regions marked `NOMAP`.
    pub fn range_is_allowed_memory(&self, start: u64, end: u64) -> bool {
        let (reg, range) = self.find_mem_range(start);
        match reg {
            Some(reg) => !reg.is_nomap() && end > start && range.contains(end - 1),
            None => false,
        }
    }

    /// Checks that `[start, end)` may be handed to another principal: it must not cross a range
    /// boundary and must be RAM that isn't `NOMAP`.
    pub fn check_range_allowed_memory(&self, start: u64, end: u64) -> Result<()> {
        let (reg, range) = self.find_mem_range(start);
        if end <= start || !range.contains(end - 1) {
            return Err(Error::RangeCrossesRegion);
        }
        match reg {
            Some(reg) if !reg.is_nomap() => Ok(()),
            _ => Err(Error::RangeNotAllowed),
        }
    }

    /// Returns an iterator over all RAM regions in ascending order.
    pub fn regions(&self) -> core::slice::Iter<'_, MemRegion> {
        self.regions.iter()
    }

    /// Returns an iterator over the moveable ranges in ascending order.
    pub fn moveable_regions(&self) -> core::slice::Iter<'_, MemRange> {
        self.moveable.iter()
    }

    /// Returns the total number of 4kB pages of RAM in the map.
    pub fn num_pages(&self) -> u64 {
        self.regions
            .iter()
            .map(|r| r.size() / PageSize::Size4k as u64)
            .sum()
    }
}

impl fmt::Display for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.base, self.end())?;
        if self.is_nomap() {
            write!(f, " nomap")?;
        }
        Ok(())
    }
}
