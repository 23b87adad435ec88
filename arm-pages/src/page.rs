// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Log2 of the base translation granule.
pub const PAGE_SHIFT: u64 = 12;
/// Size in bytes of the base translation granule.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Granules a stage-2 table built from 4kB pages can map with a single entry.
#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PageSize {
    Size4k = 4 * 1024,
    Size2M = 2 * 1024 * 1024,
    Size1G = 1024 * 1024 * 1024,
    Size512G = 512 * 1024 * 1024 * 1024,
}

impl PageSize {
    /// Returns `val` divided by 4kB, rounded up.
    pub const fn num_4k_pages(val: u64) -> u64 {
        (val + PageSize::Size4k as u64 - 1) / (PageSize::Size4k as u64)
    }

    /// Returns the page size spanning `1 << order` base pages, if there is one.
    pub fn from_order(order: u32) -> Option<Self> {
        match order {
            0 => Some(PageSize::Size4k),
            9 => Some(PageSize::Size2M),
            18 => Some(PageSize::Size1G),
            27 => Some(PageSize::Size512G),
            _ => None,
        }
    }

    /// Checks if the given quantity is aligned to this page size.
    pub fn is_aligned(&self, val: u64) -> bool {
        (val & (*self as u64 - 1)) == 0
    }

    /// Rounds up the quantity to the nearest multiple of this page size.
    pub fn round_up(&self, val: u64) -> u64 {
        (val + *self as u64 - 1) & !(*self as u64 - 1)
    }

    /// Rounds down the quantity to the nearest multiple of this page size.
    pub fn round_down(&self, val: u64) -> u64 {
        val & !(*self as u64 - 1)
    }

    /// Returns if the size is a block (> 4kB) size.
    pub fn is_huge(&self) -> bool {
        !matches!(*self, PageSize::Size4k)
    }
}

/// `AddressSpace` identifies the address space that a raw address or frame number is in.
pub trait AddressSpace: Clone + Copy + fmt::Debug + PartialEq {}

/// Represents the physical address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Phys;
impl AddressSpace for Phys {}

/// Represents a guest's intermediate physical address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GuestIpa;
impl AddressSpace for GuestIpa {}

/// Represents the hypervisor's private virtual address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HypVirt;
impl AddressSpace for HypVirt {}

/// A raw address in an address space.
#[derive(Copy, Clone, Debug)]
pub struct RawAddr<AS: AddressSpace>(u64, AS);

impl<AS: AddressSpace> RawAddr<AS> {
    pub fn new(addr: u64, address_space: AS) -> Self {
        Self(addr, address_space)
    }

    /// Returns the inner 64 address.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Returns the address space for the address.
    pub fn address_space(&self) -> AS {
        self.1
    }

    /// Returns the address incremented by the given number of bytes.
    /// Returns None if the result would overflow.
    pub fn checked_increment(&self, increment: u64) -> Option<Self> {
        let addr = self.0.checked_add(increment)?;
        Some(Self(addr, self.1))
    }

    /// Returns the frame containing this address.
    pub fn pfn(&self) -> Pfn<AS> {
        Pfn(self.0 >> PAGE_SHIFT, self.1)
    }

    /// Returns the offset of the address within its 4kB page.
    pub fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl RawAddr<Phys> {
    pub fn phys(addr: u64) -> Self {
        Self(addr, Phys)
    }
}

impl RawAddr<GuestIpa> {
    pub fn ipa(addr: u64) -> Self {
        Self(addr, GuestIpa)
    }
}

impl RawAddr<HypVirt> {
    pub fn hyp_va(addr: u64) -> Self {
        Self(addr, HypVirt)
    }
}

/// Convenience type aliases for the address spaces used by stage-2 management.
pub type PhysAddr = RawAddr<Phys>;
pub type IpaAddr = RawAddr<GuestIpa>;
pub type HypVa = RawAddr<HypVirt>;

impl<AS: AddressSpace> PartialEq for RawAddr<AS> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<AS: AddressSpace> Eq for RawAddr<AS> {}

impl<AS: AddressSpace> PartialOrd for RawAddr<AS> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<AS: AddressSpace> Ord for RawAddr<AS> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<AS: AddressSpace> fmt::Display for RawAddr<AS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A page frame number in an address space.
#[derive(Copy, Clone, Debug)]
pub struct Pfn<AS: AddressSpace>(u64, AS);

impl<AS: AddressSpace> Pfn<AS> {
    pub fn new(bits: u64, address_space: AS) -> Self {
        Pfn(bits, address_space)
    }

    /// Returns the raw frame number.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Returns the address space this frame is in.
    pub fn address_space(&self) -> AS {
        self.1
    }

    /// Returns the address of the first byte of the frame, or `None` if it doesn't fit in 64 bits.
    pub fn checked_addr(&self) -> Option<RawAddr<AS>> {
        let addr = self.0.checked_mul(PAGE_SIZE)?;
        Some(RawAddr(addr, self.1))
    }

    /// Returns the address of the first byte of the frame. The shift is unchecked; callers that
    /// accept frame numbers from an untrusted source use `checked_addr()`.
    pub fn addr(&self) -> RawAddr<AS> {
        RawAddr(self.0 << PAGE_SHIFT, self.1)
    }

    /// Returns the frame `n` frames after this one.
    pub fn checked_add(&self, n: u64) -> Option<Self> {
        Some(Pfn(self.0.checked_add(n)?, self.1))
    }
}

impl Pfn<Phys> {
    pub fn phys(bits: u64) -> Self {
        Pfn(bits, Phys)
    }
}

impl Pfn<GuestIpa> {
    pub fn guest(bits: u64) -> Self {
        Pfn(bits, GuestIpa)
    }
}

/// Physical and guest frame numbers.
pub type PhysPfn = Pfn<Phys>;
pub type Gfn = Pfn<GuestIpa>;

impl<AS: AddressSpace> From<RawAddr<AS>> for Pfn<AS> {
    fn from(addr: RawAddr<AS>) -> Pfn<AS> {
        addr.pfn()
    }
}

impl<AS: AddressSpace> PartialEq for Pfn<AS> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<AS: AddressSpace> Eq for Pfn<AS> {}

impl<AS: AddressSpace> PartialOrd for Pfn<AS> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<AS: AddressSpace> Ord for Pfn<AS> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_alignment() {
        assert!(PageSize::Size2M.is_aligned(0x20_0000));
        assert!(!PageSize::Size1G.is_aligned(0x20_0000));
        assert!(PageSize::Size512G.is_aligned(0x80_0000_0000));
        assert_eq!(PageSize::Size4k.round_up(0x12_2345), 0x12_3000);
        assert_eq!(PageSize::Size4k.round_down(0x4567_9521), 0x4567_9000);
        assert_eq!(PageSize::num_4k_pages(0x1001), 2);
    }

    #[test]
    fn order_to_size() {
        assert_eq!(PageSize::from_order(0), Some(PageSize::Size4k));
        assert_eq!(PageSize::from_order(9), Some(PageSize::Size2M));
        assert_eq!(PageSize::from_order(3), None);
    }

    #[test]
    fn pfn_addr_conversion() {
        let addr = RawAddr::phys(0x8020_1234);
        assert_eq!(addr.pfn(), Pfn::phys(0x80201));
        assert_eq!(addr.page_offset(), 0x234);
        assert_eq!(Pfn::phys(0x80201).addr(), RawAddr::phys(0x8020_1000));
        assert!(Pfn::guest(u64::MAX).checked_addr().is_none());
        assert!(Pfn::guest(u64::MAX).checked_add(1).is_none());
    }
}
