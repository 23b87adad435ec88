// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arm_pages::{OwnerId, PageState, PhysPfn, PAGE_SHIFT};
use bitflags::bitflags;
use static_assertions::const_assert;

use crate::level::Level;

// Descriptor type bits.
const VALID: u64 = 1 << 0;
// Table descriptor at levels 0-2, page descriptor at level 3.
const TYPE_TABLE_OR_PAGE: u64 = 1 << 1;

// Stage-2 leaf attributes.
const MEMATTR_SHIFT: u64 = 2;
const MEMATTR_MASK: u64 = 0xf << MEMATTR_SHIFT;
const MEMATTR_NORMAL: u64 = 0xf;
const MEMATTR_DEVICE: u64 = 0x1;
const MEMATTR_NORMAL_NC: u64 = 0x5;
const S2AP_R: u64 = 1 << 6;
const S2AP_W: u64 = 1 << 7;
const SH_INNER: u64 = 3 << 8;
const AF: u64 = 1 << 10;
const XN_SHIFT: u64 = 53;
const XN_MASK: u64 = 3 << XN_SHIFT;
const XN_NONE: u64 = 0;
const XN_PXN: u64 = 1;
const XN_ALL: u64 = 2;
const XN_UXN: u64 = 3;

// Software bits carrying the page state of a valid leaf.
const SW_SHARED_OWNED: u64 = 1 << 55;
const SW_SHARED_BORROWED: u64 = 1 << 56;
const SW_TAINTED: u64 = 1 << 57;
const SW_STATE_MASK: u64 = SW_SHARED_OWNED | SW_SHARED_BORROWED | SW_TAINTED;

// Output address, bits [47:12].
const OA_MASK: u64 = ((1 << 48) - 1) & !((1 << PAGE_SHIFT) - 1);

// Invalid entries: the owner lives in bits [9:2], the annotation type in bits [11:10].
const OWNER_SHIFT: u64 = 2;
const OWNER_MASK: u64 = OwnerId::MAX_RAW << OWNER_SHIFT;
const ANNOTATION_TYPE_SHIFT: u64 = 10;
const ANNOTATION_TYPE_MASK: u64 = 3 << ANNOTATION_TYPE_SHIFT;
const ANNOTATION_MMIO_GUARD: u64 = 1;

const_assert!(OWNER_MASK & VALID == 0);
const_assert!(OWNER_MASK & ANNOTATION_TYPE_MASK == 0);
const_assert!(SW_STATE_MASK & (OA_MASK | XN_MASK) == 0);
const_assert!((MEMATTR_MASK | S2AP_R | S2AP_W | SH_INNER | AF) & OA_MASK == 0);

/// The raw value of an MMIO guard note.
pub const MMIO_GUARD_NOTE: u64 = ANNOTATION_MMIO_GUARD << ANNOTATION_TYPE_SHIFT;

bitflags! {
    /// Access permissions and memory type of a leaf mapping.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const X = 1 << 0;
        const W = 1 << 1;
        const R = 1 << 2;
        const DEVICE = 1 << 3;
        const NORMAL_NC = 1 << 4;
        const PXN = 1 << 5;
        const UXN = 1 << 6;
    }
}

impl Prot {
    pub const RW: Self = Self::R.union(Self::W);
    pub const RX: Self = Self::R.union(Self::X);
    pub const RWX: Self = Self::RW.union(Self::X);

    /// Returns only the access permission bits.
    pub fn rwx(&self) -> Self {
        self.intersection(Self::RWX)
    }
}

/// Everything a valid leaf records besides its output address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LeafAttrs {
    pub prot: Prot,
    pub state: PageState,
}

impl LeafAttrs {
    /// Creates attributes for an exclusively owned mapping with `prot`.
    pub const fn new(prot: Prot) -> Self {
        Self {
            prot,
            state: PageState::OWNED,
        }
    }

    /// Returns the attributes with the page state replaced. Only the states that can be carried
    /// by a leaf are kept.
    pub fn with_state(self, state: PageState) -> Self {
        Self {
            prot: self.prot,
            state: state.pte_bits(),
        }
    }
}

/// A decoded stage-2 entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    /// Nothing mapped and no owner other than the table's own principal recorded.
    Empty,
    /// Invalid entry recording that the covered range belongs to someone else.
    Owned(OwnerId),
    /// Invalid entry recording that a guest declared the covered IPA range as MMIO.
    MmioGuard,
    /// Pointer to the next-level table.
    Table(PhysPfn),
    /// Valid block or page mapping.
    Leaf {
        phys: u64,
        attrs: LeafAttrs,
        young: bool,
    },
}

impl Entry {
    /// Returns the entry recording `owner`. The host owns everything that isn't annotated, so
    /// recording it as the owner is the same as clearing the entry.
    pub fn owned_by(owner: OwnerId) -> Self {
        if owner.is_host() {
            Entry::Empty
        } else {
            Entry::Owned(owner)
        }
    }

    /// Creates a fresh (young) leaf mapping.
    pub fn leaf(phys: u64, attrs: LeafAttrs) -> Self {
        Entry::Leaf {
            phys,
            attrs,
            young: true,
        }
    }

    /// Returns true for valid leaves and tables.
    pub fn is_valid(&self) -> bool {
        matches!(self, Entry::Table(_) | Entry::Leaf { .. })
    }

    /// Returns true for a pointer to a next-level table.
    pub fn is_table(&self) -> bool {
        matches!(self, Entry::Table(_))
    }

    /// Returns the owner recorded by an invalid entry.
    pub fn owner(&self) -> Option<OwnerId> {
        match self {
            Entry::Empty => Some(OwnerId::HOST),
            Entry::Owned(owner) => Some(*owner),
            _ => None,
        }
    }

    /// Returns the page state of a valid leaf.
    pub fn state(&self) -> Option<PageState> {
        match self {
            Entry::Leaf { attrs, .. } => Some(attrs.state),
            _ => None,
        }
    }

    /// Returns the permissions of a valid leaf.
    pub fn prot(&self) -> Option<Prot> {
        match self {
            Entry::Leaf { attrs, .. } => Some(attrs.prot),
            _ => None,
        }
    }

    /// Returns the attributes of a valid leaf.
    pub fn attrs(&self) -> Option<LeafAttrs> {
        match self {
            Entry::Leaf { attrs, .. } => Some(*attrs),
            _ => None,
        }
    }

    /// Returns the output address of a valid leaf.
    pub fn phys(&self) -> Option<u64> {
        match self {
            Entry::Leaf { phys, .. } => Some(*phys),
            _ => None,
        }
    }

    /// Returns the entry with its page state replaced. Entries other than valid leaves carry no
    /// state and are returned unchanged.
    pub fn with_state(self, state: PageState) -> Self {
        match self {
            Entry::Leaf { phys, attrs, young } => Entry::Leaf {
                phys,
                attrs: attrs.with_state(state),
                young,
            },
            other => other,
        }
    }
}

/// A raw stage-2 descriptor. The only place bits are packed or unpacked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pte(u64);

fn prot_to_bits(prot: Prot) -> u64 {
    let mut bits = 0;
    if prot.contains(Prot::R) {
        bits |= S2AP_R;
    }
    if prot.contains(Prot::W) {
        bits |= S2AP_W;
    }
    let memattr = if prot.contains(Prot::DEVICE) {
        MEMATTR_DEVICE
    } else if prot.contains(Prot::NORMAL_NC) {
        MEMATTR_NORMAL_NC
    } else {
        MEMATTR_NORMAL
    };
    bits |= memattr << MEMATTR_SHIFT;
    let xn = if !prot.contains(Prot::X) {
        XN_ALL
    } else if prot.contains(Prot::UXN) {
        XN_UXN
    } else if prot.contains(Prot::PXN) {
        XN_PXN
    } else {
        XN_NONE
    };
    bits | (xn << XN_SHIFT) | SH_INNER
}

fn bits_to_prot(bits: u64) -> Prot {
    let mut prot = Prot::empty();
    if bits & S2AP_R != 0 {
        prot |= Prot::R;
    }
    if bits & S2AP_W != 0 {
        prot |= Prot::W;
    }
    match (bits & MEMATTR_MASK) >> MEMATTR_SHIFT {
        MEMATTR_DEVICE => prot |= Prot::DEVICE,
        MEMATTR_NORMAL_NC => prot |= Prot::NORMAL_NC,
        _ => (),
    }
    match (bits & XN_MASK) >> XN_SHIFT {
        XN_NONE => prot |= Prot::X,
        XN_PXN => prot |= Prot::X | Prot::PXN,
        XN_UXN => prot |= Prot::X | Prot::UXN,
        _ => (),
    }
    prot
}

fn state_to_bits(state: PageState) -> u64 {
    let mut bits = 0;
    if state.contains(PageState::SHARED_OWNED) {
        bits |= SW_SHARED_OWNED;
    }
    if state.contains(PageState::SHARED_BORROWED) {
        bits |= SW_SHARED_BORROWED;
    }
    if state.contains(PageState::TAINTED) {
        bits |= SW_TAINTED;
    }
    bits
}

fn bits_to_state(bits: u64) -> PageState {
    let mut state = PageState::OWNED;
    if bits & SW_SHARED_OWNED != 0 {
        state |= PageState::SHARED_OWNED;
    }
    if bits & SW_SHARED_BORROWED != 0 {
        state |= PageState::SHARED_BORROWED;
    }
    if bits & SW_TAINTED != 0 {
        state |= PageState::TAINTED;
    }
    state
}

impl Pte {
    /// Wraps a raw descriptor.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits that make up the PTE.
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Returns `true` if the descriptor is valid.
    pub const fn valid(&self) -> bool {
        self.0 & VALID != 0
    }

    /// Returns the descriptor type bit: table at levels 0-2, page at level 3.
    pub const fn type_bit(&self) -> bool {
        self.0 & TYPE_TABLE_OR_PAGE != 0
    }

    /// Returns the raw S2AP read permission bit.
    pub const fn s2ap_r(&self) -> bool {
        self.0 & S2AP_R != 0
    }

    /// Returns the raw S2AP write permission bit.
    pub const fn s2ap_w(&self) -> bool {
        self.0 & S2AP_W != 0
    }

    /// Returns the raw execute-never field.
    pub const fn xn(&self) -> u64 {
        (self.0 & XN_MASK) >> XN_SHIFT
    }

    /// Encodes `entry` as it would be stored at `level`.
    pub fn encode(entry: &Entry, level: Level) -> Self {
        let bits = match *entry {
            Entry::Empty => 0,
            Entry::Owned(owner) => (owner.raw() << OWNER_SHIFT) & OWNER_MASK,
            Entry::MmioGuard => MMIO_GUARD_NOTE,
            Entry::Table(pfn) => ((pfn.bits() << PAGE_SHIFT) & OA_MASK) | TYPE_TABLE_OR_PAGE | VALID,
            Entry::Leaf { phys, attrs, young } => {
                let mut bits = (phys & OA_MASK) | prot_to_bits(attrs.prot) | VALID;
                bits |= state_to_bits(attrs.state);
                if young {
                    bits |= AF;
                }
                if level.is_last() {
                    bits |= TYPE_TABLE_OR_PAGE;
                }
                bits
            }
        };
        Self(bits)
    }

    /// Decodes the descriptor as found at `level`.
    pub fn decode(&self, level: Level) -> Entry {
        let bits = self.0;
        if bits & VALID == 0 {
            if bits == 0 {
                return Entry::Empty;
            }
            if (bits & ANNOTATION_TYPE_MASK) >> ANNOTATION_TYPE_SHIFT == ANNOTATION_MMIO_GUARD {
                return Entry::MmioGuard;
            }
            let raw_owner = (bits & OWNER_MASK) >> OWNER_SHIFT;
            return match OwnerId::new(raw_owner) {
                Some(owner) => Entry::owned_by(owner),
                None => Entry::Empty,
            };
        }
        if !level.is_last() && bits & TYPE_TABLE_OR_PAGE != 0 {
            return Entry::Table(PhysPfn::phys((bits & OA_MASK) >> PAGE_SHIFT));
        }
        Entry::Leaf {
            phys: bits & OA_MASK,
            attrs: LeafAttrs {
                prot: bits_to_prot(bits),
                state: bits_to_state(bits),
            },
            young: bits & AF != 0,
        }
    }
}
