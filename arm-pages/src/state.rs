// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// State of a page as seen by one principal. The empty set is `OWNED`.
    ///
    /// `SHARED_OWNED`, `SHARED_BORROWED` and `TAINTED` are encoded in the software bits of valid
    /// stage-2 leaves. The rest are derived while inspecting a table or are only ever stored in the
    /// page registry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageState: u32 {
        /// Owned by the principal, but also mapped by someone else.
        const SHARED_OWNED = 1 << 0;
        /// Mapped by the principal, but owned by someone else.
        const SHARED_BORROWED = 1 << 1;
        /// MMIO that the host handed to a DMA-capable device.
        const TAINTED = 1 << 2;
        /// Not mapped at all.
        const NOPAGE = 1 << 3;
        /// Mapped with narrower permissions than the principal's default.
        const RESTRICTED_PROT = 1 << 4;
        /// Taken over by a hypervisor module.
        const MODULE_OWNED = 1 << 5;
        /// Guest IPA covered by an MMIO guard note.
        const MMIO = 1 << 6;
    }
}

impl PageState {
    /// Exclusively owned and mapped with default permissions.
    pub const OWNED: Self = Self::empty();

    /// The states that can be stored in a valid leaf entry.
    pub const PTE_MASK: Self = Self::SHARED_OWNED
        .union(Self::SHARED_BORROWED)
        .union(Self::TAINTED);

    /// Returns true if this is the exclusive `OWNED` state.
    pub fn is_owned(&self) -> bool {
        self.is_empty()
    }

    /// Returns the state with the bits that can't be stored in a leaf entry dropped.
    pub fn pte_bits(&self) -> Self {
        self.intersection(Self::PTE_MASK)
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_owned() {
            return write!(f, "OWNED");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{name}")?;
            first = false;
        }
        Ok(())
    }
}
