// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// `OwnerId` represents the entity recorded as the owner of a page in an invalid stage-2 entry.
/// The field is 8 bits wide in the entry, so ids above `OwnerId::MAX_RAW` can't be encoded.
/// 0 = host
/// 1 = hypervisor
/// 2 = FF-A (secure world)
/// 3 = guest
/// 4 = protected (memory claimed by a hypervisor module)
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId {
    id: u64,
}

impl OwnerId {
    /// The largest raw owner id that fits in an annotation.
    pub const MAX_RAW: u64 = 0xff;

    /// The untrusted host.
    pub const HOST: Self = Self { id: 0 };
    /// The hypervisor itself.
    pub const HYP: Self = Self { id: 1 };
    /// Memory lent to the secure world through FF-A.
    pub const FFA: Self = Self { id: 2 };
    /// Any guest VM. Which guest is determined by the guest's own stage-2.
    pub const GUEST: Self = Self { id: 3 };
    /// Memory a hypervisor module took away from the host.
    pub const PROTECTED: Self = Self { id: 4 };

    /// Creates an `OwnerId` from its raw value, returning `None` if it can't be encoded in an
    /// annotation.
    pub const fn new(id: u64) -> Option<Self> {
        if id > Self::MAX_RAW {
            None
        } else {
            Some(Self { id })
        }
    }

    /// Returns true if this is the host.
    pub fn is_host(&self) -> bool {
        *self == Self::HOST
    }

    /// Returns the raw value of the `OwnerId`.
    pub const fn raw(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::HOST => write!(f, "host"),
            Self::HYP => write!(f, "hyp"),
            Self::FFA => write!(f, "ffa"),
            Self::GUEST => write!(f, "guest"),
            Self::PROTECTED => write!(f, "protected"),
            other => write!(f, "owner {}", other.id),
        }
    }
}
