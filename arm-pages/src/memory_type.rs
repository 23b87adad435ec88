// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Describes the type of memory a physical address resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemType {
    /// Ordinary, idempotent system RAM tracked by the page registry.
    Ram,

    /// Anything outside the memory map. Reads and writes may have side-effects.
    Mmio,
}

impl MemType {
    /// Returns the memory type for an address given whether it is covered by a memory region.
    pub fn from_is_memory(is_memory: bool) -> Self {
        if is_memory {
            MemType::Ram
        } else {
            MemType::Mmio
        }
    }

    /// Returns true if this is system RAM.
    pub fn is_memory(&self) -> bool {
        matches!(self, MemType::Ram)
    }
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match &self {
            MemType::Ram => write!(f, "RAM"),
            MemType::Mmio => write!(f, "MMIO"),
        }
    }
}
