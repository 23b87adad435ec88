// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

#![no_std]
#![allow(missing_docs)]

//! Crate for handling the AArch64 EL2 system registers involved in stage-2 fault handling.
//! sysregs - bitfield definitions for ESR, SPSR, SCTLR and HPFAR
//! abort - exception class and fault status decoding

mod abort;
mod sysregs;

pub use abort::*;
pub use sysregs::*;
