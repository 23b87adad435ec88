// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Synchronization primitives.
//!
//! Lock types shared by the host, hypervisor and guest stage-2 components. Every principal's
//! page-table lock is a spinning mutex since nothing in the ownership paths may sleep. One-shot
//! registration slots (abort notifiers, module hooks) use `Once`.
#![no_std]

pub use spin::{Mutex, MutexGuard, Once};
