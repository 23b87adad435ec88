// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Acquisition of the principals' page-table locks.
//!
//! Every transition touches at most one host, one guest and the hypervisor, always locked in that
//! order. The order is encoded in the types: each slot of `MemProtect::with_principals_locked()`
//! only accepts its own principal or `NoLock`, and `Locked` releases its guards in reverse.

use sync::MutexGuard;

use crate::guest::{GuestStage2, GuestVm};
use crate::host::HostComponent;
use crate::hyp::HypComponent;
use crate::mem_protect::MemProtect;

/// Selects the host lock.
pub struct Host;

/// Selects the lock of one guest.
pub struct Guest<'v>(pub &'v GuestVm);

/// Selects the hypervisor lock.
pub struct Hyp;

/// Leaves a slot unlocked.
pub struct NoLock;

/// A principal that may be locked first.
pub trait HostSlot<'a> {
    type Guard;
    fn acquire(self, mp: &'a MemProtect) -> Self::Guard;
}

/// A principal that may be locked second.
pub trait GuestSlot<'a> {
    type Guard;
    fn acquire(self) -> Self::Guard;
}

/// A principal that may be locked last.
pub trait HypSlot<'a> {
    type Guard;
    fn acquire(self, mp: &'a MemProtect) -> Self::Guard;
}

impl<'a> HostSlot<'a> for Host {
    type Guard = MutexGuard<'a, HostComponent>;

    fn acquire(self, mp: &'a MemProtect) -> Self::Guard {
        mp.host.lock()
    }
}

impl<'a> HostSlot<'a> for NoLock {
    type Guard = ();

    fn acquire(self, _mp: &'a MemProtect) {}
}

impl<'a> GuestSlot<'a> for Guest<'a> {
    type Guard = MutexGuard<'a, GuestStage2>;

    fn acquire(self) -> Self::Guard {
        self.0.lock()
    }
}

impl<'a> GuestSlot<'a> for NoLock {
    type Guard = ();

    fn acquire(self) {}
}

impl<'a> HypSlot<'a> for Hyp {
    type Guard = MutexGuard<'a, HypComponent>;

    fn acquire(self, mp: &'a MemProtect) -> Self::Guard {
        mp.hyp.lock()
    }
}

impl<'a> HypSlot<'a> for NoLock {
    type Guard = ();

    fn acquire(self, _mp: &'a MemProtect) {}
}

/// The guards held for one transition. Fields drop in declaration order, which releases the
/// hypervisor first and the host last.
pub struct Locked<H, G, Y> {
    pub hyp: Y,
    pub guest: G,
    pub host: H,
}

impl MemProtect {
    /// Locks the selected principals in host, guest, hyp order and runs `f` with them held.
    pub(crate) fn with_principals_locked<'a, H, G, Y, R, F>(
        &'a self,
        host: H,
        guest: G,
        hyp: Y,
        f: F,
    ) -> R
    where
        H: HostSlot<'a>,
        G: GuestSlot<'a>,
        Y: HypSlot<'a>,
        F: FnOnce(&mut Locked<H::Guard, G::Guard, Y::Guard>) -> R,
    {
        let host = host.acquire(self);
        let guest = guest.acquire();
        let hyp = hyp.acquire(self);
        let mut locked = Locked { hyp, guest, host };
        f(&mut locked)
    }
}
