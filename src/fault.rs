// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Host stage-2 abort handling: lazily rebuilding the host identity map, and reflecting illegal
//! accesses back to the host as synchronous external aborts.

use arm_pages::PAGE_SHIFT;
use arm_regs::{
    el1h_exception_spsr, fault_ipa, spsr, AbortSyndrome, ExceptionClass, ExceptionOrigin,
    FaultStatus,
};
use log::{error, trace, warn};
use tock_registers::LocalRegisterCopy;

use crate::mem_protect::MemProtect;
use crate::Error;

/// EL2 registers describing an abort taken from the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct El2Regs {
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
    pub elr: u64,
    pub spsr: u64,
}

/// The host's EL1 exception state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct El1Regs {
    pub esr: u64,
    pub far: u64,
    pub elr: u64,
    pub spsr: u64,
    pub vbar: u64,
    pub sctlr: u64,
}

/// The host CPU state saved on entry to the hypervisor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostCpuContext {
    pub regs: [u64; 31],
    pub el2: El2Regs,
    pub el1: El1Regs,
}

// Builds an HPFAR_EL2 value for the page containing `phys`.
fn hpfar_from_phys(phys: u64) -> u64 {
    (phys >> PAGE_SHIFT) << 4
}

impl MemProtect {
    /// Handles a host stage-2 abort described by the EL2 registers in `ctx`.
    ///
    /// Translation faults on pages the host may access are resolved by mapping them back in.
    /// Illegal accesses are reflected back to the host as an abort. Any other failure is a
    /// hypervisor bug.
    pub fn handle_host_mem_abort(&self, ctx: &mut HostCpuContext) {
        let esr = ctx.el2.esr;
        let syndrome = AbortSyndrome::new(esr);
        let mut hpfar = ctx.el2.hpfar;
        // HPFAR_EL2 isn't valid for permission faults on anything but a stage-1 walk.
        if syndrome.fault_status() == FaultStatus::Permission && !syndrome.is_s1ptw() {
            match self.platform().translate_far(ctx.el2.far) {
                Some(phys) => hpfar = hpfar_from_phys(phys),
                // The host's stage-1 changed under us; let it take the fault again.
                None => return,
            }
        }
        let addr = fault_ipa(hpfar, ctx.el2.far);

        let is_dabt = syndrome.class() == Ok(ExceptionClass::DataAbortLow);
        if is_dabt
            && !self.mem_map().addr_is_memory(addr)
            && self.iommu().host_dabt_handler(ctx, esr, addr)
        {
            return;
        }

        let res = match syndrome.fault_status() {
            FaultStatus::Translation => self.host_stage2_idmap(addr),
            FaultStatus::Permission => match self.perm_fault_handler() {
                Some(handler) if handler(ctx, esr, addr) => Ok(()),
                _ => Err(Error::PermissionDenied),
            },
            _ => Err(Error::PermissionDenied),
        };
        match res {
            Ok(()) | Err(Error::Again) => {}
            Err(Error::PermissionDenied) => {
                trace!("injecting abort for host access to {addr:#x}");
                self.host_inject_abort(ctx);
            }
            Err(e) => {
                error!("host abort at {addr:#x} (esr {esr:#x}) failed with {e:?}");
                panic!("unhandled host stage-2 abort: {e}");
            }
        }
    }

    /// Reflects the abort in `ctx` back to the host's EL1 vectors.
    pub fn host_inject_abort(&self, ctx: &mut HostCpuContext) {
        if let Some(notifier) = self.illegal_abt_notifier() {
            notifier(ctx);
        }

        let spsr_el2 = ctx.el2.spsr;
        let mut syndrome = AbortSyndrome::new(ctx.el2.esr);
        let mode = LocalRegisterCopy::<u64, spsr::Register>::new(spsr_el2).read_as_enum(spsr::mode);
        // Aborts taken from EL1 are reported as same-level faults.
        if mode != Some(spsr::mode::Value::El0t) {
            match syndrome.class() {
                Ok(class) => syndrome = syndrome.with_class(class.to_current_el()),
                Err(e) => warn!("injecting abort with unexpected syndrome: {e:?}"),
            }
        }
        // S1PTW is never set by hardware in ESR_EL1, so the host can tell these aborts apart.
        syndrome = syndrome.with_s1ptw();

        ctx.el1.esr = syndrome.bits();
        ctx.el1.spsr = spsr_el2;
        ctx.el1.elr = ctx.el2.elr;
        ctx.el1.far = ctx.el2.far;

        ctx.el2.elr = ctx.el1.vbar + ExceptionOrigin::from_spsr(spsr_el2).vector_offset();
        ctx.el2.spsr = el1h_exception_spsr(spsr_el2, ctx.el1.sctlr, self.platform().has_mte());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    const DABT_LOW: u64 = 0x24 << 26;
    const DABT_CUR: u64 = 0x25 << 26;
    const IABT_LOW: u64 = 0x20 << 26;
    const FSC_TRANSLATION: u64 = 0x07;
    const FSC_PERMISSION: u64 = 0x0f;
    const SPSR_EL1H: u64 = 0b0101;
    const VBAR: u64 = 0xffff_8000_1000_0000;

    fn abort_at(esr: u64, addr: u64, spsr: u64) -> HostCpuContext {
        HostCpuContext {
            el2: El2Regs {
                esr,
                far: addr,
                hpfar: hpfar_from_phys(addr),
                elr: 0xffff_8000_0800_1234,
                spsr,
            },
            el1: El1Regs {
                vbar: VBAR,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn translation_fault_maps_the_page() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let addr = MMIO_BASE + 0x40;
        assert!(!mp.host_stage2_get_leaf(MMIO_BASE).unwrap().0.valid());
        let mut ctx = abort_at(DABT_LOW | FSC_TRANSLATION, addr, SPSR_EL1H);
        let before = ctx.clone();
        mp.handle_host_mem_abort(&mut ctx);
        assert_eq!(ctx, before);
        assert!(mp.host_stage2_get_leaf(MMIO_BASE).unwrap().0.valid());
        // A stale fault on a page that's already mapped is ignored.
        mp.handle_host_mem_abort(&mut ctx);
        assert_eq!(ctx, before);
    }

    #[test]
    fn iommu_emulates_mmio_aborts() {
        let env = TestEnv::new();
        let mp = &env.mp;
        env.iommu.emulate_dabt.store(true, Ordering::Relaxed);
        let mut ctx = abort_at(DABT_LOW | FSC_TRANSLATION, MMIO_BASE, SPSR_EL1H);
        mp.handle_host_mem_abort(&mut ctx);
        assert!(!mp.host_stage2_get_leaf(MMIO_BASE).unwrap().0.valid());
        // Instruction fetches aren't offered to the driver.
        let mut ctx = abort_at(IABT_LOW | FSC_TRANSLATION, MMIO_BASE, SPSR_EL1H);
        mp.handle_host_mem_abort(&mut ctx);
        assert!(mp.host_stage2_get_leaf(MMIO_BASE).unwrap().0.valid());
    }

    #[test]
    fn same_el_aborts_skip_the_iommu() {
        let env = TestEnv::new();
        let mp = &env.mp;
        env.iommu.emulate_dabt.store(true, Ordering::Relaxed);
        let mut ctx = abort_at(DABT_CUR | FSC_TRANSLATION, MMIO_BASE, SPSR_EL1H);
        mp.handle_host_mem_abort(&mut ctx);
        assert!(mp.host_stage2_get_leaf(MMIO_BASE).unwrap().0.valid());
    }

    static NOTIFIED: AtomicU64 = AtomicU64::new(0);

    fn count_illegal_abort(_ctx: &HostCpuContext) {
        NOTIFIED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn illegal_access_is_reflected_to_el1() {
        let env = TestEnv::new();
        let mp = &env.mp;
        mp.register_illegal_abt_notifier(count_illegal_abort)
            .unwrap();
        assert_eq!(
            mp.register_illegal_abt_notifier(count_illegal_abort),
            Err(Error::Busy)
        );
        let pfn = host_pfn(0);
        let addr = pfn << PAGE_SHIFT;
        mp.host_donate_hyp(pfn, 1, false).unwrap();

        let esr = DABT_LOW | FSC_TRANSLATION;
        let spsr = SPSR_EL1H | (0xf << 28);
        let mut ctx = abort_at(esr, addr + 0x10, spsr);
        let old = ctx.el2.clone();
        mp.handle_host_mem_abort(&mut ctx);

        assert_eq!(NOTIFIED.load(Ordering::Relaxed), 1);
        let injected = AbortSyndrome::new(ctx.el1.esr);
        assert_eq!(injected.class(), Ok(ExceptionClass::DataAbortCur));
        assert!(injected.is_s1ptw());
        assert_eq!(injected.fault_status(), FaultStatus::Translation);
        assert_eq!(ctx.el1.spsr, spsr);
        assert_eq!(ctx.el1.elr, old.elr);
        assert_eq!(ctx.el1.far, old.far);
        assert_eq!(ctx.el2.elr, VBAR + 0x200);
        assert_eq!(ctx.el2.spsr, el1h_exception_spsr(spsr, 0, false));
        // The host still can't see the page.
        assert!(!mp.host_stage2_get_leaf(addr).unwrap().0.valid());
    }

    #[test]
    fn el0_aborts_keep_their_class() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let pfn = host_pfn(1);
        mp.host_donate_hyp(pfn, 1, false).unwrap();
        let mut ctx = abort_at(IABT_LOW | FSC_TRANSLATION, pfn << PAGE_SHIFT, 0);
        mp.handle_host_mem_abort(&mut ctx);
        let injected = AbortSyndrome::new(ctx.el1.esr);
        assert_eq!(injected.class(), Ok(ExceptionClass::InstAbortLow));
        assert_eq!(ctx.el2.elr, VBAR + 0x400);
    }

    fn handle_if_x0_set(ctx: &mut HostCpuContext, _esr: u64, addr: u64) -> bool {
        ctx.regs[1] = addr;
        ctx.regs[0] != 0
    }

    #[test]
    fn permission_faults_go_to_the_module() {
        let env = TestEnv::new();
        let mp = &env.mp;
        let addr = host_pfn(2) << PAGE_SHIFT;
        let esr = DABT_LOW | FSC_PERMISSION;

        // Without a handler the access is illegal.
        let mut ctx = abort_at(esr, addr, SPSR_EL1H);
        ctx.el2.hpfar = 0;
        mp.handle_host_mem_abort(&mut ctx);
        assert_ne!(ctx.el1.esr, 0);

        mp.register_host_perm_fault_handler(handle_if_x0_set)
            .unwrap();
        assert_eq!(
            mp.register_host_perm_fault_handler(handle_if_x0_set),
            Err(Error::Busy)
        );
        let mut ctx = abort_at(esr, addr + 0x18, SPSR_EL1H);
        // HPFAR isn't valid for permission faults; the address comes from FAR.
        ctx.el2.hpfar = 0;
        ctx.regs[0] = 1;
        mp.handle_host_mem_abort(&mut ctx);
        assert_eq!(ctx.regs[1], addr + 0x18);
        assert_eq!(ctx.el1.esr, 0);

        ctx.regs[0] = 0;
        mp.handle_host_mem_abort(&mut ctx);
        assert_ne!(ctx.el1.esr, 0);
    }

    #[test]
    fn failed_far_translation_retries() {
        let env = TestEnv::new();
        let mp = &env.mp;
        env.platform.fail_translation.store(true, Ordering::Relaxed);
        let mut ctx = abort_at(DABT_LOW | FSC_PERMISSION, host_pfn(3) << PAGE_SHIFT, SPSR_EL1H);
        let before = ctx.clone();
        mp.handle_host_mem_abort(&mut ctx);
        assert_eq!(ctx, before);
    }

    #[test]
    fn module_registration_closes_on_finalize() {
        let env = TestEnv::new();
        let mp = &env.mp;
        mp.prot_finalize().unwrap();
        assert_eq!(mp.prot_finalize(), Err(Error::PermissionDenied));
        assert_eq!(
            mp.register_host_perm_fault_handler(handle_if_x0_set),
            Err(Error::PermissionDenied)
        );
    }
}
