// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::{esr, spsr, HPFAR_MASK};
use tock_registers::LocalRegisterCopy;

/// Errors as a result of decoding syndrome values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The exception class isn't an instruction or data abort.
    UnknownClass(u64),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Abort exception classes taken to EL2.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExceptionClass {
    /// Instruction abort from a lower exception level.
    InstAbortLow,
    /// Instruction abort taken without a change in exception level.
    InstAbortCur,
    /// Data abort from a lower exception level.
    DataAbortLow,
    /// Data abort taken without a change in exception level.
    DataAbortCur,
}

impl ExceptionClass {
    /// Returns the raw EC value.
    pub fn raw(&self) -> u64 {
        match self {
            ExceptionClass::InstAbortLow => 0x20,
            ExceptionClass::InstAbortCur => 0x21,
            ExceptionClass::DataAbortLow => 0x24,
            ExceptionClass::DataAbortCur => 0x25,
        }
    }

    /// Returns true for data aborts.
    pub fn is_data_abort(&self) -> bool {
        matches!(
            self,
            ExceptionClass::DataAbortLow | ExceptionClass::DataAbortCur
        )
    }

    /// Returns the same abort as taken without a change in exception level.
    pub fn to_current_el(self) -> Self {
        match self {
            ExceptionClass::InstAbortLow => ExceptionClass::InstAbortCur,
            ExceptionClass::DataAbortLow => ExceptionClass::DataAbortCur,
            other => other,
        }
    }
}

impl TryFrom<u64> for ExceptionClass {
    type Error = Error;

    fn try_from(ec: u64) -> Result<Self> {
        match ec {
            0x20 => Ok(ExceptionClass::InstAbortLow),
            0x21 => Ok(ExceptionClass::InstAbortCur),
            0x24 => Ok(ExceptionClass::DataAbortLow),
            0x25 => Ok(ExceptionClass::DataAbortCur),
            v => Err(Error::UnknownClass(v)),
        }
    }
}

/// Kind of fault reported by an abort's fault status code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultStatus {
    /// No translation at some level.
    Translation,
    /// The access flag was clear.
    AccessFlag,
    /// The translation didn't allow the access.
    Permission,
    /// Anything else: external aborts, alignment, TLB conflicts and so on.
    Other(u64),
}

impl FaultStatus {
    const TYPE_MASK: u64 = 0x3c;

    /// Decodes the fault status code, ignoring the level bits.
    pub fn from_fsc(fsc: u64) -> Self {
        match fsc & Self::TYPE_MASK {
            0x04 => FaultStatus::Translation,
            0x08 => FaultStatus::AccessFlag,
            0x0c => FaultStatus::Permission,
            _ => FaultStatus::Other(fsc),
        }
    }
}

/// Decoded view of an abort syndrome.
#[derive(Copy, Clone, Debug)]
pub struct AbortSyndrome {
    esr: LocalRegisterCopy<u64, esr::Register>,
}

impl AbortSyndrome {
    /// Wraps a raw ESR_EL2 value.
    pub fn new(raw: u64) -> Self {
        Self {
            esr: LocalRegisterCopy::new(raw),
        }
    }

    /// Returns the raw syndrome.
    pub fn bits(&self) -> u64 {
        self.esr.get()
    }

    /// Returns the exception class, if it is an abort.
    pub fn class(&self) -> Result<ExceptionClass> {
        ExceptionClass::try_from(self.esr.read(esr::ec))
    }

    /// Returns the kind of fault.
    pub fn fault_status(&self) -> FaultStatus {
        FaultStatus::from_fsc(self.esr.read(esr::fsc))
    }

    /// Returns true if the abort was taken on the stage-2 translation of a stage-1 walk.
    pub fn is_s1ptw(&self) -> bool {
        self.esr.is_set(esr::s1ptw)
    }

    /// Returns true for a data abort whose access syndrome (size, register) is valid.
    pub fn is_valid_dabt(&self) -> bool {
        self.class().is_ok_and(|c| c.is_data_abort()) && self.esr.is_set(esr::isv)
    }

    /// Returns the size in bytes of the access that caused a data abort.
    pub fn access_size(&self) -> u64 {
        1 << self.esr.read(esr::sas)
    }

    /// Returns the syndrome with the class replaced.
    pub fn with_class(&self, class: ExceptionClass) -> Self {
        let mut esr = self.esr;
        esr.modify(esr::ec.val(class.raw()));
        Self { esr }
    }

    /// Returns the syndrome with S1PTW set.
    pub fn with_s1ptw(&self) -> Self {
        let mut esr = self.esr;
        esr.modify(esr::s1ptw::SET);
        Self { esr }
    }
}

/// Combines HPFAR_EL2 and FAR_EL2 into the faulting IPA.
pub fn fault_ipa(hpfar: u64, far: u64) -> u64 {
    ((hpfar & HPFAR_MASK) << 8) | (far & 0xfff)
}

/// Where the exception came from, relative to an exception taken to EL1.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExceptionOrigin {
    CurrentElSp0,
    CurrentElSpx,
    LowerElAArch64,
    LowerElAArch32,
}

impl ExceptionOrigin {
    /// Classifies a saved SPSR value.
    pub fn from_spsr(raw: u64) -> Self {
        let spsr = LocalRegisterCopy::<u64, spsr::Register>::new(raw);
        if spsr.is_set(spsr::nrw) {
            return ExceptionOrigin::LowerElAArch32;
        }
        match spsr.read_as_enum(spsr::mode) {
            Some(spsr::mode::Value::El1t) => ExceptionOrigin::CurrentElSp0,
            Some(spsr::mode::Value::El1h) => ExceptionOrigin::CurrentElSpx,
            _ => ExceptionOrigin::LowerElAArch64,
        }
    }

    /// Returns the offset of the synchronous exception vector in VBAR_EL1.
    pub fn vector_offset(&self) -> u64 {
        match self {
            ExceptionOrigin::CurrentElSp0 => 0x0,
            ExceptionOrigin::CurrentElSpx => 0x200,
            ExceptionOrigin::LowerElAArch64 => 0x400,
            ExceptionOrigin::LowerElAArch32 => 0x600,
        }
    }
}

/// Builds the SPSR for entering an EL1 exception vector with SP_EL1, given the interrupted
/// context's SPSR and SCTLR_EL1.
pub fn el1h_exception_spsr(old: u64, sctlr_el1: u64, has_mte: bool) -> u64 {
    let old = LocalRegisterCopy::<u64, spsr::Register>::new(old);
    let sctlr = LocalRegisterCopy::<u64, crate::sctlr::Register>::new(sctlr_el1);
    let mut new = LocalRegisterCopy::<u64, spsr::Register>::new(0);
    new.modify(
        spsr::n.val(old.read(spsr::n))
            + spsr::z.val(old.read(spsr::z))
            + spsr::c.val(old.read(spsr::c))
            + spsr::v.val(old.read(spsr::v))
            + spsr::dit.val(old.read(spsr::dit))
            + spsr::pan.val(old.read(spsr::pan)),
    );
    if !sctlr.is_set(crate::sctlr::span) {
        new.modify(spsr::pan::SET);
    }
    if sctlr.is_set(crate::sctlr::dssbs) {
        new.modify(spsr::ssbs::SET);
    }
    if has_mte {
        new.modify(spsr::tco::SET);
    }
    new.modify(
        spsr::d::SET + spsr::a::SET + spsr::i::SET + spsr::f::SET + spsr::mode::El1h,
    );
    new.get()
}
