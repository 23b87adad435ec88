// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use tock_registers::register_bitfields;

// Exception syndrome.
register_bitfields![u64,
    pub esr [
        // Instruction specific syndrome. The low 6 bits hold the fault status code for aborts.
        iss OFFSET(0) NUMBITS(25) [],
        // Fault status code of instruction and data aborts.
        fsc OFFSET(0) NUMBITS(6) [],
        // Fault on a stage-2 translation of a stage-1 table walk.
        s1ptw OFFSET(7) NUMBITS(1) [],
        // Log2 of the access size of a data abort, valid with `isv`.
        sas OFFSET(22) NUMBITS(2) [],
        // The data abort syndrome fields are valid.
        isv OFFSET(24) NUMBITS(1) [],
        // Instruction length.
        il OFFSET(25) NUMBITS(1) [],
        // Exception class.
        ec OFFSET(26) NUMBITS(6) [
            InstAbortLow = 0x20,
            InstAbortCur = 0x21,
            DataAbortLow = 0x24,
            DataAbortCur = 0x25,
        ],
    ]
];

// Saved program status.
register_bitfields![u64,
    pub spsr [
        // Exception level and stack pointer selection.
        mode OFFSET(0) NUMBITS(4) [
            El0t = 0b0000,
            El1t = 0b0100,
            El1h = 0b0101,
            El2t = 0b1000,
            El2h = 0b1001,
        ],
        // Execution state at the time of the exception.
        nrw OFFSET(4) NUMBITS(1) [
            AArch64 = 0,
            AArch32 = 1,
        ],
        f OFFSET(6) NUMBITS(1) [],
        i OFFSET(7) NUMBITS(1) [],
        a OFFSET(8) NUMBITS(1) [],
        d OFFSET(9) NUMBITS(1) [],
        ssbs OFFSET(12) NUMBITS(1) [],
        pan OFFSET(22) NUMBITS(1) [],
        uao OFFSET(23) NUMBITS(1) [],
        dit OFFSET(24) NUMBITS(1) [],
        tco OFFSET(25) NUMBITS(1) [],
        v OFFSET(28) NUMBITS(1) [],
        c OFFSET(29) NUMBITS(1) [],
        z OFFSET(30) NUMBITS(1) [],
        n OFFSET(31) NUMBITS(1) [],
    ]
];

// EL1 system control.
register_bitfields![u64,
    pub sctlr [
        // Set privileged access never on taking an exception to EL1 when clear.
        span OFFSET(23) NUMBITS(1) [],
        // Default value of PSTATE.SSBS on taking an exception to EL1.
        dssbs OFFSET(44) NUMBITS(1) [],
    ]
];

// Faulting intermediate physical address.
register_bitfields![u64,
    pub hpfar [
        // Bits [51:12] of the faulting IPA.
        fipa OFFSET(4) NUMBITS(40) [],
    ]
];

/// Mask of the faulting IPA field of HPFAR_EL2.
pub const HPFAR_MASK: u64 = ((1 << 40) - 1) << 4;
