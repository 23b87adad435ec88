// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Debug dumps of the host and guest stage-2 tables.

use alloc::vec::Vec;
use arm_page_tables::{LeafVisit, PageTable, PtePolicy};
use arm_pages::{PageState, PAGE_SHIFT, PAGE_SIZE};
use log::warn;

use crate::mem_protect::MemProtect;
use crate::{Error, Result};

/// Table handle of the host stage-2. Guests are named by their VM handle.
pub const PTDUMP_HOST_HANDLE: u64 = 0;

// Bytes taken by the header at the start of each log page, and by each record.
const LOG_HEADER_SIZE: u64 = 16;
const LOG_RECORD_SIZE: u64 = 8;

/// Number of records each donated log page holds.
pub const PTDUMP_LOGS_PER_PAGE: usize = ((PAGE_SIZE - LOG_HEADER_SIZE) / LOG_RECORD_SIZE) as usize;

/// Table geometry that can be queried with `ptdump_config()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtdumpOp {
    /// The level of the root table.
    StartLevel,
    /// The width of the input address space.
    IaBits,
}

/// One leaf or invalid entry of a dumped table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtdumpLog {
    /// First input page translated by the entry.
    pub pfn: u64,
    pub valid: bool,
    pub r: bool,
    pub w: bool,
    /// Raw execute-never field.
    pub xn: u64,
    /// The descriptor's type bit; set for level 3 pages.
    pub table: bool,
    pub level: u64,
    /// Ownership state of valid entries.
    pub page_state: Option<PageState>,
}

impl From<&LeafVisit> for PtdumpLog {
    fn from(visit: &LeafVisit) -> Self {
        let pte = visit.pte;
        Self {
            pfn: visit.entry_base() >> PAGE_SHIFT,
            valid: pte.valid(),
            r: pte.s2ap_r(),
            w: pte.s2ap_w(),
            xn: pte.xn(),
            table: pte.type_bit(),
            level: visit.level.index(),
            page_state: visit.entry.state(),
        }
    }
}

fn config_of<P: PtePolicy>(pgt: &PageTable<P>, op: PtdumpOp) -> u64 {
    match op {
        PtdumpOp::StartLevel => pgt.start_level().index(),
        PtdumpOp::IaBits => pgt.ia_bits(),
    }
}

fn walk_into<P: PtePolicy>(pgt: &PageTable<P>, logs: &mut Vec<PtdumpLog>, capacity: usize) -> Result<()> {
    pgt.walk_leaves::<Error, _>(0, 1 << pgt.ia_bits(), |visit| {
        if logs.len() >= capacity {
            return Err(Error::OutOfMemory);
        }
        logs.push(PtdumpLog::from(visit));
        Ok(())
    })
}

impl MemProtect {
    /// Returns the start level or IA width of the table named by `handle`.
    pub fn ptdump_config(&self, handle: u64, op: PtdumpOp) -> Result<u64> {
        if handle == PTDUMP_HOST_HANDLE {
            return Ok(config_of(self.host.lock().pgt(), op));
        }
        let vm = self.get_vm(handle).ok_or(Error::InvalidArgument)?;
        let guest = vm.lock();
        Ok(config_of(guest.pgt()?, op))
    }

    /// Dumps every leaf and invalid entry of the table named by `handle`.
    ///
    /// The host lends the pages in `log_pfns` to the hypervisor for the duration of the walk; they
    /// bound the size of the dump. Returns `OutOfMemory` if they are too few.
    pub fn ptdump_walk(&self, handle: u64, log_pfns: &[u64]) -> Result<Vec<PtdumpLog>> {
        for (i, &pfn) in log_pfns.iter().enumerate() {
            if let Err(e) = self.host_donate_hyp(pfn, 1, false) {
                self.return_log_pages(&log_pfns[..i]);
                return Err(e);
            }
        }

        let capacity = log_pfns.len() * PTDUMP_LOGS_PER_PAGE;
        let mut logs = Vec::new();
        let res = if handle == PTDUMP_HOST_HANDLE {
            walk_into(self.host.lock().pgt(), &mut logs, capacity)
        } else {
            match self.get_vm(handle) {
                Some(vm) => {
                    let guest = vm.lock();
                    guest
                        .pgt()
                        .and_then(|pgt| walk_into(pgt, &mut logs, capacity))
                }
                None => Err(Error::InvalidArgument),
            }
        };

        self.return_log_pages(log_pfns);
        res.map(|()| logs)
    }

    fn return_log_pages(&self, pfns: &[u64]) {
        for &pfn in pfns {
            if let Err(e) = self.hyp_donate_host(pfn, 1) {
                warn!("ptdump: log page {pfn:#x} not returned: {e:?}");
            }
        }
    }
}
