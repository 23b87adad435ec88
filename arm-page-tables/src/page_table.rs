// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use arm_pages::{PageSize, PhysPfn};
use log::warn;
use page_tracking::HypPool;

use crate::level::{Geometry, Level, ENTRIES_PER_PAGE};
use crate::pte::{Entry, LeafAttrs, Prot, Pte};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The allocator couldn't provide a page for an intermediate or root table.
    InsufficientPtePages,
    /// The range falls outside of the table's input address space.
    OutOfBounds,
    /// The address or size isn't aligned to the base granule.
    Misaligned,
    /// The input address size can't be translated by a 4kB-granule table.
    InvalidIaBits,
    /// No valid leaf maps the address.
    NotMapped,
}
pub type Result<T> = core::result::Result<T, Error>;

/// Per-flavour decisions the walker defers to the owner of the table.
pub trait PtePolicy {
    /// Returns true if `new` must be installed with page granularity across `[addr, end)` rather
    /// than with the largest block the alignment allows.
    fn force_pte(&self, _addr: u64, _end: u64, _new: &Entry) -> bool {
        false
    }

    /// Returns true if `entry` holds a reference on the table page containing it. A table page is
    /// freed once it holds no references beyond its allocation.
    fn pte_is_counted(&self, entry: &Entry, level: Level) -> bool;
}

/// Source of table pages. Passed explicitly to every call that may allocate or free.
pub trait PageTableAllocator {
    /// Allocates a zeroed page holding one reference.
    fn zalloc_page(&mut self) -> Option<PhysPfn>;
    /// Allocates `nr_pages` contiguous zeroed pages, each holding one reference.
    fn zalloc_pages_exact(&mut self, nr_pages: u64) -> Option<PhysPfn>;
    /// Takes a reference on a table page.
    fn get_page(&mut self, pfn: PhysPfn);
    /// Drops a reference on a table page, freeing it on the last.
    fn put_page(&mut self, pfn: PhysPfn);
    /// Returns the number of references held on a table page.
    fn page_count(&self, pfn: PhysPfn) -> u16;
}

impl PageTableAllocator for HypPool {
    fn zalloc_page(&mut self) -> Option<PhysPfn> {
        self.alloc_page()
    }

    fn zalloc_pages_exact(&mut self, nr_pages: u64) -> Option<PhysPfn> {
        self.alloc_pages_exact(nr_pages)
    }

    fn get_page(&mut self, pfn: PhysPfn) {
        HypPool::get_page(self, pfn)
    }

    fn put_page(&mut self, pfn: PhysPfn) {
        HypPool::put_page(self, pfn)
    }

    fn page_count(&self, pfn: PhysPfn) -> u16 {
        HypPool::page_count(self, pfn)
    }
}

/// A leaf (or invalid) entry reached by a walk, and the address the walk was at when it got there.
/// `addr` need not be aligned to the entry's granule.
#[derive(Clone, Copy, Debug)]
pub struct LeafVisit {
    pub addr: u64,
    pub level: Level,
    pub pte: Pte,
    pub entry: Entry,
}

impl LeafVisit {
    /// Returns the start of the range translated by the entry.
    pub fn entry_base(&self) -> u64 {
        self.level.page_size().round_down(self.addr)
    }

    /// Returns the size of the range translated by the entry.
    pub fn granule(&self) -> u64 {
        self.level.granule()
    }
}

// What `install` writes over a range.
#[derive(Clone, Copy)]
enum Target {
    Map { ipa: u64, phys: u64, attrs: LeafAttrs },
    Annotation(Entry),
}

impl Target {
    fn entry_at(&self, addr: u64) -> Entry {
        match *self {
            Target::Map { ipa, phys, attrs } => Entry::leaf(phys + (addr - ipa), attrs),
            Target::Annotation(entry) => entry,
        }
    }

    fn aligned_for(&self, addr: u64, size: PageSize) -> bool {
        match *self {
            Target::Map { ipa, phys, .. } => size.is_aligned(phys + (addr - ipa)),
            Target::Annotation(_) => true,
        }
    }
}

/// A software-walked translation table whose descriptors follow the stage-2 layout of `Pte`.
///
/// Table pages come from a `PageTableAllocator`, which also holds their refcounts. The descriptors
/// themselves are kept in a map keyed by the table page's frame number. Blocks that need to change
/// partially are split into a next-level table pre-populated with equivalent smaller mappings, so
/// the rest of the block survives.
pub struct PageTable<P: PtePolicy> {
    geometry: Geometry,
    root: PhysPfn,
    nodes: BTreeMap<u64, Vec<u64>>,
    policy: P,
}

impl<P: PtePolicy> PageTable<P> {
    /// Creates an empty table for an `ia_bits`-wide input space, allocating the root from `alloc`.
    pub fn new(
        ia_bits: u64,
        concatenate: bool,
        policy: P,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<Self> {
        let geometry = Geometry::new(ia_bits, concatenate).ok_or(Error::InvalidIaBits)?;
        let root_pages = geometry.root_pages();
        let root = alloc
            .zalloc_pages_exact(root_pages)
            .ok_or(Error::InsufficientPtePages)?;
        let mut nodes = BTreeMap::new();
        nodes.insert(
            root.bits(),
            alloc::vec![0; (root_pages * ENTRIES_PER_PAGE) as usize],
        );
        Ok(Self {
            geometry,
            root,
            nodes,
            policy,
        })
    }

    /// Returns the width of the input address space.
    pub fn ia_bits(&self) -> u64 {
        self.geometry.ia_bits()
    }

    /// Returns the level of the root table.
    pub fn start_level(&self) -> Level {
        self.geometry.start_level()
    }

    /// Returns the first frame of the root table.
    pub fn root(&self) -> PhysPfn {
        self.root
    }

    /// Returns the policy the table was created with.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Returns the number of table pages currently in use, root included.
    pub fn table_pages(&self) -> usize {
        self.nodes
            .values()
            .map(|n| n.len() / ENTRIES_PER_PAGE as usize)
            .sum()
    }

    fn check_range(&self, addr: u64, size: u64) -> Result<u64> {
        let end = addr.checked_add(size).ok_or(Error::OutOfBounds)?;
        if end > self.geometry.ia_end() {
            return Err(Error::OutOfBounds);
        }
        Ok(end)
    }

    fn read(&self, table: u64, idx: usize) -> Pte {
        let raw = self
            .nodes
            .get(&table)
            .and_then(|n| n.get(idx))
            .copied()
            .unwrap_or(0);
        Pte::from_bits(raw)
    }

    // The page of a (possibly concatenated) table that holds descriptor `idx`.
    fn table_page(table: u64, idx: usize) -> PhysPfn {
        PhysPfn::phys(table + idx as u64 / ENTRIES_PER_PAGE)
    }

    // Replaces the descriptor at `idx`, moving the table-page reference held by counted entries.
    fn set_entry(
        &mut self,
        table: u64,
        idx: usize,
        level: Level,
        new: &Entry,
        alloc: &mut dyn PageTableAllocator,
    ) {
        let old = self.read(table, idx).decode(level);
        let page = Self::table_page(table, idx);
        if self.policy.pte_is_counted(new, level) {
            alloc.get_page(page);
        }
        if self.policy.pte_is_counted(&old, level) {
            alloc.put_page(page);
        }
        if let Some(slot) = self.nodes.get_mut(&table).and_then(|n| n.get_mut(idx)) {
            *slot = Pte::encode(new, level).bits();
        }
    }

    // Frees the table at `table` (a level-`level` table) and everything below it.
    fn free_table(&mut self, table: u64, level: Level, alloc: &mut dyn PageTableAllocator) {
        let Some(entries) = self.nodes.remove(&table) else {
            return;
        };
        for (idx, raw) in entries.iter().enumerate() {
            let entry = Pte::from_bits(*raw).decode(level);
            if let (Entry::Table(child), Some(next)) = (entry, level.next()) {
                self.free_table(child.bits(), next, alloc);
            }
            if self.policy.pte_is_counted(&entry, level) {
                alloc.put_page(Self::table_page(table, idx));
            }
        }
        let pages = entries.len() as u64 / ENTRIES_PER_PAGE;
        for page in 0..pages {
            alloc.put_page(PhysPfn::phys(table + page));
        }
    }

    // Replaces the invalid or leaf entry at `idx` with a table holding the equivalent next-level
    // entries. Returns the new table.
    fn split_entry(
        &mut self,
        table: u64,
        idx: usize,
        level: Level,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<u64> {
        let next = level.next().ok_or(Error::OutOfBounds)?;
        let old = self.read(table, idx).decode(level);
        let child = alloc.zalloc_page().ok_or(Error::InsufficientPtePages)?;
        let mut entries = alloc::vec![0; ENTRIES_PER_PAGE as usize];
        for (i, slot) in entries.iter_mut().enumerate() {
            let entry = match old {
                Entry::Leaf { phys, attrs, young } => Entry::Leaf {
                    phys: phys + i as u64 * next.granule(),
                    attrs,
                    young,
                },
                Entry::Table(_) => Entry::Empty,
                other => other,
            };
            if self.policy.pte_is_counted(&entry, next) {
                alloc.get_page(child);
            }
            *slot = Pte::encode(&entry, next).bits();
        }
        self.nodes.insert(child.bits(), entries);
        self.set_entry(table, idx, level, &Entry::Table(child), alloc);
        Ok(child.bits())
    }

    // Returns the descriptor for `addr` and the level it was found at, stopping at the first
    // entry that isn't a table. Also returns the table and index holding it.
    fn locate(&self, addr: u64) -> (u64, usize, Level, Pte) {
        let mut table = self.root.bits();
        let mut level = self.start_level();
        loop {
            let idx = self.geometry.index(level, addr);
            let pte = self.read(table, idx);
            match (pte.decode(level), level.next()) {
                (Entry::Table(child), Some(next)) => {
                    table = child.bits();
                    level = next;
                }
                _ => return (table, idx, level, pte),
            }
        }
    }

    /// Returns the leaf (or invalid) descriptor translating `addr` and its level.
    pub fn get_leaf(&self, addr: u64) -> Result<(Pte, Level)> {
        self.check_range(addr, 0)?;
        if addr >= self.geometry.ia_end() {
            return Err(Error::OutOfBounds);
        }
        let (_, _, level, pte) = self.locate(addr);
        Ok((pte, level))
    }

    /// Calls `visit` on every leaf or invalid entry translating part of `[addr, addr + size)`.
    /// Stops at the first error returned by `visit`.
    pub fn walk_leaves<E, F>(&self, addr: u64, size: u64, mut visit: F) -> core::result::Result<(), E>
    where
        E: From<Error>,
        F: FnMut(&LeafVisit) -> core::result::Result<(), E>,
    {
        let end = self.check_range(addr, size)?;
        let mut cur = addr;
        while cur < end {
            let (_, _, level, pte) = self.locate(cur);
            visit(&LeafVisit {
                addr: cur,
                level,
                pte,
                entry: pte.decode(level),
            })?;
            cur = level.page_size().round_down(cur) + level.granule();
        }
        Ok(())
    }

    // Rewrites every leaf entry translating part of the range for which `update` returns a
    // replacement.
    fn update_leaves<F>(&mut self, addr: u64, size: u64, mut update: F, alloc: &mut dyn PageTableAllocator) -> Result<()>
    where
        F: FnMut(&Entry) -> Option<Entry>,
    {
        let end = self.check_range(addr, size)?;
        let mut cur = addr;
        while cur < end {
            let (table, idx, level, pte) = self.locate(cur);
            if let Some(new) = update(&pte.decode(level)) {
                self.set_entry(table, idx, level, &new, alloc);
            }
            cur = level.page_size().round_down(cur) + level.granule();
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn install(
        &mut self,
        table: u64,
        level: Level,
        addr: &mut u64,
        end: u64,
        target: &Target,
        force_pte: bool,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<()> {
        let span = self.geometry.table_span(level);
        let span_end = (*addr & !(span - 1)).saturating_add(span);
        while *addr < end && *addr < span_end {
            let granule = level.granule();
            let idx = self.geometry.index(level, *addr);
            let old = self.read(table, idx).decode(level);
            let fits = level.page_size().is_aligned(*addr)
                && end - *addr >= granule
                && target.aligned_for(*addr, level.page_size());
            let leaf_ok = level.supports_block_mapping()
                && fits
                && (level.is_last() || !force_pte);
            if leaf_ok {
                if let (Entry::Table(child), Some(next)) = (old, level.next()) {
                    // Every entry below is being overwritten.
                    self.free_table(child.bits(), next, alloc);
                }
                self.set_entry(table, idx, level, &target.entry_at(*addr), alloc);
                *addr += granule;
                continue;
            }
            let next = level.next().ok_or(Error::Misaligned)?;
            let child = match old {
                Entry::Table(child) => child.bits(),
                _ => self.split_entry(table, idx, level, alloc)?,
            };
            self.install(child, next, addr, end, target, force_pte, alloc)?;
        }
        Ok(())
    }

    fn install_range(
        &mut self,
        addr: u64,
        size: u64,
        target: Target,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<()> {
        if !PageSize::Size4k.is_aligned(addr) || !PageSize::Size4k.is_aligned(size) {
            return Err(Error::Misaligned);
        }
        let end = self.check_range(addr, size)?;
        let force_pte = self.policy.force_pte(addr, end, &target.entry_at(addr));
        let mut cur = addr;
        let root = self.root.bits();
        let start_level = self.start_level();
        self.install(root, start_level, &mut cur, end, &target, force_pte, alloc)
    }

    /// Maps `[addr, addr + size)` to `[phys, phys + size)` with `attrs`, replacing whatever was
    /// there.
    pub fn map(
        &mut self,
        addr: u64,
        size: u64,
        phys: u64,
        attrs: LeafAttrs,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<()> {
        if !PageSize::Size4k.is_aligned(phys) {
            return Err(Error::Misaligned);
        }
        let target = Target::Map {
            ipa: addr,
            phys,
            attrs,
        };
        self.install_range(addr, size, target, alloc)
    }

    /// Writes the invalid `annotation` over `[addr, addr + size)`.
    pub fn annotate(
        &mut self,
        addr: u64,
        size: u64,
        annotation: Entry,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<()> {
        if annotation.is_valid() {
            return Err(Error::OutOfBounds);
        }
        self.install_range(addr, size, Target::Annotation(annotation), alloc)
    }

    // Post-order: frees `child` if nothing in it holds a reference any more.
    fn try_free_child(
        &mut self,
        table: u64,
        idx: usize,
        level: Level,
        child: u64,
        alloc: &mut dyn PageTableAllocator,
    ) {
        let Some(next) = level.next() else {
            return;
        };
        if alloc.page_count(PhysPfn::phys(child)) == 1 {
            self.free_table(child, next, alloc);
            self.set_entry(table, idx, level, &Entry::Empty, alloc);
        }
    }

    fn clear(
        &mut self,
        table: u64,
        level: Level,
        addr: &mut u64,
        end: u64,
        unmapped: &mut u64,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<()> {
        let span = self.geometry.table_span(level);
        let span_end = (*addr & !(span - 1)).saturating_add(span);
        while *addr < end && *addr < span_end {
            let granule = level.granule();
            let base = level.page_size().round_down(*addr);
            let idx = self.geometry.index(level, *addr);
            let old = self.read(table, idx).decode(level);
            let covered = base == *addr && end - *addr >= granule;
            match old {
                Entry::Empty => *addr = base + granule,
                Entry::Table(child) => {
                    let next = level.next().ok_or(Error::OutOfBounds)?;
                    self.clear(child.bits(), next, addr, end, unmapped, alloc)?;
                    self.try_free_child(table, idx, level, child.bits(), alloc);
                }
                _ if covered => {
                    if matches!(old, Entry::Leaf { .. }) {
                        *unmapped += granule;
                    }
                    self.set_entry(table, idx, level, &Entry::Empty, alloc);
                    *addr += granule;
                }
                _ => {
                    let next = level.next().ok_or(Error::Misaligned)?;
                    let child = self.split_entry(table, idx, level, alloc)?;
                    self.clear(child, next, addr, end, unmapped, alloc)?;
                    self.try_free_child(table, idx, level, child, alloc);
                }
            }
        }
        Ok(())
    }

    /// Clears every entry, valid or not, in `[addr, addr + size)` and frees tables left without
    /// counted entries. Returns the number of bytes of valid mappings removed.
    pub fn unmap(&mut self, addr: u64, size: u64, alloc: &mut dyn PageTableAllocator) -> Result<u64> {
        if !PageSize::Size4k.is_aligned(addr) || !PageSize::Size4k.is_aligned(size) {
            return Err(Error::Misaligned);
        }
        let end = self.check_range(addr, size)?;
        let mut cur = addr;
        let mut unmapped = 0;
        let root = self.root.bits();
        let start_level = self.start_level();
        self.clear(root, start_level, &mut cur, end, &mut unmapped, alloc)?;
        Ok(unmapped)
    }

    fn reclaim(
        &mut self,
        table: u64,
        level: Level,
        addr: &mut u64,
        end: u64,
        alloc: &mut dyn PageTableAllocator,
    ) {
        let span = self.geometry.table_span(level);
        let span_end = (*addr & !(span - 1)).saturating_add(span);
        while *addr < end && *addr < span_end {
            let idx = self.geometry.index(level, *addr);
            match (self.read(table, idx).decode(level), level.next()) {
                (Entry::Table(child), Some(next)) => {
                    self.reclaim(child.bits(), next, addr, end, alloc);
                    self.try_free_child(table, idx, level, child.bits(), alloc);
                }
                _ => *addr = level.page_size().round_down(*addr) + level.granule(),
            }
        }
    }

    /// Frees every table in `[addr, addr + size)` whose entries are all uncounted, dropping the
    /// mappings they held. Used to recycle table pages when those mappings can be rebuilt on demand.
    pub fn reclaim_leaves(
        &mut self,
        addr: u64,
        size: u64,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<()> {
        let end = self.check_range(addr, size)?;
        let mut cur = addr;
        let root = self.root.bits();
        let start_level = self.start_level();
        self.reclaim(root, start_level, &mut cur, end, alloc);
        Ok(())
    }

    // Returns the page-level table translating `addr`, building it if needed.
    fn last_level_table(&mut self, addr: u64, alloc: &mut dyn PageTableAllocator) -> Result<u64> {
        loop {
            let (table, idx, level, _) = self.locate(addr);
            if level.is_last() {
                return Ok(table);
            }
            self.split_entry(table, idx, level, alloc)?;
        }
    }

    /// Takes a reference on the page-level table translating each page of the range, so that
    /// those tables survive even once they hold no counted entries.
    pub fn get_pages(&mut self, addr: u64, size: u64, alloc: &mut dyn PageTableAllocator) -> Result<()> {
        let end = self.check_range(addr, size)?;
        let mut cur = PageSize::Size4k.round_down(addr);
        while cur < end {
            let table = self.last_level_table(cur, alloc)?;
            alloc.get_page(PhysPfn::phys(table));
            cur += PageSize::Size4k as u64;
        }
        Ok(())
    }

    /// Drops the references taken by `get_pages()`.
    pub fn put_pages(&mut self, addr: u64, size: u64, alloc: &mut dyn PageTableAllocator) -> Result<()> {
        let end = self.check_range(addr, size)?;
        let mut cur = PageSize::Size4k.round_down(addr);
        while cur < end {
            let (table, _, level, _) = self.locate(cur);
            if level.is_last() && table != self.root.bits() {
                alloc.put_page(PhysPfn::phys(table));
            } else {
                warn!("no page-level table to release at {cur:#x}");
            }
            cur += PageSize::Size4k as u64;
        }
        Ok(())
    }

    /// Adds `prot` to the permissions of the leaf mapping `addr`.
    pub fn relax_perms(&mut self, addr: u64, prot: Prot, alloc: &mut dyn PageTableAllocator) -> Result<()> {
        let (pte, level) = self.get_leaf(addr)?;
        if !matches!(pte.decode(level), Entry::Leaf { .. }) {
            return Err(Error::NotMapped);
        }
        self.update_leaves(
            addr,
            1,
            |entry| match *entry {
                Entry::Leaf { phys, attrs, young } => Some(Entry::Leaf {
                    phys,
                    attrs: LeafAttrs {
                        prot: attrs.prot | prot,
                        state: attrs.state,
                    },
                    young,
                }),
                _ => None,
            },
            alloc,
        )
    }

    /// Removes write permission from every leaf translating part of the range.
    pub fn wrprotect(&mut self, addr: u64, size: u64, alloc: &mut dyn PageTableAllocator) -> Result<()> {
        self.update_leaves(
            addr,
            size,
            |entry| match *entry {
                Entry::Leaf { phys, attrs, young } if attrs.prot.contains(Prot::W) => {
                    Some(Entry::Leaf {
                        phys,
                        attrs: LeafAttrs {
                            prot: attrs.prot - Prot::W,
                            state: attrs.state,
                        },
                        young,
                    })
                }
                _ => None,
            },
            alloc,
        )
    }

    /// Returns whether any leaf in the range was accessed, clearing the access flags if `mkold`.
    pub fn test_clear_young(
        &mut self,
        addr: u64,
        size: u64,
        mkold: bool,
        alloc: &mut dyn PageTableAllocator,
    ) -> Result<bool> {
        let mut young = false;
        self.update_leaves(
            addr,
            size,
            |entry| match *entry {
                Entry::Leaf {
                    phys,
                    attrs,
                    young: true,
                } => {
                    young = true;
                    mkold.then_some(Entry::Leaf {
                        phys,
                        attrs,
                        young: false,
                    })
                }
                _ => None,
            },
            alloc,
        )?;
        Ok(young)
    }

    /// Sets the access flag of the leaf mapping `addr`. Returns the updated descriptor, or an
    /// empty one if nothing is mapped.
    pub fn mkyoung(&mut self, addr: u64, alloc: &mut dyn PageTableAllocator) -> Result<Pte> {
        self.update_leaves(
            addr,
            1,
            |entry| match *entry {
                Entry::Leaf {
                    phys,
                    attrs,
                    young: false,
                } => Some(Entry::leaf(phys, attrs)),
                _ => None,
            },
            alloc,
        )?;
        let (pte, _) = self.get_leaf(addr)?;
        Ok(if pte.valid() { pte } else { Pte::default() })
    }

    /// Frees every table page, root included.
    pub fn destroy(mut self, alloc: &mut dyn PageTableAllocator) {
        let root = self.root.bits();
        let start_level = self.start_level();
        self.free_table(root, start_level, alloc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use arm_pages::{OwnerId, PageState};

    const RAM: u64 = 0x8000_0000;

    fn rwx() -> LeafAttrs {
        LeafAttrs::new(Prot::RWX)
    }

    #[test]
    fn map_uses_blocks_when_aligned() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountNonZero, &mut state.pool).unwrap();
        assert_eq!(pgt.table_pages(), 2);

        pgt.map(0x4000_0000, 0x40_0000, RAM, rwx(), &mut state.pool)
            .unwrap();
        let (pte, level) = pgt.get_leaf(0x4020_1000).unwrap();
        assert_eq!(level, Level::L2);
        assert_eq!(pte.decode(level).phys(), Some(RAM + 0x20_0000));
        // One level-2 table under the concatenated root.
        assert_eq!(pgt.table_pages(), 3);
    }

    #[test]
    fn partial_update_splits_block() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountNonZero, &mut state.pool).unwrap();
        pgt.map(0x4000_0000, 0x20_0000, RAM, rwx(), &mut state.pool)
            .unwrap();
        pgt.annotate(0x4000_3000, 0x1000, Entry::Owned(OwnerId::HYP), &mut state.pool)
            .unwrap();

        let (pte, level) = pgt.get_leaf(0x4000_3000).unwrap();
        assert_eq!(level, Level::L3);
        assert_eq!(pte.decode(level), Entry::Owned(OwnerId::HYP));
        // The rest of the block is still mapped.
        let (pte, level) = pgt.get_leaf(0x4000_4000).unwrap();
        assert_eq!(level, Level::L3);
        assert_eq!(pte.decode(level).phys(), Some(RAM + 0x4000));
        let l3 = pgt.locate(0x4000_4000).0;
        assert_eq!(state.pool.page_count(PhysPfn::phys(l3)), 1 + 512);
    }

    #[test]
    fn unmap_frees_empty_tables() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountNonZero, &mut state.pool).unwrap();
        let free = state.pool.free_pages();
        pgt.map(0x1000, 0x3000, RAM, rwx(), &mut state.pool).unwrap();
        assert_eq!(pgt.table_pages(), 4);
        assert_eq!(pgt.unmap(0x2000, 0x1000, &mut state.pool), Ok(0x1000));
        assert_eq!(pgt.table_pages(), 4);
        assert_eq!(pgt.unmap(0, 0x20_0000, &mut state.pool), Ok(0x2000));
        assert_eq!(pgt.table_pages(), 2);
        assert_eq!(state.pool.free_pages(), free);
        assert_eq!(pgt.get_leaf(0x1000).unwrap().0, Pte::default());
    }

    #[test]
    fn uncounted_entries_are_reclaimed() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountOnlyAnnotations, &mut state.pool).unwrap();
        pgt.map(0x1000, 0x1000, 0x1000, rwx(), &mut state.pool).unwrap();
        pgt.annotate(0x40_0000, 0x1000, Entry::Owned(OwnerId::GUEST), &mut state.pool)
            .unwrap();
        assert_eq!(pgt.table_pages(), 5);
        pgt.reclaim_leaves(0, 0x80_0000, &mut state.pool).unwrap();
        // The table holding only the uncounted mapping is gone, the annotated one stays.
        assert_eq!(pgt.table_pages(), 4);
        assert_eq!(pgt.get_leaf(0x1000).unwrap().1, Level::L2);
        assert_eq!(
            pgt.get_leaf(0x40_0000).unwrap().0.decode(Level::L3),
            Entry::Owned(OwnerId::GUEST)
        );
    }

    #[test]
    fn block_replaces_table() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountNonZero, &mut state.pool).unwrap();
        pgt.map(0x20_0000, 0x1000, RAM, rwx(), &mut state.pool).unwrap();
        assert_eq!(pgt.table_pages(), 4);
        pgt.map(0x20_0000, 0x20_0000, RAM, rwx(), &mut state.pool)
            .unwrap();
        assert_eq!(pgt.table_pages(), 3);
        assert_eq!(pgt.get_leaf(0x20_0000).unwrap().1, Level::L2);
    }

    #[test]
    fn forced_pages() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, ForceEverything, &mut state.pool).unwrap();
        pgt.map(0x20_0000, 0x20_0000, RAM, rwx(), &mut state.pool)
            .unwrap();
        assert_eq!(pgt.get_leaf(0x20_0000).unwrap().1, Level::L3);
    }

    #[test]
    fn walk_visits_each_leaf_once() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountNonZero, &mut state.pool).unwrap();
        pgt.map(0x20_0000, 0x20_0000, RAM, rwx(), &mut state.pool)
            .unwrap();
        pgt.map(0x40_0000, 0x2000, RAM, rwx().with_state(PageState::SHARED_OWNED), &mut state.pool)
            .unwrap();
        let mut visits = std::vec::Vec::new();
        pgt.walk_leaves::<Error, _>(0x3f_f000, 0x3000, |v| {
            visits.push((v.entry_base(), v.level, v.entry.state()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            visits,
            vec![
                (0x20_0000, Level::L2, Some(PageState::OWNED)),
                (0x40_0000, Level::L3, Some(PageState::SHARED_OWNED)),
                (0x40_1000, Level::L3, Some(PageState::SHARED_OWNED)),
            ]
        );
        assert_eq!(
            pgt.walk_leaves::<Error, _>(0, 1 << 41, |_| Ok(())),
            Err(Error::OutOfBounds)
        );
    }

    #[test]
    fn attribute_updates() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountNonZero, &mut state.pool).unwrap();
        pgt.map(0x1000, 0x2000, RAM, LeafAttrs::new(Prot::R), &mut state.pool)
            .unwrap();
        pgt.relax_perms(0x1000, Prot::W, &mut state.pool).unwrap();
        assert_eq!(
            pgt.get_leaf(0x1000).unwrap().0.decode(Level::L3).prot(),
            Some(Prot::RW)
        );
        assert_eq!(
            pgt.relax_perms(0x8000, Prot::W, &mut state.pool),
            Err(Error::NotMapped)
        );

        pgt.wrprotect(0, 0x4000, &mut state.pool).unwrap();
        assert_eq!(
            pgt.get_leaf(0x1000).unwrap().0.decode(Level::L3).prot(),
            Some(Prot::R)
        );

        assert_eq!(pgt.test_clear_young(0x1000, 0x2000, true, &mut state.pool), Ok(true));
        assert_eq!(pgt.test_clear_young(0x1000, 0x2000, false, &mut state.pool), Ok(false));
        let pte = pgt.mkyoung(0x2000, &mut state.pool).unwrap();
        assert!(pte.valid());
        assert_eq!(pgt.test_clear_young(0x1000, 0x1000, false, &mut state.pool), Ok(false));
        assert_eq!(pgt.test_clear_young(0x2000, 0x1000, false, &mut state.pool), Ok(true));
        assert_eq!(pgt.mkyoung(0x9000, &mut state.pool), Ok(Pte::default()));
    }

    #[test]
    fn pinned_tables_survive_reclaim() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountOnlyAnnotations, &mut state.pool).unwrap();
        pgt.map(0, 0x20_0000, 0, rwx(), &mut state.pool).unwrap();
        pgt.get_pages(0x1000, 0x1000, &mut state.pool).unwrap();
        assert_eq!(pgt.get_leaf(0x1000).unwrap().1, Level::L3);
        pgt.reclaim_leaves(0, 0x20_0000, &mut state.pool).unwrap();
        assert_eq!(pgt.get_leaf(0x1000).unwrap().1, Level::L3);
        pgt.put_pages(0x1000, 0x1000, &mut state.pool).unwrap();
        pgt.reclaim_leaves(0, 0x20_0000, &mut state.pool).unwrap();
        assert_eq!(pgt.get_leaf(0x1000).unwrap().0, Pte::default());
    }

    #[test]
    fn destroy_returns_all_pages() {
        let mut state = stub_sys_memory();
        let free = state.pool.free_pages();
        let mut pgt = PageTable::new(48, true, CountNonZero, &mut state.pool).unwrap();
        pgt.map(0x1000, 0x1000, RAM, rwx(), &mut state.pool).unwrap();
        pgt.annotate(0x80_0000_0000, 0x1000, Entry::MmioGuard, &mut state.pool)
            .unwrap();
        pgt.destroy(&mut state.pool);
        assert_eq!(state.pool.free_pages(), free);
    }

    #[test]
    fn out_of_pages() {
        let mut state = stub_sys_memory();
        let mut pgt = PageTable::new(40, true, CountNonZero, &mut state.pool).unwrap();
        state.pool.drain();
        assert_eq!(
            pgt.map(0x1000, 0x1000, RAM, rwx(), &mut state.pool),
            Err(Error::InsufficientPtePages)
        );
    }
}
