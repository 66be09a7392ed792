//! Pointer registry.
//!
//! A fixed-capacity open-addressing table from base address to [`MemoryCell`].
//! It is the single source of truth for what the allocator owns: a pointer the
//! registry does not know about is handed back to the system allocator.
//!
//! Probing is linear from `slot_hash(address)`. Removal leaves a tombstone so
//! later probe chains stay intact. A tombstone directly followed by an empty
//! slot is collapsed back to empty, and the table is rebuilt in place once
//! tombstones occupy more than half of it.

use std::path::Path;

use crate::cell::{Backing, CellKind, MemoryCell};
use crate::error::XmemError;
use crate::hash::{path_hash, slot_hash};
use crate::stats::UsageStats;

/// Position of a cell in the registry table.
///
/// Valid until the next `insert` or `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex(usize);

impl SlotIndex {
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Tombstone,
    Occupied(MemoryCell),
}

impl Slot {
    fn cell(&self) -> Option<&MemoryCell> {
        match self {
            Self::Occupied(cell) => Some(cell),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    slots: Box<[Slot]>,
    len: usize,
    tombstones: usize,
    mapped_live: usize,
    stats: UsageStats,
}

impl Registry {
    /// Empty registry with room for `capacity` cells (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = std::iter::repeat_with(Slot::default)
            .take(capacity)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            len: 0,
            tombstones: 0,
            mapped_live: 0,
            stats: UsageStats::default(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity()
    }

    #[must_use]
    pub const fn stats(&self) -> &UsageStats {
        &self.stats
    }

    /// Number of tombstoned slots currently in the table.
    #[must_use]
    pub const fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Register a cell.
    ///
    /// A live cell already registered at the same address is replaced; the
    /// allocator only sees that when memory it handed out was released behind
    /// its back.
    pub fn insert(&mut self, cell: MemoryCell) -> Result<SlotIndex, XmemError> {
        let capacity = self.capacity();
        let home = slot_hash(cell.address, capacity);
        let mut reusable = None;
        let mut target = None;
        let mut duplicate = None;

        for step in 0..capacity {
            let idx = (home + step) % capacity;
            match &self.slots[idx] {
                Slot::Empty => {
                    target = Some(reusable.unwrap_or(idx));
                    break;
                }
                Slot::Tombstone => {
                    reusable.get_or_insert(idx);
                }
                Slot::Occupied(existing) => {
                    if existing.address == cell.address {
                        duplicate = Some(idx);
                        break;
                    }
                }
            }
        }

        if let Some(idx) = duplicate {
            if let Slot::Occupied(stale) = std::mem::take(&mut self.slots[idx]) {
                self.forget(&stale);
            }
            self.account(&cell);
            self.slots[idx] = Slot::Occupied(cell);
            return Ok(SlotIndex(idx));
        }
        if self.is_full() {
            return Err(XmemError::CapacityExhausted { capacity });
        }
        let idx = target
            .or(reusable)
            .ok_or(XmemError::CapacityExhausted { capacity })?;
        if matches!(self.slots[idx], Slot::Tombstone) {
            self.tombstones -= 1;
        }
        self.account(&cell);
        self.slots[idx] = Slot::Occupied(cell);
        self.len += 1;
        Ok(SlotIndex(idx))
    }

    /// Slot holding a cell whose base address is exactly `address`.
    #[must_use]
    pub fn find(&self, address: usize) -> Option<SlotIndex> {
        let capacity = self.capacity();
        let home = slot_hash(address, capacity);
        for step in 0..capacity {
            let idx = (home + step) % capacity;
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(cell) if cell.address == address => return Some(SlotIndex(idx)),
                _ => {}
            }
        }
        None
    }

    /// Slot of the cell owning `address`: an exact match, or else the mapped
    /// cell whose byte range contains it.
    #[must_use]
    pub fn find_owner(&self, address: usize) -> Option<SlotIndex> {
        if let Some(slot) = self.find(address) {
            return Some(slot);
        }
        if self.mapped_live == 0 {
            return None;
        }
        self.iter()
            .find(|(_, cell)| cell.kind() == CellKind::Mapped && cell.contains(address))
            .map(|(slot, _)| slot)
    }

    /// Slot of the live mapping of `path`, if any.
    #[must_use]
    pub fn find_mapped(&self, path: &Path) -> Option<SlotIndex> {
        if self.mapped_live == 0 {
            return None;
        }
        let hash = path_hash(path.as_os_str().as_encoded_bytes());
        self.iter()
            .find(|(_, cell)| cell.maps_path(path, hash))
            .map(|(slot, _)| slot)
    }

    #[must_use]
    pub fn get(&self, slot: SlotIndex) -> Option<&MemoryCell> {
        self.slots.get(slot.0).and_then(Slot::cell)
    }

    /// Mutable access to a registered cell.
    ///
    /// `size` and `backing` feed the counters; change reference counts through
    /// [`Registry::acquire_mapping`] and [`Registry::release_mapping`] instead.
    pub fn get_mut(&mut self, slot: SlotIndex) -> Option<&mut MemoryCell> {
        match self.slots.get_mut(slot.0) {
            Some(Slot::Occupied(cell)) => Some(cell),
            _ => None,
        }
    }

    /// Add a holder to a mapped cell; returns the new reference count.
    pub fn acquire_mapping(&mut self, slot: SlotIndex) -> Option<u32> {
        let Some(Slot::Occupied(cell)) = self.slots.get_mut(slot.0) else {
            return None;
        };
        let Backing::Mapped { ref_count, .. } = &mut cell.backing else {
            return None;
        };
        *ref_count = ref_count.saturating_add(1);
        self.stats.mapped_refs += 1;
        Some(*ref_count)
    }

    /// Drop a holder from a mapped cell; returns the remaining reference count.
    ///
    /// The cell stays registered at zero; the caller unmaps and removes it.
    pub fn release_mapping(&mut self, slot: SlotIndex) -> Option<u32> {
        let Some(Slot::Occupied(cell)) = self.slots.get_mut(slot.0) else {
            return None;
        };
        let Backing::Mapped { ref_count, .. } = &mut cell.backing else {
            return None;
        };
        if *ref_count > 0 {
            *ref_count -= 1;
            self.stats.mapped_refs = self.stats.mapped_refs.saturating_sub(1);
        }
        Some(*ref_count)
    }

    /// Unregister the cell at `slot`.
    pub fn remove(&mut self, slot: SlotIndex) -> Option<MemoryCell> {
        let capacity = self.capacity();
        if !matches!(self.slots.get(slot.0), Some(Slot::Occupied(_))) {
            return None;
        }
        let next = (slot.0 + 1) % capacity;
        let replacement = if matches!(self.slots[next], Slot::Empty) {
            Slot::Empty
        } else {
            Slot::Tombstone
        };
        let Slot::Occupied(cell) = std::mem::replace(&mut self.slots[slot.0], replacement) else {
            return None;
        };
        self.len -= 1;
        self.forget(&cell);

        if matches!(self.slots[slot.0], Slot::Empty) {
            // Tombstones leading into an empty slot end no probe chain.
            let mut idx = slot.0;
            loop {
                idx = (idx + capacity - 1) % capacity;
                if idx == slot.0 || !matches!(self.slots[idx], Slot::Tombstone) {
                    break;
                }
                self.slots[idx] = Slot::Empty;
                self.tombstones -= 1;
            }
        } else {
            self.tombstones += 1;
            if self.tombstones * 2 > capacity {
                self.rebuild();
            }
        }
        Some(cell)
    }

    /// Remove every cell, leaving an empty table. Peaks are kept.
    pub fn drain(&mut self) -> Vec<MemoryCell> {
        let mut cells = Vec::with_capacity(self.len);
        for slot in &mut self.slots {
            if let Slot::Occupied(cell) = std::mem::take(slot) {
                cells.push(cell);
            }
        }
        for cell in &cells {
            self.forget(cell);
        }
        self.len = 0;
        self.tombstones = 0;
        cells
    }

    /// Live cells with their slots, in table order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex, &MemoryCell)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.cell().map(|cell| (SlotIndex(idx), cell)))
    }

    /// Live cells in table order.
    pub fn cells(&self) -> impl Iterator<Item = &MemoryCell> + '_ {
        self.slots.iter().filter_map(Slot::cell)
    }

    /// Whether the incrementally maintained counters agree with a recount of
    /// the live cells.
    #[must_use]
    pub fn check_counters(&self) -> bool {
        let recount = UsageStats::from_cells(self.cells());
        let mapped = self
            .cells()
            .filter(|cell| cell.kind() == CellKind::Mapped)
            .count();
        recount.same_live_counts(&self.stats)
            && recount.cell_count == self.len
            && mapped == self.mapped_live
            && self.stats.peak_bytes >= self.stats.bytes_total()
            && self.stats.peak_cells >= self.len
    }

    fn account(&mut self, cell: &MemoryCell) {
        if cell.kind() == CellKind::Mapped {
            self.mapped_live += 1;
        }
        self.stats.note_insert(cell);
    }

    fn forget(&mut self, cell: &MemoryCell) {
        if cell.kind() == CellKind::Mapped {
            self.mapped_live = self.mapped_live.saturating_sub(1);
        }
        self.stats.note_remove(cell);
    }

    /// Re-place every live cell into a table free of tombstones.
    fn rebuild(&mut self) {
        let capacity = self.capacity();
        let old = std::mem::replace(
            &mut self.slots,
            std::iter::repeat_with(Slot::default)
                .take(capacity)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );
        self.tombstones = 0;
        for slot in old.into_vec() {
            if let Slot::Occupied(cell) = slot {
                let home = slot_hash(cell.address, capacity);
                let idx = (0..capacity)
                    .map(|step| (home + step) % capacity)
                    .find(|&idx| matches!(self.slots[idx], Slot::Empty));
                if let Some(idx) = idx {
                    self.slots[idx] = Slot::Occupied(cell);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::slot_hash;

    /// Addresses that all hash to slot `home` in a table of `capacity` slots.
    fn colliding(capacity: usize, home: usize, count: usize) -> Vec<usize> {
        (1..)
            .map(|i: usize| 0x10_0000 + i * 16)
            .filter(|&addr| slot_hash(addr, capacity) == home)
            .take(count)
            .collect()
    }

    #[test]
    fn insert_find_remove() {
        let mut reg = Registry::with_capacity(64);
        let slot = reg.insert(MemoryCell::ram(0x4000, 32, None)).unwrap();
        assert_eq!(reg.find(0x4000), Some(slot));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.stats().bytes_ram, 32);

        let cell = reg.remove(slot).unwrap();
        assert_eq!(cell.address, 0x4000);
        assert_eq!(reg.find(0x4000), None);
        assert!(reg.is_empty());
        assert_eq!(reg.stats().bytes_ram, 0);
        assert!(reg.check_counters());
    }

    #[test]
    fn drain_empties_table_and_keeps_peaks() {
        let mut reg = Registry::with_capacity(16);
        let first = reg.insert(MemoryCell::ram(0x1000, 40, None)).unwrap();
        reg.insert(MemoryCell::swap(0x2000, 60, 1, 3, 4096, None))
            .unwrap();
        reg.insert(MemoryCell::mapped(0x3000, 8192, Path::new("a.fits"), None))
            .unwrap();
        reg.remove(first).unwrap();

        let cells = reg.drain();
        assert_eq!(cells.len(), 2);
        assert!(reg.is_empty());
        assert_eq!(reg.tombstones(), 0);
        assert_eq!(reg.cells().count(), 0);
        assert_eq!(reg.stats().bytes_total(), 0);
        assert_eq!(reg.stats().mapped_files, 0);
        assert_eq!(reg.stats().peak_cells, 3);
        assert!(reg.check_counters());
        assert!(reg.insert(MemoryCell::ram(0x1000, 8, None)).is_ok());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut reg = Registry::with_capacity(3);
        for i in 0..3 {
            reg.insert(MemoryCell::ram(0x1000 + i * 64, 8, None)).unwrap();
        }
        assert!(reg.is_full());
        let err = reg.insert(MemoryCell::ram(0x9000, 8, None)).unwrap_err();
        assert!(matches!(err, XmemError::CapacityExhausted { capacity: 3 }));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn tombstones_keep_probe_chain_intact() {
        let capacity = 16;
        let addrs = colliding(capacity, 5, 3);
        let mut reg = Registry::with_capacity(capacity);
        let slots: Vec<_> = addrs
            .iter()
            .map(|&a| reg.insert(MemoryCell::ram(a, 8, None)).unwrap())
            .collect();
        assert_eq!(slots[0].get(), 5);
        assert_eq!(slots[2].get(), 7);

        reg.remove(slots[0]).unwrap();
        assert_eq!(reg.tombstones(), 1);
        assert_eq!(reg.find(addrs[2]), Some(slots[2]));
        assert_eq!(reg.find(addrs[1]), Some(slots[1]));

        // The tombstone is reused by the next colliding insert.
        let extra = colliding(capacity, 5, 4)[3];
        let reused = reg.insert(MemoryCell::ram(extra, 8, None)).unwrap();
        assert_eq!(reused.get(), 5);
        assert_eq!(reg.tombstones(), 0);
        assert!(reg.check_counters());
    }

    #[test]
    fn trailing_tombstones_collapse() {
        let capacity = 16;
        let addrs = colliding(capacity, 2, 3);
        let mut reg = Registry::with_capacity(capacity);
        let slots: Vec<_> = addrs
            .iter()
            .map(|&a| reg.insert(MemoryCell::ram(a, 8, None)).unwrap())
            .collect();
        reg.remove(slots[0]).unwrap();
        reg.remove(slots[1]).unwrap();
        assert_eq!(reg.tombstones(), 2);
        // Removing the tail of the chain clears the whole run.
        reg.remove(slots[2]).unwrap();
        assert_eq!(reg.tombstones(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn rebuild_after_heavy_churn() {
        let capacity = 8;
        let addrs = colliding(capacity, 0, 7);
        let mut reg = Registry::with_capacity(capacity);
        let slots: Vec<_> = addrs
            .iter()
            .map(|&a| reg.insert(MemoryCell::ram(a, 8, None)).unwrap())
            .collect();
        for slot in &slots[..5] {
            reg.remove(*slot).unwrap();
        }
        assert!(reg.tombstones() * 2 <= capacity);
        for &addr in &addrs[5..] {
            assert!(reg.find(addr).is_some(), "lost {addr:#x}");
        }
        assert_eq!(reg.len(), 2);
        assert!(reg.check_counters());
    }

    #[test]
    fn owner_lookup_covers_mapped_ranges() {
        let mut reg = Registry::with_capacity(32);
        reg.insert(MemoryCell::ram(0x1000, 0x100, None)).unwrap();
        let map = reg
            .insert(MemoryCell::mapped(0x8000, 0x2000, Path::new("cube.fits"), None))
            .unwrap();

        assert_eq!(reg.find_owner(0x8000), Some(map));
        assert_eq!(reg.find_owner(0x9fff), Some(map));
        assert_eq!(reg.find_owner(0xa000), None);
        // RAM cells only match exactly.
        assert_eq!(reg.find_owner(0x1010), None);
        assert_eq!(reg.find_mapped(Path::new("cube.fits")), Some(map));
        assert_eq!(reg.find_mapped(Path::new("flat.fits")), None);
    }

    #[test]
    fn mapping_refcounts_feed_stats() {
        let mut reg = Registry::with_capacity(8);
        let slot = reg
            .insert(MemoryCell::mapped(0x8000, 64, Path::new("a"), None))
            .unwrap();
        assert_eq!(reg.acquire_mapping(slot), Some(2));
        assert_eq!(reg.stats().mapped_refs, 2);
        assert_eq!(reg.release_mapping(slot), Some(1));
        assert_eq!(reg.release_mapping(slot), Some(0));
        assert_eq!(reg.stats().mapped_refs, 0);
        assert!(reg.check_counters());
        reg.remove(slot).unwrap();
        assert_eq!(reg.stats().mapped_files, 0);
        assert!(reg.check_counters());

        let ram = reg.insert(MemoryCell::ram(0x100, 1, None)).unwrap();
        assert_eq!(reg.acquire_mapping(ram), None);
    }

    #[test]
    fn duplicate_address_replaces_stale_cell() {
        let mut reg = Registry::with_capacity(8);
        let first = reg.insert(MemoryCell::ram(0x100, 10, None)).unwrap();
        let second = reg.insert(MemoryCell::ram(0x100, 30, None)).unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.stats().bytes_ram, 30);
        assert!(reg.check_counters());
    }

    #[test]
    fn accounting_invariant_under_deterministic_trace() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let mut reg = Registry::with_capacity(97);
        let mut live: Vec<usize> = Vec::new();
        let mut next_addr = 0x10_0000_usize;
        let mut rng = 0xA5A5_5A5A_DEAD_BEEFu64;

        for _ in 0..3000 {
            let r = lcg(&mut rng);
            if r % 2 == 0 && !reg.is_full() {
                next_addr += 16 * (1 + (r >> 40) as usize % 7);
                let size = 1 + (r >> 8) as usize % 4096;
                let cell = if r % 3 == 0 {
                    MemoryCell::swap(next_addr, size, r >> 50, 3, 4096, None)
                } else {
                    MemoryCell::ram(next_addr, size, None)
                };
                reg.insert(cell).unwrap();
                live.push(next_addr);
            } else if !live.is_empty() {
                let idx = (r as usize) % live.len();
                let addr = live.swap_remove(idx);
                let slot = reg.find(addr).expect("live address must be registered");
                reg.remove(slot).unwrap();
            }

            assert_eq!(reg.len(), live.len());
            assert!(reg.tombstones() * 2 <= reg.capacity());
            for &addr in &live {
                assert!(reg.find(addr).is_some());
            }
            assert!(reg.check_counters());
        }
    }
}
