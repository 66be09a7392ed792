//! Usage counters maintained alongside the registry.

use serde::Serialize;

use crate::cell::{Backing, MemoryCell};

/// Aggregate accounting over live cells.
///
/// Byte totals cover RAM and swap cells only; mapped files are counted by
/// file and by reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub cell_count: usize,
    pub bytes_ram: usize,
    pub bytes_swap: usize,
    pub ram_cells: usize,
    pub swap_files: usize,
    pub mapped_files: usize,
    pub mapped_refs: usize,
    pub peak_bytes: usize,
    pub peak_cells: usize,
}

impl UsageStats {
    /// RAM plus swap bytes.
    #[must_use]
    pub const fn bytes_total(&self) -> usize {
        self.bytes_ram + self.bytes_swap
    }

    pub fn note_insert(&mut self, cell: &MemoryCell) {
        self.cell_count += 1;
        match &cell.backing {
            Backing::Ram => {
                self.ram_cells += 1;
                self.bytes_ram += cell.size;
            }
            Backing::Swap { .. } => {
                self.swap_files += 1;
                self.bytes_swap += cell.size;
            }
            Backing::Mapped { ref_count, .. } => {
                self.mapped_files += 1;
                self.mapped_refs += *ref_count as usize;
            }
        }
        self.peak_bytes = self.peak_bytes.max(self.bytes_total());
        self.peak_cells = self.peak_cells.max(self.cell_count);
    }

    pub fn note_remove(&mut self, cell: &MemoryCell) {
        self.cell_count = self.cell_count.saturating_sub(1);
        match &cell.backing {
            Backing::Ram => {
                self.ram_cells = self.ram_cells.saturating_sub(1);
                self.bytes_ram = self.bytes_ram.saturating_sub(cell.size);
            }
            Backing::Swap { .. } => {
                self.swap_files = self.swap_files.saturating_sub(1);
                self.bytes_swap = self.bytes_swap.saturating_sub(cell.size);
            }
            Backing::Mapped { ref_count, .. } => {
                self.mapped_files = self.mapped_files.saturating_sub(1);
                self.mapped_refs = self.mapped_refs.saturating_sub(*ref_count as usize);
            }
        }
    }

    /// Recompute the live counters from a set of cells. Peaks are left at zero.
    #[must_use]
    pub fn from_cells<'a>(cells: impl IntoIterator<Item = &'a MemoryCell>) -> Self {
        let mut stats = Self::default();
        for cell in cells {
            stats.note_insert(cell);
        }
        stats.peak_bytes = 0;
        stats.peak_cells = 0;
        stats
    }

    /// Whether the live counters (peaks excluded) agree with `other`.
    #[must_use]
    pub fn same_live_counts(&self, other: &Self) -> bool {
        Self {
            peak_bytes: 0,
            peak_cells: 0,
            ..*self
        } == Self {
            peak_bytes: 0,
            peak_cells: 0,
            ..*other
        }
    }
}
