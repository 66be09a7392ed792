//! Human-readable status dump.
//!
//! The report is read-only over the registry: rendering it twice without
//! intervening allocator activity produces identical text.

use std::io::{self, Write};

use crate::cell::{Backing, MemoryCell, Origin};
use crate::config::Verbosity;
use crate::resource::ResourceProbe;
use crate::stats::UsageStats;
use crate::swap::SwapLedger;

/// Everything the status dump needs apart from the cells themselves.
#[derive(Debug, Clone, Copy)]
pub struct StatusReport<'a> {
    /// Call site that asked for the dump.
    pub origin: &'a Origin,
    pub verbosity: Verbosity,
    /// Registry capacity.
    pub capacity: usize,
    pub probe: Option<&'a ResourceProbe>,
    pub stats: &'a UsageStats,
    /// Resolves swap-file ids to paths.
    pub ledger: &'a SwapLedger,
}

impl StatusReport<'_> {
    /// Write the dump, one line per live cell in `cells`.
    pub fn write<'c, W: Write>(
        &self,
        out: &mut W,
        cells: impl IntoIterator<Item = &'c MemoryCell>,
    ) -> io::Result<()> {
        if self.verbosity.tracks_origins() {
            self.write_diagnostics(out)?;
        }

        let stats = self.stats;
        if stats.cell_count == 0 {
            return Ok(());
        }
        writeln!(
            out,
            "#----- memory status called from {} --------",
            self.origin
        )?;
        writeln!(out, "#- ALL status")?;
        writeln!(out, "ALL_npointers       {}", stats.cell_count)?;
        writeln!(out, "ALL_size            {}", stats.bytes_total())?;
        writeln!(out, "ALL_maxalloc_kb     {}", stats.peak_bytes / 1024)?;
        writeln!(out, "ALL_maxpointers     {}", stats.peak_cells)?;

        if stats.bytes_ram > 0 {
            writeln!(out, "#- RAM status")?;
            writeln!(out, "RAM_alloc           {}", stats.bytes_ram)?;
        }
        if stats.bytes_swap > 0 {
            writeln!(out, "#- SWP status")?;
            writeln!(out, "SWP_alloc           {}", stats.bytes_swap)?;
            writeln!(out, "SWP_files           {}", stats.swap_files)?;
        }
        if stats.mapped_files > 0 {
            writeln!(out, "#- MAP status")?;
            writeln!(out, "MAP_files           {}", stats.mapped_files)?;
            writeln!(out, "MAP_mappings        {}", stats.mapped_refs)?;
        }

        writeln!(out, "#- pointer details")?;
        for cell in cells {
            self.write_cell(out, cell)?;
        }
        Ok(())
    }

    fn write_diagnostics<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let stats = self.stats;
        writeln!(
            out,
            "#----- memory diagnostics called from {} --------",
            self.origin
        )?;
        writeln!(out, "#- Peak memory usage")?;
        writeln!(out, "ALL_maxalloc_kb     {}", stats.peak_bytes / 1024)?;
        writeln!(out, "ALL_maxpointers     {}", stats.peak_cells)?;
        writeln!(out, "#- Local implementation")?;
        writeln!(out, "TAB_ptrs            {}", self.capacity)?;
        if let Some(probe) = self.probe {
            writeln!(out, "#- Platform")?;
            writeln!(out, "SYS_pagesize        {} bytes", probe.page_size)?;
            match probe.data_limit {
                Some(limit) => writeln!(out, "SYS_RLIMIT_DATA     {} kb", limit / 1024)?,
                None => writeln!(out, "SYS_RLIMIT_DATA     unlimited")?,
            }
        }
        Ok(())
    }

    /// One status line for `cell`.
    pub fn write_cell<W: Write>(&self, out: &mut W, cell: &MemoryCell) -> io::Result<()> {
        let code = cell.kind().code();
        let addr = cell.address;
        match (&cell.backing, &cell.origin) {
            (Backing::Mapped { path, .. }, Some(origin)) => write!(
                out,
                "M({addr:#x}) - {origin} maps [{}] for {} bytes",
                path.display(),
                cell.size
            )?,
            (Backing::Mapped { path, .. }, None) => write!(
                out,
                "M({addr:#x}) maps [{}] for {} bytes",
                path.display(),
                cell.size
            )?,
            (_, Some(origin)) => write!(out, "{code}({addr:#x}) - {origin} for {} bytes", cell.size)?,
            (_, None) => write!(out, "{code}({addr:#x}) for {} bytes", cell.size)?,
        }
        if let Backing::Swap { file_id, fd, .. } = &cell.backing {
            write!(
                out,
                " swf[{}][{fd}]",
                self.ledger.path_for(*file_id).display()
            )?;
        }
        writeln!(out)
    }
}
