//! Pass outcomes

use crate::header::{HeaderTotals, ImageKind};
use crate::recover::Found;
use crate::validate::Unsupported;
use serde::Serialize;
use std::fmt;

/// Outcome of a check pass
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub kind: ImageKind,
    /// Device model, e.g. `3390`
    pub device: &'static str,
    pub requested_level: i32,
    /// Level the pass actually ran at after escalation
    pub level: i32,
    /// The file was converted to the host's byte order
    pub swapped: bool,
    pub overlaps: usize,
    /// Level-2 tables and images rejected by validation
    pub damaged: usize,
    pub recovered: Vec<Found>,
    /// Slots whose rejected image was not found again
    pub lost: Vec<u64>,
    pub unsupported: Vec<Unsupported>,
    pub free_space_rebuilt: bool,
    pub data_recovered: bool,
    /// Only the open/error flags were cleared
    pub flags_cleared: bool,
    /// Header columns after the pass
    pub totals: HeaderTotals,
}

impl CheckReport {
    pub(crate) fn new(kind: ImageKind, device: &'static str, requested_level: i32) -> Self {
        CheckReport {
            kind,
            device,
            requested_level,
            level: requested_level,
            swapped: false,
            overlaps: 0,
            damaged: 0,
            recovered: Vec::new(),
            lost: Vec::new(),
            unsupported: Vec::new(),
            free_space_rebuilt: false,
            data_recovered: false,
            flags_cleared: false,
            totals: HeaderTotals::default(),
        }
    }

    /// `0` clean, `1` free space rebuilt, `2` data recovered
    pub fn code(&self) -> i32 {
        if self.data_recovered {
            2
        } else if self.free_space_rebuilt {
            1
        } else {
            0
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code() == 0
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {:?}{} checked at level {} (requested {})",
            self.device,
            self.kind.class,
            if self.kind.shadow { " shadow" } else { "" },
            self.level,
            self.requested_level
        )?;
        if self.swapped {
            writeln!(f, "  byte order converted")?;
        }
        if self.damaged > 0 || self.overlaps > 0 {
            writeln!(
                f,
                "  {} damaged structures, {} overlaps",
                self.damaged, self.overlaps
            )?;
        }
        for found in &self.recovered {
            writeln!(
                f,
                "  recovered slot {} at {} ({} bytes)",
                found.slot, found.offset, found.len
            )?;
        }
        if !self.lost.is_empty() {
            writeln!(f, "  lost slots: {:?}", self.lost)?;
        }
        for u in &self.unsupported {
            writeln!(
                f,
                "  slot {} at {} skipped: compression {} not supported",
                u.slot, u.offset, u.tag
            )?;
        }
        let t = &self.totals;
        writeln!(
            f,
            "  size {} used {} free {} in {} regions (largest {}, imbedded {})",
            t.size, t.used, t.free_total, t.free_num, t.free_largest, t.free_imbed
        )?;
        let outcome = match self.code() {
            2 => "data recovered",
            1 => "free space rebuilt",
            _ => "clean",
        };
        write!(f, "  result: {}", outcome)
    }
}

/// Outcome of a compaction pass
#[derive(Debug, Clone, Serialize)]
pub struct CompactReport {
    pub kind: ImageKind,
    pub device: &'static str,
    pub swapped: bool,
    /// The file already had the compact layout; nothing was written
    pub noop: bool,
    pub moved_tables: usize,
    pub moved_images: usize,
    /// Images lifted out of the region the level-2 tables now occupy
    pub buffered_images: usize,
    pub old_size: u64,
    pub new_size: u64,
    pub totals: HeaderTotals,
}

impl CompactReport {
    pub fn code(&self) -> i32 {
        0
    }
}

impl fmt::Display for CompactReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.noop {
            return write!(f, "{} {:?} already compact ({} bytes)", self.device, self.kind.class, self.new_size);
        }
        write!(
            f,
            "{} {:?} compacted: {} -> {} bytes, moved {} tables and {} images",
            self.device,
            self.kind.class,
            self.old_size,
            self.new_size,
            self.moved_tables,
            self.moved_images
        )
    }
}
