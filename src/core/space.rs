//! Space table: a catalogue of every region of the image file
//!
//! Entries are kept in a vector that is re-sorted after each batch of
//! changes. Removal is explicit; [`SpaceKind::Removed`] only exists as a
//! transient mark while a pass is iterating.

use serde::Serialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SpaceKind {
    DeviceHeader,
    CompressedHeader,
    L1,
    L2,
    Track,
    BlockGroup,
    Free,
    EndOfFile,
    Removed,
}

impl SpaceKind {
    /// Track or block-group image
    pub fn is_image(self) -> bool {
        matches!(self, SpaceKind::Track | SpaceKind::BlockGroup)
    }

    /// Structures that live at fixed offsets and can never be dropped
    pub fn is_fixed(self) -> bool {
        matches!(
            self,
            SpaceKind::DeviceHeader | SpaceKind::CompressedHeader | SpaceKind::L1
        )
    }

    fn rank(self) -> u8 {
        match self {
            SpaceKind::EndOfFile => 1,
            SpaceKind::Removed => 2,
            _ => 0,
        }
    }
}

/// One catalogued region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceEntry {
    pub kind: SpaceKind,
    /// Level-1 index (L2), track / group number (images), unused otherwise
    pub index: u64,
    pub offset: u64,
    /// Bytes holding data
    pub len: u64,
    /// Bytes reserved (`size >= len`)
    pub size: u64,
}

impl SpaceEntry {
    pub fn new(kind: SpaceKind, index: u64, offset: u64, len: u64, size: u64) -> Self {
        SpaceEntry {
            kind,
            index,
            offset,
            len,
            size,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

/// An unused byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub offset: u64,
    pub len: u64,
}

impl Gap {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Two regions claiming the same bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlap {
    pub first: usize,
    pub second: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SpaceTable {
    entries: Vec<SpaceEntry>,
}

fn entry_order(a: &SpaceEntry, b: &SpaceEntry) -> Ordering {
    a.kind
        .rank()
        .cmp(&b.kind.rank())
        .then(a.offset.cmp(&b.offset))
        .then(b.size.cmp(&a.size))
        .then(a.index.cmp(&b.index))
}

impl SpaceTable {
    pub fn new() -> Self {
        SpaceTable::default()
    }

    pub fn push(&mut self, entry: SpaceEntry) {
        self.entries.push(entry);
    }

    /// Sort: ascending offset, end-of-file last but one, removed last
    pub fn sort(&mut self) {
        self.entries.sort_by(entry_order);
    }

    /// Sort and drop every entry marked removed
    pub fn purge(&mut self) {
        self.sort();
        while self.entries.last().map(|e| e.kind) == Some(SpaceKind::Removed) {
            self.entries.pop();
        }
    }

    pub fn mark_removed(&mut self, i: usize) {
        self.entries[i].kind = SpaceKind::Removed;
    }

    /// Remove every entry matching `pred`, returning them
    pub fn remove_where(&mut self, mut pred: impl FnMut(&SpaceEntry) -> bool) -> Vec<SpaceEntry> {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            if pred(e) {
                removed.push(*e);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Insert keeping the table sorted
    pub fn insert(&mut self, entry: SpaceEntry) {
        let at = self
            .entries
            .partition_point(|e| entry_order(e, &entry) == Ordering::Less);
        self.entries.insert(at, entry);
    }

    pub fn entries(&self) -> &[SpaceEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [SpaceEntry] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End-of-file offset, if catalogued
    pub fn eof(&self) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.kind == SpaceKind::EndOfFile)
            .map(|e| e.offset)
    }

    pub fn set_eof(&mut self, offset: u64) {
        self.entries.retain(|e| e.kind != SpaceKind::EndOfFile);
        self.push(SpaceEntry::new(SpaceKind::EndOfFile, 0, offset, 0, 0));
        self.sort();
    }

    /// Regions that claim bytes another region already claims
    ///
    /// Expects a sorted table. Each overlap pairs an entry with the earlier
    /// entry whose extent reaches furthest.
    pub fn overlaps(&self) -> Vec<Overlap> {
        let mut found = Vec::new();
        let mut reach: Option<(usize, u64)> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if matches!(e.kind, SpaceKind::Removed | SpaceKind::Free) {
                continue;
            }
            if let Some((j, end)) = reach {
                if e.offset < end {
                    found.push(Overlap { first: j, second: i });
                }
                if e.end() > end {
                    reach = Some((i, e.end()));
                }
            } else {
                reach = Some((i, e.end()));
            }
        }
        found
    }

    /// Unclaimed ranges between data regions, up to end-of-file
    ///
    /// `Free` entries do not claim space. Expects a sorted, overlap-free table.
    pub fn gaps(&self) -> Vec<Gap> {
        let mut gaps = Vec::new();
        let mut pos = 0u64;
        for e in &self.entries {
            match e.kind {
                SpaceKind::Free | SpaceKind::Removed => continue,
                SpaceKind::EndOfFile => {
                    if e.offset > pos {
                        gaps.push(Gap {
                            offset: pos,
                            len: e.offset - pos,
                        });
                    }
                    break;
                }
                _ => {
                    if e.offset > pos {
                        gaps.push(Gap {
                            offset: pos,
                            len: e.offset - pos,
                        });
                    }
                    pos = pos.max(e.end());
                }
            }
        }
        gaps
    }

    /// Replace all `Free` entries with one per gap
    pub fn synthesize_free(&mut self) {
        self.entries.retain(|e| e.kind != SpaceKind::Free);
        for gap in self.gaps() {
            self.entries.push(SpaceEntry::new(
                SpaceKind::Free,
                0,
                gap.offset,
                gap.len,
                gap.len,
            ));
        }
        self.sort();
    }

    /// True if the non-removed entries exactly tile `[0, eof)`
    pub fn is_partition(&self) -> bool {
        let mut pos = 0u64;
        for e in &self.entries {
            match e.kind {
                SpaceKind::Removed => continue,
                SpaceKind::EndOfFile => return e.offset == pos,
                _ => {
                    if e.offset != pos {
                        return false;
                    }
                    pos = e.end();
                }
            }
        }
        false
    }
}
