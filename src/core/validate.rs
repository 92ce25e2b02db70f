//! Space table builder and consistency validator
//!
//! Catalogues every structure the level-1 and level-2 tables reference,
//! then drops whatever cannot be trusted:
//!
//! | level | checks                                                   |
//! |-------|----------------------------------------------------------|
//! | 0     | level-2 bounds, entry `len`/`size` sanity, overlaps      |
//! | 1     | free-space ledger against the computed gaps              |
//! | 2     | image header (compression tag, slot it names)            |
//! | 3     | full decompression and record structure                  |
//! | 4     | nothing is trusted; every slot is searched for           |
//!
//! A dropped level-2 table loses every slot of its group; a dropped image
//! loses its own slot. Lost slots are handed to the recovery scanner. From
//! level 3 on, slots with no image at all are handed over too, so that an
//! image whose level-2 entry was wiped can be found again.

use crate::error::Result;
use crate::freespace::LedgerRead;
use crate::geometry::IMAGE_HEADER_SIZE;
use crate::header::{DeviceClass, CDEVHDR_POS, CDEVHDR_SIZE, DEVHDR_POS, DEVHDR_SIZE, L1_POS};
use crate::io::{ImageFile, ImageIo};
use crate::space::{SpaceEntry, SpaceKind, SpaceTable};
use crate::table::{l1_is_sentinel, L2Table, L2_ENTRIES};
use crate::track::Verdict;
use crate::volume::Volume;
use crate::width::Width;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// An image kept although this build cannot decode it
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Unsupported {
    pub slot: u64,
    pub tag: u8,
    pub offset: u64,
}

/// Everything learned about the file at one thoroughness level
#[derive(Debug, Clone)]
pub(crate) struct Survey {
    pub level: i32,
    pub table: SpaceTable,
    /// Level-2 tables as read from disk, by level-1 index
    pub tables: BTreeMap<usize, L2Table>,
    /// Groups whose level-2 table must be rebuilt
    pub rebuild: BTreeSet<usize>,
    /// Slots the recovery scanner should look for
    pub lost: BTreeSet<u64>,
    /// Slots whose entry referenced an image that was rejected
    pub rejected: BTreeSet<u64>,
    /// Null slots worth looking for in free space
    pub orphans: BTreeSet<u64>,
    /// Level-2 tables and images rejected
    pub damage: usize,
    pub overlaps: usize,
    pub unsupported: Vec<Unsupported>,
    /// Ledger missing, corrupt, or disagreeing with the computed gaps
    pub ledger_mismatch: bool,
}

impl Survey {
    fn new(level: i32) -> Self {
        Survey {
            level,
            table: SpaceTable::new(),
            tables: BTreeMap::new(),
            rebuild: BTreeSet::new(),
            lost: BTreeSet::new(),
            rejected: BTreeSet::new(),
            orphans: BTreeSet::new(),
            damage: 0,
            overlaps: 0,
            unsupported: Vec::new(),
            ledger_mismatch: false,
        }
    }

    fn lose_group(&mut self, group: usize, slots: u64) {
        self.rebuild.insert(group);
        let first = (group * L2_ENTRIES) as u64;
        self.lost.extend((first..first + L2_ENTRIES as u64).filter(|&n| n < slots));
    }

    fn reject_slot(&mut self, slot: u64) {
        self.rebuild.insert((slot / L2_ENTRIES as u64) as usize);
        self.lost.insert(slot);
        self.rejected.insert(slot);
        self.damage += 1;
    }

    /// Level-1 index and slot of an image entry
    fn slot_of(entry: &SpaceEntry) -> (usize, usize) {
        crate::table::split_index(entry.index)
    }
}

fn image_kind(class: DeviceClass) -> SpaceKind {
    match class {
        DeviceClass::Ckd => SpaceKind::Track,
        DeviceClass::Fba => SpaceKind::BlockGroup,
    }
}

/// Build and validate the space table at `level`
///
/// At level 3 every null slot is listed in `orphans`, so the scanner also
/// looks for it. A track that was nulled on purpose comes back if its old
/// image is still intact in free space.
pub(crate) fn survey<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    vol: &Volume<W>,
    level: i32,
) -> Result<Survey> {
    let mut s = Survey::new(level);
    let slots = vol.limits.slots;
    let l1_end = vol.l1_end();
    let l2_size = W::l2_table_size();

    s.table.push(SpaceEntry::new(
        SpaceKind::DeviceHeader,
        0,
        DEVHDR_POS,
        DEVHDR_SIZE as u64,
        DEVHDR_SIZE as u64,
    ));
    s.table.push(SpaceEntry::new(
        SpaceKind::CompressedHeader,
        0,
        CDEVHDR_POS,
        CDEVHDR_SIZE as u64,
        CDEVHDR_SIZE as u64,
    ));
    s.table.push(SpaceEntry::new(
        SpaceKind::L1,
        0,
        L1_POS,
        l1_end - L1_POS,
        l1_end - L1_POS,
    ));
    s.table.set_eof(vol.eof);

    for (group, &pos) in vol.l1.iter().enumerate() {
        if level >= 4 {
            s.lose_group(group, slots);
        }
        if l1_is_sentinel::<W>(pos) {
            continue;
        }
        if pos < l1_end || pos.saturating_add(l2_size) > vol.eof {
            warn!("level-2 table {} at {} is out of bounds", group, pos);
            s.damage += 1;
            s.lose_group(group, slots);
            continue;
        }
        let table = L2Table::decode::<W>(&io.read_at(pos, l2_size as usize)?, vol.endian);
        // At level 4 the table is kept only to tell what recovery changed
        if level < 4 {
            s.table.push(SpaceEntry::new(
                SpaceKind::L2,
                group as u64,
                pos,
                l2_size,
                l2_size,
            ));
        }
        s.tables.insert(group, table);
    }

    if level < 4 {
        catalogue_images(vol, &mut s);
    }
    s.table.sort();

    drop_overlaps(&mut s, slots);

    if level >= 2 {
        inspect_images(io, vol, &mut s)?;
    }

    if level == 3 {
        let present: BTreeSet<u64> = s
            .table
            .entries()
            .iter()
            .filter(|e| e.kind.is_image())
            .map(|e| e.index)
            .collect();
        s.orphans = (0..slots)
            .filter(|n| !present.contains(n) && !s.lost.contains(n))
            .collect();
    }

    // Level 4 catalogues nothing, so its gaps say nothing about the ledger
    if (1..4).contains(&level) {
        let gaps = s.table.gaps();
        s.ledger_mismatch = match &vol.ledger {
            LedgerRead::Valid(ledger) => ledger.regions != gaps,
            LedgerRead::Corrupt(reason) => {
                warn!("free space ledger: {}", reason);
                true
            }
        };
        if s.ledger_mismatch {
            debug!("free space ledger does not match {} computed gaps", gaps.len());
        }
    }

    debug!(
        "level {} survey: {} entries, {} lost slots, {} tables to rebuild",
        level,
        s.table.len(),
        s.lost.len(),
        s.rebuild.len()
    );
    Ok(s)
}

/// Push an entry for every in-range image of every table read
fn catalogue_images<W: Width>(vol: &Volume<W>, s: &mut Survey) {
    let kind = image_kind(vol.dev.kind.class);
    let limits = &vol.limits;
    let l1_end = vol.l1_end();
    let mut rejected = Vec::new();
    let mut stray = Vec::new();

    for (&group, table) in &s.tables {
        for (j, entry) in table.entries.iter().enumerate() {
            if !entry.has_image::<W>() {
                continue;
            }
            let slot = (group * L2_ENTRIES + j) as u64;
            if slot >= limits.slots {
                warn!("level-2 table {} names slot {} beyond the device", group, slot);
                stray.push(group);
                continue;
            }
            let len = entry.len as usize;
            let end = entry.pos.saturating_add(entry.size as u64);
            if len < limits.min_image() || entry.len > entry.size || len > limits.max_image {
                warn!(
                    "slot {}: inconsistent length {} / size {}",
                    slot, entry.len, entry.size
                );
                rejected.push(slot);
            } else if entry.pos < l1_end || end > vol.eof {
                warn!("slot {}: image at {} is out of bounds", slot, entry.pos);
                rejected.push(slot);
            } else {
                s.table.push(SpaceEntry::new(
                    kind,
                    slot,
                    entry.pos,
                    entry.len as u64,
                    entry.size as u64,
                ));
            }
        }
    }

    for group in stray {
        s.rebuild.insert(group);
        s.damage += 1;
    }
    for slot in rejected {
        s.reject_slot(slot);
    }
}

/// Remove both sides of every overlap, sparing the fixed headers
fn drop_overlaps(s: &mut Survey, slots: u64) {
    let overlaps = s.table.overlaps();
    if overlaps.is_empty() {
        return;
    }
    s.overlaps = overlaps.len();

    let mut victims = BTreeSet::new();
    for o in &overlaps {
        let (a, b) = (s.table.entries()[o.first], s.table.entries()[o.second]);
        warn!(
            "{:?} {} at {} overlaps {:?} {} at {}",
            a.kind, a.index, a.offset, b.kind, b.index, b.offset
        );
        if !a.kind.is_fixed() {
            victims.insert(o.first);
        }
        if !b.kind.is_fixed() {
            victims.insert(o.second);
        }
    }

    let mut lost_groups = BTreeSet::new();
    for &i in &victims {
        let e = s.table.entries()[i];
        match e.kind {
            SpaceKind::L2 => {
                s.damage += 1;
                lost_groups.insert(e.index as usize);
            }
            _ => s.reject_slot(e.index),
        }
        s.table.mark_removed(i);
    }

    for group in lost_groups {
        s.lose_group(group, slots);
        s.table.remove_where(|e| {
            (e.kind.is_image() && Survey::slot_of(e).0 == group)
                || (e.kind == SpaceKind::L2 && e.index == group as u64)
        });
    }
    s.table.purge();
}

/// Level 2 reads each image header, level 3 the whole image
fn inspect_images<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    vol: &Volume<W>,
    s: &mut Survey,
) -> Result<()> {
    let full = s.level >= 3;
    let mut bad = Vec::new();

    for (i, e) in s.table.entries().iter().enumerate() {
        if !e.kind.is_image() {
            continue;
        }
        let verdict = if full {
            let stored = io.read_at(e.offset, e.len as usize)?;
            vol.limits.check_image(&stored, e.index)
        } else {
            let header = io.read_at(e.offset, IMAGE_HEADER_SIZE)?;
            vol.limits.check_header(&header, e.index)
        };
        match verdict {
            Verdict::Valid => {}
            Verdict::Unsupported(tag) => {
                warn!(
                    "slot {} at {} uses compression {} which this build cannot decode",
                    e.index, e.offset, tag
                );
                s.unsupported.push(Unsupported {
                    slot: e.index,
                    tag,
                    offset: e.offset,
                });
            }
            Verdict::Invalid(reason) => {
                warn!("slot {} at {}: {}", e.index, e.offset, reason);
                bad.push(i);
            }
        }
    }

    for i in bad {
        let slot = s.table.entries()[i].index;
        s.reject_slot(slot);
        s.table.mark_removed(i);
    }
    s.table.purge();
    Ok(())
}
