//! Free-space rebuilder and persistence writer
//!
//! Repair is planned entirely in memory first: rebuilt level-2 tables are
//! placed, trailing free space is dropped and every free region too short
//! to hold a ledger record is squeezed out by shifting what follows it to
//! the left. Only then is the plan applied, in this order:
//!
//! 1. relocated structures, ascending, each read in full before written
//! 2. level-2 tables
//! 3. the level-1 table
//! 4. the free-space ledger
//! 5. the compressed header
//! 6. the new file length

use crate::error::Result;
use crate::freespace::{write_array, write_chain, FreeMap, LedgerFormat};
use crate::header::{HeaderTotals, CDEVHDR_POS, CDEVHDR_SIZE, L1_POS, OPT_CLEARABLE};
use crate::io::{ImageFile, ImageIo};
use crate::recover::Found;
use crate::space::{Gap, SpaceEntry, SpaceKind, SpaceTable};
use crate::table::{encode_l1, l1_is_sentinel, split_index, L2Entry, L2Table, L2_ENTRIES};
use crate::validate::Survey;
use crate::volume::Volume;
use crate::width::Width;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One structure relocated by the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Move {
    pub kind: SpaceKind,
    pub index: u64,
    pub from: u64,
    pub to: u64,
    pub len: u64,
}

/// Target state of a repaired file
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    pub l1: Vec<u64>,
    /// Every level-2 table still referenced by `l1`
    pub tables: BTreeMap<usize, L2Table>,
    /// Tables that must be written at their `l1` offset
    pub dirty: BTreeSet<usize>,
    pub moves: Vec<Move>,
    pub table: SpaceTable,
    /// Slots whose level-2 entry now points somewhere else
    pub changed_slots: BTreeSet<u64>,
}

impl Layout {
    pub fn eof(&self) -> u64 {
        self.table.eof().unwrap_or(0)
    }

    pub fn gaps(&self) -> Vec<Gap> {
        self.table.gaps()
    }

    /// Header columns describing this layout with the ledger in `format`
    pub fn totals(&self, format: LedgerFormat) -> HeaderTotals {
        let gaps = self.gaps();
        let imbed: u64 = self
            .table
            .entries()
            .iter()
            .filter(|e| e.kind.is_image())
            .map(|e| e.size - e.len)
            .sum();
        let free: u64 = gaps.iter().map(|g| g.len).sum();
        let size = self.eof();
        let free_off = match (gaps.first(), format) {
            (None, _) => 0,
            (Some(first), LedgerFormat::Chain) => first.offset,
            (Some(_), LedgerFormat::Array) => size,
        };
        HeaderTotals {
            size,
            used: size - free - imbed,
            free_off,
            free_total: free + imbed,
            free_largest: gaps.iter().map(|g| g.len).max().unwrap_or(0),
            free_num: gaps.len() as u64,
            free_imbed: imbed,
        }
    }

    /// True if applying the layout would change any table or the file length
    pub fn rewrites<W: Width>(&self, vol: &Volume<W>) -> bool {
        !self.moves.is_empty()
            || !self.dirty.is_empty()
            || self.l1 != vol.l1
            || self.eof() != vol.eof
    }
}

/// Plan the repair of a surveyed file after recovery
pub(crate) fn plan<W: Width>(vol: &Volume<W>, survey: Survey, found: &[Found]) -> Layout {
    let Survey {
        mut table,
        mut tables,
        mut rebuild,
        ..
    } = survey;
    let shadow = vol.shadow();
    let image_kind = match vol.dev.kind.class {
        crate::header::DeviceClass::Ckd => SpaceKind::Track,
        crate::header::DeviceClass::Fba => SpaceKind::BlockGroup,
    };

    for f in found {
        table.insert(SpaceEntry::new(image_kind, f.slot, f.offset, f.len, f.len));
        rebuild.insert(split_index(f.slot).0);
    }

    let null = L2Entry::null::<W>(shadow);
    let mut changed_slots = BTreeSet::new();
    let mut rebuilt = BTreeMap::new();
    for &group in &rebuild {
        let mut fresh = L2Table::null::<W>(shadow);
        for e in table.entries().iter().filter(|e| e.kind.is_image()) {
            let (g, j) = split_index(e.index);
            if g == group {
                fresh.entries[j] = L2Entry::new(e.offset, e.len as u16, e.size as u16);
            }
        }
        let before = tables.get(&group);
        for (j, new) in fresh.entries.iter().enumerate() {
            let old = before.map_or(null, |t| t.entries[j]);
            let moved = (old.pos, old.len) != (new.pos, new.len);
            if moved && (old.has_image::<W>() || new.has_image::<W>()) {
                changed_slots.insert((group * L2_ENTRIES + j) as u64);
            }
        }
        rebuilt.insert(group, fresh);
    }
    table.remove_where(|e| e.kind == SpaceKind::L2 && rebuild.contains(&(e.index as usize)));
    table.sort();

    let l2_size = W::l2_table_size();
    let mut l1 = vol.l1.clone();
    let mut dirty = BTreeSet::new();
    let mut free = FreeMap::new(&table.gaps());
    let mut eof = table.eof().unwrap_or(vol.eof);

    for (group, fresh) in rebuilt {
        let old = vol.l1[group];
        if let Some(sentinel) = fresh.collapse::<W>() {
            l1[group] = if l1_is_sentinel::<W>(old) { old } else { sentinel };
            tables.remove(&group);
            continue;
        }
        let at = if !l1_is_sentinel::<W>(old) && free.take_exact(old, l2_size) {
            old
        } else if let Some(at) = free.allocate_largest(l2_size) {
            at
        } else {
            eof += l2_size;
            eof - l2_size
        };
        if at != old || tables.get(&group) != Some(&fresh) {
            dirty.insert(group);
        }
        debug!("level-2 table {} placed at {}", group, at);
        l1[group] = at;
        table.insert(SpaceEntry::new(SpaceKind::L2, group as u64, at, l2_size, l2_size));
        tables.insert(group, fresh);
    }
    table.set_eof(eof);

    if let Some(last) = table.gaps().last() {
        if last.end() == eof {
            debug!("dropping {} bytes of trailing free space", last.len);
            eof = last.offset;
            table.set_eof(eof);
        }
    }

    // Dirty tables are written whole after the moves, so shifting one only
    // changes where it goes. An appended table has no bytes on disk yet.
    let rewritten = dirty.clone();
    let mut moves = squeeze_short_gaps::<W>(&mut table);
    for m in &moves {
        match m.kind {
            SpaceKind::L2 => {
                l1[m.index as usize] = m.to;
                dirty.insert(m.index as usize);
            }
            _ => {
                let (g, j) = split_index(m.index);
                if let Some(t) = tables.get_mut(&g) {
                    t.entries[j].pos = m.to;
                    dirty.insert(g);
                }
            }
        }
    }
    moves.retain(|m| !(m.kind == SpaceKind::L2 && rewritten.contains(&(m.index as usize))));

    table.synthesize_free();
    debug_assert!(table.is_partition(), "planned layout does not tile the file");

    Layout {
        l1,
        tables,
        dirty,
        moves,
        table,
        changed_slots,
    }
}

/// Shift everything after each sub-record-sized gap left to close it
fn squeeze_short_gaps<W: Width>(table: &mut SpaceTable) -> Vec<Move> {
    let min = W::FREE_RECORD_SIZE as u64;
    let mut moves = Vec::new();
    let mut shift = 0u64;
    let mut prev_end = 0u64;

    for e in table.entries_mut() {
        match e.kind {
            SpaceKind::Free | SpaceKind::Removed => continue,
            SpaceKind::EndOfFile => {
                e.offset -= shift;
                break;
            }
            _ => {}
        }
        let gap = e.offset.saturating_sub(prev_end);
        if gap > 0 && gap < min {
            shift += gap;
        }
        prev_end = e.end();
        if shift > 0 {
            moves.push(Move {
                kind: e.kind,
                index: e.index,
                from: e.offset,
                to: e.offset - shift,
                len: e.size,
            });
            e.offset -= shift;
        }
    }
    if shift > 0 {
        debug!(
            "closing short free regions moves {} structures by up to {} bytes",
            moves.len(),
            shift
        );
    }
    moves
}

/// Rewrite the compressed header with fresh totals, stamp and flags
pub(crate) fn commit_header<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    vol: &Volume<W>,
    totals: Option<&HeaderTotals>,
) -> Result<()> {
    let mut raw = io.read_at(CDEVHDR_POS, CDEVHDR_SIZE)?;
    let mut hdr = vol.hdr.clone();
    if let Some(totals) = totals {
        hdr.set_totals(totals);
    }
    hdr.options &= !OPT_CLEARABLE;
    hdr.vrm = W::VRM;
    hdr.encode::<W>(&mut raw, vol.endian)?;
    io.write_at(CDEVHDR_POS, &raw)
}

/// Write a planned layout to disk
pub(crate) fn apply<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    vol: &Volume<W>,
    layout: &Layout,
    format: LedgerFormat,
) -> Result<HeaderTotals> {
    for m in &layout.moves {
        let data = io.read_at(m.from, m.len as usize)?;
        io.write_at(m.to, &data)?;
    }

    for group in &layout.dirty {
        if let Some(t) = layout.tables.get(group) {
            io.write_at(layout.l1[*group], &t.encode::<W>(vol.endian)?)?;
        }
    }
    if layout.l1 != vol.l1 {
        io.write_at(L1_POS, &encode_l1::<W>(&layout.l1, vol.endian)?)?;
    }

    let gaps = layout.gaps();
    let totals = layout.totals(format);
    let mut file_len = totals.size;
    match format {
        LedgerFormat::Chain => {
            write_chain::<W, F>(io, &gaps, vol.endian)?;
        }
        LedgerFormat::Array if !gaps.is_empty() => {
            file_len += write_array::<W, F>(io, totals.size, &gaps, vol.endian)?;
        }
        LedgerFormat::Array => {}
    }

    commit_header::<W, F>(io, vol, Some(&totals))?;
    io.set_len(file_len)?;
    io.sync()?;

    info!(
        "rewrote {} level-2 tables, moved {} structures, {} free regions ({} bytes)",
        layout.dirty.len(),
        layout.moves.len(),
        totals.free_num,
        totals.free_total
    );
    Ok(totals)
}
