//! Compaction pass
//!
//! Target layout: headers, level-1, every non-empty level-2 table in
//! level-1 order, then every image packed back to back with no reserved
//! slack, and nothing after. Images that sit where the level-2 tables are
//! going are read into memory first and written after all others.

use crate::config::{CompactOptions, EndianAction};
use crate::endian::{declared_endian, needs_swap, swap};
use crate::error::{CckdError, Result};
use crate::header::{DeviceHeader, HeaderTotals, L1_POS, OPT_CLEARABLE};
use crate::io::{ImageFile, ImageIo};
use crate::rebuild::commit_header;
use crate::report::CompactReport;
use crate::space::SpaceEntry;
use crate::table::{encode_l1, l1_is_sentinel, split_index, L2Entry};
use crate::validate::survey;
use crate::volume::Volume;
use crate::width::Width;
use tracing::{debug, info};

/// Level the catalogue is built at; image headers are checked so that
/// nothing undecodable gets moved
const COMPACT_LEVEL: i32 = 2;

struct Placement {
    entry: SpaceEntry,
    to: u64,
    /// Lives where the level-2 tables will go
    buffered: bool,
}

pub(crate) fn run<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    dev: DeviceHeader,
    opts: &CompactOptions,
) -> Result<CompactReport> {
    let declared = declared_endian(io)?;
    let swapped = needs_swap(declared, opts.endian == EndianAction::Swap);
    if swapped {
        swap::<W, F>(io)?;
    }

    let vol = Volume::<W>::load(io, dev)?;
    let s = survey(io, &vol, COMPACT_LEVEL)?;
    if s.damage > 0 || !s.lost.is_empty() {
        return Err(CckdError::Inconsistent(format!(
            "{} damaged structures and {} lost slots; run a check first",
            s.damage,
            s.lost.len()
        )));
    }
    if let Some(u) = s.unsupported.first() {
        return Err(CckdError::UnsupportedCompression {
            tag: u.tag,
            offset: u.offset,
        });
    }

    let l2_size = W::l2_table_size();
    let mut l1 = vol.l1.clone();
    let mut tables = s.tables;
    let mut pos = vol.l1_end();
    for (group, value) in l1.iter_mut().enumerate() {
        if l1_is_sentinel::<W>(*value) {
            continue;
        }
        let collapsed = tables.get(&group).and_then(|t| t.collapse::<W>());
        if let Some(sentinel) = collapsed {
            debug!("level-2 table {} is empty, collapsing", group);
            *value = sentinel;
            tables.remove(&group);
            continue;
        }
        *value = pos;
        pos += l2_size;
    }
    let l2_end = pos;

    let mut placements: Vec<Placement> = s
        .table
        .entries()
        .iter()
        .filter(|e| e.kind.is_image())
        .map(|e| Placement {
            entry: *e,
            to: 0,
            buffered: e.offset < l2_end,
        })
        .collect();
    for p in placements.iter_mut().filter(|p| !p.buffered) {
        p.to = pos;
        pos += p.entry.len;
    }
    for p in placements.iter_mut().filter(|p| p.buffered) {
        p.to = pos;
        pos += p.entry.len;
    }
    let end = pos;

    let totals = HeaderTotals {
        size: end,
        used: end,
        ..Default::default()
    };
    let moved_tables = l1
        .iter()
        .zip(&vol.l1)
        .filter(|(new, old)| new != old && !l1_is_sentinel::<W>(**new))
        .count();
    let moved_images = placements
        .iter()
        .filter(|p| p.to != p.entry.offset || p.entry.size != p.entry.len)
        .count();
    let buffered_images = placements.iter().filter(|p| p.buffered).count();

    let mut report = CompactReport {
        kind: dev.kind,
        device: vol.geometry.name,
        swapped,
        noop: false,
        moved_tables,
        moved_images,
        buffered_images,
        old_size: vol.file_len,
        new_size: end,
        totals,
    };

    let already_compact = l1 == vol.l1
        && moved_images == 0
        && vol.file_len == end
        && vol.hdr.totals() == totals
        && vol.hdr.options & OPT_CLEARABLE == 0;
    if already_compact {
        info!("image is already compact");
        report.noop = true;
        return Ok(report);
    }

    let mut held = Vec::with_capacity(buffered_images);
    for p in placements.iter().filter(|p| p.buffered) {
        held.push(io.read_at(p.entry.offset, p.entry.len as usize)?);
    }
    for p in placements.iter().filter(|p| !p.buffered) {
        if p.to != p.entry.offset {
            let data = io.read_at(p.entry.offset, p.entry.len as usize)?;
            io.write_at(p.to, &data)?;
        }
    }
    for (p, data) in placements.iter().filter(|p| p.buffered).zip(&held) {
        io.write_at(p.to, data)?;
    }

    for p in &placements {
        let (group, slot) = split_index(p.entry.index);
        if let Some(t) = tables.get_mut(&group) {
            let len = p.entry.len as u16;
            t.entries[slot] = L2Entry::new(p.to, len, len);
        }
    }
    for (group, t) in &tables {
        io.write_at(l1[*group], &t.encode::<W>(vol.endian)?)?;
    }
    io.write_at(L1_POS, &encode_l1::<W>(&l1, vol.endian)?)?;

    commit_header::<W, F>(io, &vol, Some(&totals))?;
    io.set_len(end)?;
    io.sync()?;

    info!(
        "compacted {} -> {} bytes ({} tables, {} images moved)",
        vol.file_len, end, moved_tables, moved_images
    );
    Ok(report)
}
