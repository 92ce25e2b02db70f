//! Check pass: normalize, survey, recover, rebuild, commit

use crate::compression::{tag_supported, CompressionMethod};
use crate::config::{CheckOptions, EndianAction};
use crate::endian::{declared_endian, needs_swap, swap};
use crate::error::{CckdError, Result};
use crate::freespace::LedgerRead;
use crate::header::{DeviceHeader, OPT_CLEARABLE};
use crate::io::{ImageFile, ImageIo};
use crate::rebuild::{self, commit_header, Layout};
use crate::recover;
use crate::report::CheckReport;
use crate::table::{split_index, L2Table, L2_ENTRIES};
use crate::validate::{survey, Unsupported};
use crate::volume::Volume;
use crate::width::Width;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Level a damaged survey is repeated at before recovery
const RECOVERY_LEVEL: i32 = 3;

pub(crate) fn run<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    dev: DeviceHeader,
    opts: &CheckOptions,
) -> Result<CheckReport> {
    opts.validate()?;

    let declared = declared_endian(io)?;
    let swapped = needs_swap(declared, opts.endian == EndianAction::Swap);
    if swapped {
        swap::<W, F>(io)?;
    }

    let vol = Volume::<W>::load(io, dev)?;
    let mut report = CheckReport::new(dev.kind, vol.geometry.name, opts.level);
    report.swapped = swapped;
    report.totals = vol.hdr.totals();

    let level = vol.required_level(opts.level);
    report.level = level;
    if level < 0 {
        return finish_clean(io, &vol, report);
    }

    let mut s = survey(io, &vol, level)?;
    if s.damage > 0 && level < RECOVERY_LEVEL {
        info!(
            "{} damaged structures at level {}, escalating to level {}",
            s.damage, level, RECOVERY_LEVEL
        );
        s = survey(io, &vol, RECOVERY_LEVEL)?;
    }
    report.level = s.level;
    report.overlaps = s.overlaps;
    report.damaged = s.damage;
    report.unsupported = s.unsupported.clone();

    let found = if s.lost.is_empty() && s.orphans.is_empty() {
        Vec::new()
    } else {
        let gaps = s.table.gaps();
        let mut wanted: BTreeSet<u64> = s.lost.union(&s.orphans).copied().collect();
        recover::scan(io, &vol.limits, &gaps, &mut wanted, &s.orphans)?
    };
    report.recovered = found.clone();

    let damage = s.damage;
    let ledger_mismatch = s.ledger_mismatch;
    let unsupported = s.unsupported.clone();
    let originals = s.tables.clone();
    let rejected = s.rejected.clone();
    let layout = rebuild::plan(&vol, s, &found);

    report.lost = lost_slots::<W>(&originals, &rejected, &layout);
    for slot in &report.lost {
        warn!("slot {} could not be recovered and is now empty", slot);
    }

    // Totals are compared in the encoding already on disk
    let on_disk_format = match &vol.ledger {
        LedgerRead::Valid(ledger) if !ledger.regions.is_empty() => ledger.format,
        _ => opts.ledger,
    };
    // A ledger that already lists the final gaps need not be rewritten
    let ledger_stale = match &vol.ledger {
        LedgerRead::Valid(ledger) => ledger.regions != layout.gaps(),
        LedgerRead::Corrupt(_) => true,
    };
    let data_changed = damage > 0 || !layout.changed_slots.is_empty();
    let free_changed = layout.rewrites(&vol)
        || ((ledger_mismatch || ledger_stale) && report.level >= 1)
        || layout.totals(on_disk_format) != vol.hdr.totals();

    if !data_changed && !free_changed {
        return finish_clean(io, &vol, report);
    }

    guard_unsupported(io, &vol, &layout, &originals, &unsupported)?;

    report.totals = rebuild::apply(io, &vol, &layout, opts.ledger)?;
    report.free_space_rebuilt = true;
    report.data_recovered = data_changed;
    info!(
        "check complete: {} recovered, {} lost, code {}",
        report.recovered.len(),
        report.lost.len(),
        report.code()
    );
    Ok(report)
}

/// Slots that held an image before the pass and hold none in the plan
///
/// Covers single rejected slots as well as every slot of a level-2 table
/// that was dropped whole. Slots of a table that could not be read at all
/// are unknown and not listed.
fn lost_slots<W: Width>(
    originals: &BTreeMap<usize, L2Table>,
    rejected: &BTreeSet<u64>,
    layout: &Layout,
) -> Vec<u64> {
    let had_image = originals.iter().flat_map(|(&group, t)| {
        t.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.has_image::<W>())
            .map(move |(j, _)| (group * L2_ENTRIES + j) as u64)
    });
    let before: BTreeSet<u64> = had_image.chain(rejected.iter().copied()).collect();
    before
        .into_iter()
        .filter(|&slot| {
            let (group, j) = split_index(slot);
            !layout
                .tables
                .get(&group)
                .is_some_and(|t| t.entries[j].has_image::<W>())
        })
        .collect()
}

/// Refuse to rewrite a file holding images this build cannot decode
///
/// Such an image can neither be moved safely nor told apart from junk by
/// the recovery scanner, so any plan that moves it or drops its slot would
/// lose it.
fn guard_unsupported<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    vol: &Volume<W>,
    layout: &Layout,
    originals: &BTreeMap<usize, L2Table>,
    unsupported: &[Unsupported],
) -> Result<()> {
    let refuse = |tag, offset| Err(CckdError::UnsupportedCompression { tag, offset });
    if let Some(u) = unsupported.first() {
        return refuse(u.tag, u.offset);
    }
    for m in layout.moves.iter().filter(|m| m.kind.is_image()) {
        let tag = io.read_at(m.from, 1)?[0];
        if !tag_supported(tag) {
            return refuse(tag, m.from);
        }
    }
    for &slot in &layout.changed_slots {
        let (group, j) = split_index(slot);
        let Some(old) = originals.get(&group).map(|t| t.entries[j]) else {
            continue;
        };
        if !old.has_image::<W>() || old.pos < vol.l1_end() || old.pos >= vol.eof {
            continue;
        }
        let tag = io.read_at(old.pos, 1)?[0];
        if CompressionMethod::from_u8(tag).is_some() && !tag_supported(tag) {
            return refuse(tag, old.pos);
        }
    }
    Ok(())
}

/// Nothing to repair; clear leftover open flags if any
fn finish_clean<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    vol: &Volume<W>,
    mut report: CheckReport,
) -> Result<CheckReport> {
    if vol.hdr.options & OPT_CLEARABLE != 0 {
        commit_header::<W, F>(io, vol, None)?;
        io.sync()?;
        report.flags_cleared = true;
        info!("cleared open flags 0x{:02X}", vol.hdr.options & OPT_CLEARABLE);
    }
    Ok(report)
}
