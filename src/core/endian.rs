//! Endianness normalizer
//!
//! Rewrites every multi-byte field of the compressed header, the level-1
//! table, each in-bounds level-2 table and the free-space ledger in the
//! opposite byte order, then toggles `OPT_BIGENDIAN`. Each structure is
//! read, converted and written back at the offset it came from before the
//! next one is touched; the header goes last.

use crate::error::{CckdError, Result};
use crate::freespace::{read_ledger, write_array, write_record, LedgerFormat, LedgerRead};
use crate::header::{
    endian_of, CompressedHeader, CDEVHDR_POS, CDEVHDR_SIZE, L1_POS, OPT_BIGENDIAN,
};
use crate::io::{ImageFile, ImageIo};
use crate::table::{decode_l1, encode_l1, l1_is_sentinel, L2Table};
use crate::width::{Endian, Width};
use tracing::{debug, info};

/// Whether a file declaring `declared` order must be swapped
pub(crate) fn needs_swap(declared: Endian, force: bool) -> bool {
    force || declared != Endian::host()
}

/// Byte order the compressed header declares, without decoding it
pub(crate) fn declared_endian<F: ImageIo>(io: &mut ImageFile<F>) -> Result<Endian> {
    let raw = io.read_upto(CDEVHDR_POS, CDEVHDR_SIZE)?;
    if raw.len() < CDEVHDR_SIZE {
        return Err(CckdError::Format(
            "file too short for a compressed device header".into(),
        ));
    }
    Ok(endian_of(raw[3]))
}

/// Convert the whole file to the opposite of its declared byte order
///
/// Returns the new order.
pub(crate) fn swap<W: Width, F: ImageIo>(io: &mut ImageFile<F>) -> Result<Endian> {
    let file_len = io.len()?;
    let mut raw = io.read_at(CDEVHDR_POS, CDEVHDR_SIZE)?;
    let from = endian_of(raw[3]);
    let to = from.swapped();
    let mut hdr = CompressedHeader::decode::<W>(&raw, from)?;

    let l1_len = hdr.num_l1tab as u64 * W::L1_ENTRY_SIZE as u64;
    let l1 = if L1_POS + l1_len <= file_len {
        let l1 = decode_l1::<W>(&io.read_at(L1_POS, l1_len as usize)?, from);
        io.write_at(L1_POS, &encode_l1::<W>(&l1, to)?)?;
        l1
    } else {
        Vec::new()
    };

    let l2_size = W::l2_table_size();
    let mut swapped_tables = 0usize;
    for &pos in &l1 {
        if l1_is_sentinel::<W>(pos) || pos.saturating_add(l2_size) > file_len {
            continue;
        }
        let table = L2Table::decode::<W>(&io.read_at(pos, l2_size as usize)?, from);
        io.write_at(pos, &table.encode::<W>(to)?)?;
        swapped_tables += 1;
    }

    if let LedgerRead::Valid(ledger) = read_ledger::<W, F>(io, &hdr, from, file_len)? {
        match ledger.format {
            LedgerFormat::Array => {
                write_array::<W, F>(io, hdr.free_off, &ledger.regions, to)?;
            }
            LedgerFormat::Chain => {
                for (i, region) in ledger.regions.iter().enumerate() {
                    let next = ledger.regions.get(i + 1).map_or(0, |r| r.offset);
                    write_record::<W, F>(io, region.offset, next, region.len, to)?;
                }
            }
        }
    }

    hdr.options = match to {
        Endian::Big => hdr.options | OPT_BIGENDIAN,
        Endian::Little => hdr.options & !OPT_BIGENDIAN,
    };
    hdr.encode::<W>(&mut raw, to)?;
    io.write_at(CDEVHDR_POS, &raw)?;
    io.sync()?;

    debug!("swapped header, level-1 and {} level-2 tables", swapped_tables);
    info!("converted image from {:?} to {:?} byte order", from, to);
    Ok(to)
}
