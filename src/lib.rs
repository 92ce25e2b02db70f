//! # cckd - compressed CKD/FBA image maintenance
//!
//! `cckd-rs` checks, repairs and compacts compressed emulated-DASD images:
//! count-key-data (CKD) volumes stored one compressed track per image and
//! fixed-block (FBA) volumes stored one compressed 120-block group per
//! image. Both the 32-bit (`*_C370`/`*_S370`) and 64-bit (`*_C064`/`*_S064`)
//! file formats are handled by one engine.
//!
//! - **Check**: validate the file at a chosen thoroughness, recover
//!   images the lookup tables lost track of, and rebuild the free-space
//!   ledger. The result code is `0` clean, `1` free space rebuilt or
//!   `2` data recovered.
//! - **Compact**: rewrite the file with no free space at all.
//! - **Swap**: convert the file to the other byte order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cckd::{check, CheckOptions, Result};
//! use std::fs::OpenOptions;
//!
//! # fn main() -> Result<()> {
//! let file = OpenOptions::new().read(true).write(true).open("volume.cckd")?;
//! let report = check(file, &CheckOptions::new().with_level(3))?;
//! println!("{}", report);
//! std::process::exit(report.code());
//! # }
//! ```
//!
//! Every pass accepts anything implementing [`ImageIo`], so an in-memory
//! `Cursor<Vec<u8>>` works as well as a real file:
//!
//! ```rust,no_run
//! use cckd::{compact, CompactOptions, Result};
//! use std::io::Cursor;
//!
//! # fn main() -> Result<()> {
//! let bytes = std::fs::read("volume.cckd")?;
//! let mut image = Cursor::new(bytes);
//! let report = compact(&mut image, &CompactOptions::default())?;
//! assert!(report.totals.free_num == 0);
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core resolve
#[allow(unused_imports)]
pub(crate) use core::{
    chkdsk, compact as compactor, compression, config, endian, error, freespace, geometry,
    header, io, rebuild, recover, report, space, table, track, validate, volume, width,
};

pub use crate::core::{
    compression::CompressionMethod,
    config::{CheckOptions, CompactOptions, Config, EndianAction, DEFAULT_LEVEL, MAX_LEVEL, MIN_LEVEL},
    error::{CckdError, Result},
    freespace::LedgerFormat,
    header::{DeviceClass, DeviceHeader, FieldWidth, HeaderTotals, ImageKind},
    io::{ImageFile, ImageIo},
    recover::Found,
    report::{CheckReport, CompactReport},
    validate::Unsupported,
    width::{Endian, Narrow, Wide, Width},
};

use crate::header::DEVHDR_SIZE;
use tracing::info;

/// Open `file` as an image and read its device header
fn open<F: ImageIo>(file: F) -> Result<(ImageFile<F>, DeviceHeader)> {
    let mut io = ImageFile::new(file);
    let raw = io.read_upto(header::DEVHDR_POS, DEVHDR_SIZE)?;
    let dev = DeviceHeader::from_bytes(&raw)?;
    Ok((io, dev))
}

/// Check and, where needed, repair an image
///
/// The file must be writable unless `opts.level` is such that nothing
/// needs repair. On success the report's [`CheckReport::code`] is the
/// pass's result code; on error the pass aborted and
/// [`CckdError::exit_code`] applies.
pub fn check<F: ImageIo>(file: F, opts: &CheckOptions) -> Result<CheckReport> {
    let (mut io, dev) = open(file)?;
    info!(
        "checking {} at level {}",
        String::from_utf8_lossy(&dev.kind.devid()),
        opts.level
    );
    match dev.kind.width {
        FieldWidth::Bits32 => chkdsk::run::<Narrow, F>(&mut io, dev, opts),
        FieldWidth::Bits64 => chkdsk::run::<Wide, F>(&mut io, dev, opts),
    }
}

/// Rewrite an image in the compact layout
///
/// Fails with [`CckdError::Inconsistent`] if the file needs a check first.
pub fn compact<F: ImageIo>(file: F, opts: &CompactOptions) -> Result<CompactReport> {
    let (mut io, dev) = open(file)?;
    info!("compacting {}", String::from_utf8_lossy(&dev.kind.devid()));
    match dev.kind.width {
        FieldWidth::Bits32 => compactor::run::<Narrow, F>(&mut io, dev, opts),
        FieldWidth::Bits64 => compactor::run::<Wide, F>(&mut io, dev, opts),
    }
}

/// Convert an image to the other byte order, returning the new one
pub fn swap_endian<F: ImageIo>(file: F) -> Result<Endian> {
    let (mut io, dev) = open(file)?;
    let endian = match dev.kind.width {
        FieldWidth::Bits32 => endian::swap::<Narrow, F>(&mut io)?,
        FieldWidth::Bits64 => endian::swap::<Wide, F>(&mut io)?,
    };
    info!("image is now {:?}-endian", endian);
    Ok(endian)
}
