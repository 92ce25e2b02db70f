//! Compressed CKD/FBA image engine
//!
//! ## On-disk structures
//!
//! - [`header`] - device header, compressed header and its arithmetic checks
//! - [`width`] - 32-bit and 64-bit field widths, byte order
//! - [`table`] - level-1 and level-2 lookup tables
//! - [`freespace`] - the free-space ledger in chain or array form
//! - [`geometry`] - device models and their limits
//! - [`track`] - track and block-group image validation
//! - [`compression`] - zlib and (optionally) bzip2 codecs
//!
//! ## Passes
//!
//! - [`chkdsk`] - survey, recovery and free-space rebuild
//! - [`compact`] - relocate everything into the compact layout
//! - [`endian`] - convert a file to the other byte order
//!
//! The passes share [`volume`] (loading), [`space`] (the space map),
//! [`validate`] (surveying), [`recover`] (gap scanning) and [`rebuild`]
//! (planning and writing).

pub mod chkdsk;
pub mod compact;
pub mod compression;
pub mod config;
pub mod endian;
pub mod error;
pub mod freespace;
pub mod geometry;
pub mod header;
pub mod io;
pub mod rebuild;
pub mod recover;
pub mod report;
pub mod space;
pub mod table;
pub mod track;
pub mod validate;
pub mod volume;
pub mod width;

pub use config::{CheckOptions, CompactOptions, Config, EndianAction};
pub use error::{CckdError, Result};
pub use freespace::LedgerFormat;
pub use header::{DeviceClass, DeviceHeader, FieldWidth, HeaderTotals, ImageKind};
pub use io::{ImageFile, ImageIo};
pub use report::{CheckReport, CompactReport};
