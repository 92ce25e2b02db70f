//! Free-space ledger and free-region map
//!
//! The ledger has two physical encodings that describe the same set of
//! disjoint `(offset, length)` ranges:
//!
//! - **Chain**: each free region starts with a record `(next, length)`;
//!   `free_off` points at the first region and the last `next` is zero.
//! - **Array**: `FREE_BLK` followed by `free_num` records
//!   `(offset, length)`, written past `size` at the end of the file.

use crate::error::{CckdError, Result};
use crate::header::CompressedHeader;
use crate::io::{ImageFile, ImageIo};
use crate::space::Gap;
use crate::width::{Endian, Width};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Tag at the front of an array-encoded ledger
pub const FREE_BLK_MAGIC: [u8; 8] = *b"FREE_BLK";

/// Physical encoding of the free-space ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerFormat {
    /// Contiguous array at end of file
    #[default]
    Array,
    /// Linked records inside the free regions
    Chain,
}

/// A decoded ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    pub format: LedgerFormat,
    pub regions: Vec<Gap>,
    /// Bytes an array ledger occupies past the header's `size`
    pub trailing_len: u64,
}

impl Ledger {
    pub fn empty() -> Self {
        Ledger {
            format: LedgerFormat::Chain,
            regions: Vec::new(),
            trailing_len: 0,
        }
    }
}

/// Result of trying to decode the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRead {
    Valid(Ledger),
    Corrupt(&'static str),
}

fn decode_record<W: Width>(bytes: &[u8], endian: Endian) -> (u64, u64) {
    (
        W::get_off(endian, bytes),
        W::get_off(endian, &bytes[W::OFFSET_BYTES..]),
    )
}

fn encode_record<W: Width>(bytes: &mut [u8], endian: Endian, a: u64, b: u64) -> Result<()> {
    W::put_off(endian, bytes, a)?;
    W::put_off(endian, &mut bytes[W::OFFSET_BYTES..], b)
}

/// Decode the ledger the header points at
///
/// Never reads past `file_len`; anything that does not hang together is
/// reported as [`LedgerRead::Corrupt`] rather than an error.
pub fn read_ledger<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    hdr: &CompressedHeader,
    endian: Endian,
    file_len: u64,
) -> Result<LedgerRead> {
    if hdr.free_off == 0 {
        return Ok(LedgerRead::Valid(Ledger::empty()));
    }
    let rec = W::FREE_RECORD_SIZE as u64;
    if hdr.free_off.saturating_add(rec) > file_len {
        return Ok(LedgerRead::Corrupt("free space offset beyond end of file"));
    }

    let lead = io.read_at(hdr.free_off, FREE_BLK_MAGIC.len())?;
    if lead == FREE_BLK_MAGIC {
        let body_len = match hdr.free_num.checked_mul(rec) {
            Some(n) => n,
            None => return Ok(LedgerRead::Corrupt("free space count overflows")),
        };
        let start = hdr.free_off + FREE_BLK_MAGIC.len() as u64;
        if start.saturating_add(body_len) > file_len {
            return Ok(LedgerRead::Corrupt("free space array runs past end of file"));
        }
        let body = io.read_at(start, body_len as usize)?;
        let regions = body
            .chunks_exact(W::FREE_RECORD_SIZE)
            .map(|chunk| {
                let (offset, len) = decode_record::<W>(chunk, endian);
                Gap { offset, len }
            })
            .collect();
        let trailing_len = if hdr.free_off == hdr.size {
            FREE_BLK_MAGIC.len() as u64 + body_len
        } else {
            0
        };
        debug!(
            "read array ledger at {} ({} records)",
            hdr.free_off, hdr.free_num
        );
        return Ok(LedgerRead::Valid(Ledger {
            format: LedgerFormat::Array,
            regions,
            trailing_len,
        }));
    }

    let mut regions = Vec::new();
    let mut pos = hdr.free_off;
    let limit = (file_len / rec).min(hdr.free_num.saturating_add(1));
    loop {
        if regions.len() as u64 >= limit {
            return Ok(LedgerRead::Corrupt("free space chain is too long or loops"));
        }
        if pos.saturating_add(rec) > file_len {
            return Ok(LedgerRead::Corrupt("free space chain leaves the file"));
        }
        let bytes = io.read_at(pos, W::FREE_RECORD_SIZE)?;
        let (next, len) = decode_record::<W>(&bytes, endian);
        regions.push(Gap { offset: pos, len });
        if next == 0 {
            break;
        }
        if next <= pos {
            return Ok(LedgerRead::Corrupt("free space chain is not ascending"));
        }
        pos = next;
    }
    debug!("read chained ledger ({} records)", regions.len());
    Ok(LedgerRead::Valid(Ledger {
        format: LedgerFormat::Chain,
        regions,
        trailing_len: 0,
    }))
}

/// Write one `(a, b)` record at `at`
pub fn write_record<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    at: u64,
    a: u64,
    b: u64,
    endian: Endian,
) -> Result<()> {
    let mut bytes = vec![0u8; W::FREE_RECORD_SIZE];
    encode_record::<W>(&mut bytes, endian, a, b)?;
    io.write_at(at, &bytes)
}

/// Write chain records into the regions themselves
///
/// Returns the new `free_off`.
pub fn write_chain<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    regions: &[Gap],
    endian: Endian,
) -> Result<u64> {
    for (i, region) in regions.iter().enumerate() {
        if region.len < W::FREE_RECORD_SIZE as u64 {
            return Err(CckdError::Inconsistent(format!(
                "free region at {} is too short ({} bytes) for a chain record",
                region.offset, region.len
            )));
        }
        let next = regions.get(i + 1).map_or(0, |r| r.offset);
        write_record::<W, F>(io, region.offset, next, region.len, endian)?;
    }
    Ok(regions.first().map_or(0, |r| r.offset))
}

/// Write an array ledger at `at`; returns its length in bytes
pub fn write_array<W: Width, F: ImageIo>(
    io: &mut ImageFile<F>,
    at: u64,
    regions: &[Gap],
    endian: Endian,
) -> Result<u64> {
    let mut bytes = vec![0u8; FREE_BLK_MAGIC.len() + regions.len() * W::FREE_RECORD_SIZE];
    bytes[..FREE_BLK_MAGIC.len()].copy_from_slice(&FREE_BLK_MAGIC);
    for (region, chunk) in regions
        .iter()
        .zip(bytes[FREE_BLK_MAGIC.len()..].chunks_exact_mut(W::FREE_RECORD_SIZE))
    {
        encode_record::<W>(chunk, endian, region.offset, region.len)?;
    }
    io.write_at(at, &bytes)?;
    Ok(bytes.len() as u64)
}

/// Free regions indexed by offset, used to place relocated structures
///
/// Adjacent regions are coalesced on insert.
#[derive(Debug, Clone, Default)]
pub struct FreeMap {
    regions: BTreeMap<u64, Gap>,
}

impl FreeMap {
    pub fn new(gaps: &[Gap]) -> Self {
        let mut map = FreeMap::default();
        for gap in gaps {
            map.insert_and_coalesce(*gap);
        }
        map
    }

    /// Insert a free region and coalesce with its neighbours
    pub fn insert_and_coalesce(&mut self, mut gap: Gap) {
        if gap.len == 0 {
            return;
        }
        if let Some((&prev_start, &prev)) = self.regions.range(..gap.offset).next_back() {
            if prev.end() == gap.offset {
                gap = Gap {
                    offset: prev.offset,
                    len: prev.len + gap.len,
                };
                self.regions.remove(&prev_start);
            }
        }
        if let Some((&next_start, &next)) = self.regions.range(gap.end()..).next() {
            if next.offset == gap.end() {
                gap.len += next.len;
                self.regions.remove(&next_start);
            }
        }
        self.regions.insert(gap.offset, gap);
    }

    /// Carve `len` bytes from the front of the largest region that fits
    pub fn allocate_largest(&mut self, len: u64) -> Option<u64> {
        let (&start, &gap) = self
            .regions
            .iter()
            .filter(|(_, g)| g.len >= len)
            .max_by_key(|(_, g)| g.len)?;

        self.regions.remove(&start);
        if gap.len > len {
            let rest = Gap {
                offset: gap.offset + len,
                len: gap.len - len,
            };
            self.regions.insert(rest.offset, rest);
        }
        Some(gap.offset)
    }

    /// Carve exactly `[offset, offset + len)` if it is entirely free
    pub fn take_exact(&mut self, offset: u64, len: u64) -> bool {
        let Some((&start, &gap)) = self.regions.range(..=offset).next_back() else {
            return false;
        };
        if gap.end() < offset.saturating_add(len) {
            return false;
        }
        self.regions.remove(&start);
        if offset > gap.offset {
            self.regions.insert(
                gap.offset,
                Gap {
                    offset: gap.offset,
                    len: offset - gap.offset,
                },
            );
        }
        let end = offset + len;
        if gap.end() > end {
            self.regions.insert(
                end,
                Gap {
                    offset: end,
                    len: gap.end() - end,
                },
            );
        }
        true
    }

    pub fn regions(&self) -> impl Iterator<Item = &Gap> {
        self.regions.values()
    }

    pub fn count(&self) -> usize {
        self.regions.len()
    }

    pub fn total(&self) -> u64 {
        self.regions.values().map(|g| g.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::width::{Narrow, Wide};
    use std::io::Cursor;

    fn header(free_off: u64, free_num: u64, size: u64) -> CompressedHeader {
        CompressedHeader {
            vrm: Narrow::VRM,
            options: 0,
            num_l1tab: 1,
            num_l2tab: 256,
            size,
            used: 0,
            free_off,
            free_total: 0,
            free_largest: 0,
            free_num,
            free_imbed: 0,
            cyls: 1,
            nullfmt: 0,
            compress: 0,
            compress_parm: 0,
        }
    }

    #[test]
    fn test_chain_round_trip() {
        let mut io = ImageFile::new(Cursor::new(vec![0u8; 8192]));
        let regions = vec![
            Gap {
                offset: 2000,
                len: 100,
            },
            Gap {
                offset: 5000,
                len: 8,
            },
        ];
        let free_off = write_chain::<Narrow, _>(&mut io, &regions, Endian::Big).unwrap();
        assert_eq!(free_off, 2000);

        let hdr = header(free_off, 2, 8192);
        let read = read_ledger::<Narrow, _>(&mut io, &hdr, Endian::Big, 8192).unwrap();
        assert_eq!(
            read,
            LedgerRead::Valid(Ledger {
                format: LedgerFormat::Chain,
                regions,
                trailing_len: 0
            })
        );
    }

    #[test]
    fn test_chain_rejects_short_region() {
        let mut io = ImageFile::new(Cursor::new(vec![0u8; 8192]));
        let regions = vec![Gap {
            offset: 2000,
            len: 12,
        }];
        assert!(write_chain::<Wide, _>(&mut io, &regions, Endian::Little).is_err());
    }

    #[test]
    fn test_array_round_trip_at_end_of_file() {
        let mut io = ImageFile::new(Cursor::new(vec![0u8; 4096]));
        let regions = vec![
            Gap {
                offset: 1500,
                len: 3,
            },
            Gap {
                offset: 3000,
                len: 900,
            },
        ];
        let written = write_array::<Wide, _>(&mut io, 4096, &regions, Endian::Little).unwrap();
        assert_eq!(written, 8 + 2 * 16);

        let file_len = io.len().unwrap();
        let hdr = header(4096, 2, 4096);
        match read_ledger::<Wide, _>(&mut io, &hdr, Endian::Little, file_len).unwrap() {
            LedgerRead::Valid(ledger) => {
                assert_eq!(ledger.format, LedgerFormat::Array);
                assert_eq!(ledger.regions, regions);
                assert_eq!(ledger.trailing_len, written);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_looping_chain_is_corrupt() {
        let mut io = ImageFile::new(Cursor::new(vec![0u8; 4096]));
        let mut rec = [0u8; 8];
        encode_record::<Narrow>(&mut rec, Endian::Little, 2000, 50).unwrap();
        io.write_at(2000, &rec).unwrap();

        let hdr = header(2000, 1, 4096);
        assert!(matches!(
            read_ledger::<Narrow, _>(&mut io, &hdr, Endian::Little, 4096).unwrap(),
            LedgerRead::Corrupt(_)
        ));
    }

    #[test]
    fn test_ledger_past_end_is_corrupt() {
        let mut io = ImageFile::new(Cursor::new(vec![0u8; 1024]));
        let hdr = header(5000, 1, 1024);
        assert!(matches!(
            read_ledger::<Narrow, _>(&mut io, &hdr, Endian::Little, 1024).unwrap(),
            LedgerRead::Corrupt(_)
        ));
    }

    #[test]
    fn test_free_map_allocates_from_largest() {
        let mut map = FreeMap::new(&[
            Gap {
                offset: 100,
                len: 50,
            },
            Gap {
                offset: 1000,
                len: 500,
            },
            Gap {
                offset: 3000,
                len: 200,
            },
        ]);
        assert_eq!(map.allocate_largest(100), Some(1000));
        assert_eq!(map.allocate_largest(400), Some(1100));
        assert_eq!(map.allocate_largest(400), None);
        assert_eq!(map.total(), 250);
    }

    #[test]
    fn test_free_map_take_exact() {
        let mut map = FreeMap::new(&[Gap {
            offset: 1000,
            len: 500,
        }]);
        assert!(!map.take_exact(900, 200));
        assert!(map.take_exact(1100, 100));
        let left: Vec<_> = map.regions().copied().collect();
        assert_eq!(
            left,
            vec![
                Gap {
                    offset: 1000,
                    len: 100
                },
                Gap {
                    offset: 1200,
                    len: 300
                }
            ]
        );
        assert!(!map.take_exact(1150, 100));
    }

    #[test]
    fn test_free_map_coalesces() {
        let mut map = FreeMap::default();
        map.insert_and_coalesce(Gap {
            offset: 0,
            len: 10,
        });
        map.insert_and_coalesce(Gap {
            offset: 20,
            len: 10,
        });
        map.insert_and_coalesce(Gap {
            offset: 10,
            len: 10,
        });
        assert_eq!(map.count(), 1);
        assert_eq!(map.total(), 30);
    }
}
