//! Level-1 and level-2 lookup tables
//!
//! A track (or block-group) number `n` lives in level-2 table `n / 256`,
//! slot `n % 256`. Level-1 holds the file offset of each level-2 table.

use crate::error::Result;
use crate::width::{Endian, Width};

/// Entries per level-2 table
pub const L2_ENTRIES: usize = 256;

/// Level-1 value for "no table in this file"
pub const L1_NONE: u64 = 0;

/// Level-2 slot of a track or block-group number
pub fn split_index(n: u64) -> (usize, usize) {
    ((n / L2_ENTRIES as u64) as usize, (n % L2_ENTRIES as u64) as usize)
}

/// Level-1 value for "table allocated but currently empty"
pub fn l1_empty<W: Width>() -> u64 {
    W::MAX
}

/// True if a level-1 value does not reference a table
pub fn l1_is_sentinel<W: Width>(value: u64) -> bool {
    value == L1_NONE || value == W::MAX
}

/// One level-2 entry: where an image lives, its stored length and the space
/// reserved for it (`size >= len`, the difference is imbedded free space)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L2Entry {
    pub pos: u64,
    pub len: u16,
    pub size: u16,
}

impl L2Entry {
    pub const ZERO: L2Entry = L2Entry {
        pos: 0,
        len: 0,
        size: 0,
    };

    pub fn new(pos: u64, len: u16, size: u16) -> Self {
        L2Entry { pos, len, size }
    }

    /// The all-ones entry
    pub fn sentinel<W: Width>() -> Self {
        L2Entry {
            pos: W::MAX,
            len: u16::MAX,
            size: u16::MAX,
        }
    }

    /// Entry written for a slot whose image no longer exists
    pub fn null<W: Width>(shadow: bool) -> Self {
        if shadow {
            Self::sentinel::<W>()
        } else {
            Self::ZERO
        }
    }

    /// True if the entry references an image in this file
    pub fn has_image<W: Width>(&self) -> bool {
        self.pos != 0 && self.pos != W::MAX
    }

    pub fn imbedded(&self) -> u64 {
        self.size.saturating_sub(self.len) as u64
    }

    fn decode<W: Width>(b: &[u8], endian: Endian) -> Self {
        let o = W::OFFSET_BYTES;
        L2Entry {
            pos: W::get_off(endian, b),
            len: endian.get_u16(&b[o..]),
            size: endian.get_u16(&b[o + 2..]),
        }
    }

    fn encode<W: Width>(&self, b: &mut [u8], endian: Endian) -> Result<()> {
        let o = W::OFFSET_BYTES;
        W::put_off(endian, b, self.pos)?;
        endian.put_u16(&mut b[o..], self.len);
        endian.put_u16(&mut b[o + 2..], self.size);
        Ok(())
    }
}

/// A full level-2 table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Table {
    pub entries: Vec<L2Entry>,
}

impl L2Table {
    /// A table whose every slot is the file's null entry
    pub fn null<W: Width>(shadow: bool) -> Self {
        L2Table {
            entries: vec![L2Entry::null::<W>(shadow); L2_ENTRIES],
        }
    }

    pub fn decode<W: Width>(bytes: &[u8], endian: Endian) -> Self {
        let entries = bytes
            .chunks_exact(W::L2_ENTRY_SIZE)
            .take(L2_ENTRIES)
            .map(|chunk| L2Entry::decode::<W>(chunk, endian))
            .collect();
        L2Table { entries }
    }

    pub fn encode<W: Width>(&self, endian: Endian) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; W::l2_table_size() as usize];
        for (entry, chunk) in self
            .entries
            .iter()
            .zip(bytes.chunks_exact_mut(W::L2_ENTRY_SIZE))
        {
            entry.encode::<W>(chunk, endian)?;
        }
        Ok(bytes)
    }

    /// Level-1 sentinel this table collapses to, if it holds no images
    pub fn collapse<W: Width>(&self) -> Option<u64> {
        if self.entries.iter().all(|e| *e == L2Entry::ZERO) {
            Some(L1_NONE)
        } else if self
            .entries
            .iter()
            .all(|e| *e == L2Entry::sentinel::<W>())
        {
            Some(l1_empty::<W>())
        } else {
            None
        }
    }
}

/// Decode a level-1 table
pub fn decode_l1<W: Width>(bytes: &[u8], endian: Endian) -> Vec<u64> {
    bytes
        .chunks_exact(W::L1_ENTRY_SIZE)
        .map(|chunk| W::get_off(endian, chunk))
        .collect()
}

/// Encode a level-1 table
pub fn encode_l1<W: Width>(l1: &[u64], endian: Endian) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; l1.len() * W::L1_ENTRY_SIZE];
    for (value, chunk) in l1.iter().zip(bytes.chunks_exact_mut(W::L1_ENTRY_SIZE)) {
        W::put_off(endian, chunk, *value)?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::width::{Narrow, Wide};

    #[test]
    fn test_split_index() {
        assert_eq!(split_index(0), (0, 0));
        assert_eq!(split_index(255), (0, 255));
        assert_eq!(split_index(256), (1, 0));
        assert_eq!(split_index(1000), (3, 232));
    }

    #[test]
    fn test_l2_table_codec() {
        let mut table = L2Table::null::<Narrow>(false);
        table.entries[3] = L2Entry::new(4096, 300, 320);
        table.entries[255] = L2Entry::new(8192, 41, 41);

        for endian in [Endian::Little, Endian::Big] {
            let bytes = table.encode::<Narrow>(endian).unwrap();
            assert_eq!(bytes.len(), 2048);
            assert_eq!(L2Table::decode::<Narrow>(&bytes, endian), table);

            let bytes = table.encode::<Wide>(endian).unwrap();
            assert_eq!(bytes.len(), 4096);
            assert_eq!(L2Table::decode::<Wide>(&bytes, endian), table);
        }
    }

    #[test]
    fn test_collapse() {
        assert_eq!(L2Table::null::<Narrow>(false).collapse::<Narrow>(), Some(0));
        assert_eq!(
            L2Table::null::<Narrow>(true).collapse::<Narrow>(),
            Some(u32::MAX as u64)
        );
        assert_eq!(
            L2Table::null::<Wide>(true).collapse::<Wide>(),
            Some(u64::MAX)
        );

        let mut table = L2Table::null::<Narrow>(false);
        table.entries[7] = L2Entry::new(5000, 10, 10);
        assert_eq!(table.collapse::<Narrow>(), None);
    }

    #[test]
    fn test_entry_image_detection() {
        assert!(!L2Entry::ZERO.has_image::<Narrow>());
        assert!(!L2Entry::sentinel::<Narrow>().has_image::<Narrow>());
        assert!(L2Entry::new(2048, 37, 40).has_image::<Narrow>());
        assert_eq!(L2Entry::new(2048, 37, 40).imbedded(), 3);
    }

    #[test]
    fn test_l1_codec_preserves_sentinels() {
        let l1 = vec![1024 + 16, L1_NONE, l1_empty::<Narrow>(), 9000];
        let bytes = encode_l1::<Narrow>(&l1, Endian::Big).unwrap();
        assert_eq!(decode_l1::<Narrow>(&bytes, Endian::Big), l1);
        assert!(l1_is_sentinel::<Narrow>(l1[1]));
        assert!(l1_is_sentinel::<Narrow>(l1[2]));
        assert!(!l1_is_sentinel::<Narrow>(l1[3]));
    }
}
