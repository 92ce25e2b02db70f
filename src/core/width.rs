//! Field widths and byte order for on-disk structures
//!
//! The 32-bit and 64-bit image formats run the same algorithms; they differ
//! only in how wide offsets and lengths are on disk. [`Width`] captures those
//! differences so every pass is written once and instantiated twice.

use crate::error::{CckdError, Result};
use serde::Serialize;

/// Byte order of the multi-byte fields in the compressed header, the
/// level-1/level-2 tables and the free-space ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Byte order of the machine we are running on
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn swapped(self) -> Self {
        match self {
            Endian::Little => Endian::Big,
            Endian::Big => Endian::Little,
        }
    }

    pub fn get_u16(self, b: &[u8]) -> u16 {
        let raw = [b[0], b[1]];
        match self {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        }
    }

    pub fn get_u32(self, b: &[u8]) -> u32 {
        let raw = [b[0], b[1], b[2], b[3]];
        match self {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        }
    }

    pub fn get_u64(self, b: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b[..8]);
        match self {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        }
    }

    pub fn put_u16(self, b: &mut [u8], v: u16) {
        let raw = match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        b[..2].copy_from_slice(&raw);
    }

    pub fn put_u32(self, b: &mut [u8], v: u32) {
        let raw = match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        b[..4].copy_from_slice(&raw);
    }

    pub fn put_u64(self, b: &mut [u8], v: u64) {
        let raw = match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        b[..8].copy_from_slice(&raw);
    }
}

/// Byte offsets of the compressed-header fields whose position depends on
/// the field width
#[derive(Debug, Clone, Copy)]
pub struct HeaderLayout {
    pub size: usize,
    pub used: usize,
    pub free_off: usize,
    pub free_total: usize,
    pub free_largest: usize,
    pub free_num: usize,
    pub free_imbed: usize,
    pub cyls: usize,
    pub nullfmt: usize,
    pub compress: usize,
    pub compress_parm: usize,
}

/// On-disk field width of an image family
pub trait Width: Copy + std::fmt::Debug + Send + Sync + 'static {
    /// Width of an offset field in bytes
    const OFFSET_BYTES: usize;
    /// Level-1 entry size
    const L1_ENTRY_SIZE: usize = Self::OFFSET_BYTES;
    /// Level-2 entry size (offset, u16 length, u16 size, padding)
    const L2_ENTRY_SIZE: usize;
    /// Free-space record size (offset, length)
    const FREE_RECORD_SIZE: usize = 2 * Self::OFFSET_BYTES;
    /// Largest representable offset; doubles as the all-ones sentinel
    const MAX: u64;
    /// Version stamp written on every commit
    const VRM: [u8; 3];
    /// Compressed-header field positions
    const LAYOUT: HeaderLayout;

    fn get_off(endian: Endian, b: &[u8]) -> u64 {
        match Self::OFFSET_BYTES {
            4 => endian.get_u32(b) as u64,
            _ => endian.get_u64(b),
        }
    }

    fn put_off(endian: Endian, b: &mut [u8], v: u64) -> Result<()> {
        if v > Self::MAX {
            return Err(CckdError::OffsetOverflow(v));
        }
        match Self::OFFSET_BYTES {
            4 => endian.put_u32(b, v as u32),
            _ => endian.put_u64(b, v),
        }
        Ok(())
    }

    /// Size of a full level-2 table in bytes
    fn l2_table_size() -> u64 {
        (Self::L2_ENTRY_SIZE * crate::table::L2_ENTRIES) as u64
    }
}

/// 32-bit offsets (`*_C370` / `*_S370` images)
#[derive(Debug, Clone, Copy)]
pub struct Narrow;

/// 64-bit offsets (`*_C064` / `*_S064` images)
#[derive(Debug, Clone, Copy)]
pub struct Wide;

impl Width for Narrow {
    const OFFSET_BYTES: usize = 4;
    const L2_ENTRY_SIZE: usize = 8;
    const MAX: u64 = u32::MAX as u64;
    const VRM: [u8; 3] = [0, 3, 1];
    const LAYOUT: HeaderLayout = HeaderLayout {
        size: 12,
        used: 16,
        free_off: 20,
        free_total: 24,
        free_largest: 28,
        free_num: 32,
        free_imbed: 36,
        cyls: 40,
        nullfmt: 44,
        compress: 45,
        compress_parm: 46,
    };
}

impl Width for Wide {
    const OFFSET_BYTES: usize = 8;
    const L2_ENTRY_SIZE: usize = 16;
    const MAX: u64 = u64::MAX;
    const VRM: [u8; 3] = [1, 0, 0];
    const LAYOUT: HeaderLayout = HeaderLayout {
        size: 24,
        used: 32,
        free_off: 40,
        free_total: 48,
        free_largest: 56,
        free_num: 64,
        free_imbed: 72,
        cyls: 12,
        nullfmt: 16,
        compress: 17,
        compress_parm: 18,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endian_round_trip() {
        let mut buf = [0u8; 8];
        Endian::Big.put_u32(&mut buf, 0x0102_0304);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(Endian::Big.get_u32(&buf), 0x0102_0304);
        assert_eq!(Endian::Little.get_u32(&buf), 0x0403_0201);

        Endian::Little.put_u16(&mut buf, 0xABCD);
        assert_eq!(&buf[..2], &[0xCD, 0xAB]);
    }

    #[test]
    fn test_narrow_offset_overflow() {
        let mut buf = [0u8; 4];
        assert!(Narrow::put_off(Endian::Little, &mut buf, u32::MAX as u64).is_ok());
        assert!(matches!(
            Narrow::put_off(Endian::Little, &mut buf, 1 << 32),
            Err(CckdError::OffsetOverflow(_))
        ));
    }

    #[test]
    fn test_table_sizes() {
        assert_eq!(Narrow::l2_table_size(), 2048);
        assert_eq!(Wide::l2_table_size(), 4096);
        assert_eq!(Narrow::FREE_RECORD_SIZE, 8);
        assert_eq!(Wide::FREE_RECORD_SIZE, 16);
    }

    #[test]
    fn test_wide_offsets() {
        let mut buf = [0u8; 8];
        Wide::put_off(Endian::Big, &mut buf, 0x1_0000_0000).unwrap();
        assert_eq!(Wide::get_off(Endian::Big, &buf), 0x1_0000_0000);
    }
}
