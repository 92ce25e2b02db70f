use crate::error::{CckdError, Result};
use crate::width::{Endian, Width};
use serde::Serialize;

/// Device header position and size (always little-endian)
pub const DEVHDR_POS: u64 = 0;
pub const DEVHDR_SIZE: usize = 512;

/// Compressed-device header position and size (file byte order)
pub const CDEVHDR_POS: u64 = 512;
pub const CDEVHDR_SIZE: usize = 512;

/// The level-1 table starts right after the two headers
pub const L1_POS: u64 = 1024;

pub const OPT_NOFUDGE: u8 = 0x01;
pub const OPT_BIGENDIAN: u8 = 0x02;
pub const OPT_SPERRS: u8 = 0x20;
pub const OPT_ORDWR: u8 = 0x40;
pub const OPT_OPENED: u8 = 0x80;

/// Option bits a completed repair or compaction pass may clear
pub const OPT_CLEARABLE: u8 = OPT_SPERRS | OPT_ORDWR | OPT_OPENED;

/// Disk architecture of the emulated volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceClass {
    /// Count-key-data: one image per track
    Ckd,
    /// Fixed-block: one image per 120-block group
    Fba,
}

/// On-disk width of offsets and header columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldWidth {
    Bits32,
    Bits64,
}

/// Everything the device identifier tells us about a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageKind {
    pub class: DeviceClass,
    /// Shadow (overlay) file; changes the level-1/level-2 sentinels
    pub shadow: bool,
    pub width: FieldWidth,
}

impl ImageKind {
    /// Parse an 8-byte device identifier such as `CKD_C370` or `FBA_S064`
    pub fn from_devid(devid: &[u8]) -> Option<Self> {
        if devid.len() < 8 || devid[3] != b'_' {
            return None;
        }
        let class = match &devid[0..3] {
            b"CKD" => DeviceClass::Ckd,
            b"FBA" => DeviceClass::Fba,
            _ => return None,
        };
        let shadow = match devid[4] {
            b'C' => false,
            b'S' => true,
            _ => return None,
        };
        let width = match &devid[5..8] {
            b"370" => FieldWidth::Bits32,
            b"064" => FieldWidth::Bits64,
            _ => return None,
        };
        Some(ImageKind {
            class,
            shadow,
            width,
        })
    }

    pub fn devid(&self) -> [u8; 8] {
        let mut id = [0u8; 8];
        id[0..3].copy_from_slice(match self.class {
            DeviceClass::Ckd => b"CKD",
            DeviceClass::Fba => b"FBA",
        });
        id[3] = b'_';
        id[4] = if self.shadow { b'S' } else { b'C' };
        id[5..8].copy_from_slice(match self.width {
            FieldWidth::Bits32 => b"370",
            FieldWidth::Bits64 => b"064",
        });
        id
    }
}

/// Static device geometry record (offset 0)
///
/// Read-only to the engine; only used to validate size invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHeader {
    pub kind: ImageKind,
    /// CKD: heads per cylinder. FBA: total number of blocks.
    pub heads: u32,
    /// CKD: track size. FBA: block size.
    pub trksize: u32,
    pub devtype: u8,
    pub fileseq: u8,
    pub highcyl: u16,
}

impl DeviceHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DEVHDR_SIZE {
            return Err(CckdError::Format("file too short for a device header".into()));
        }

        let kind = ImageKind::from_devid(&bytes[0..8]).ok_or_else(|| {
            CckdError::Format(format!(
                "unrecognized device identifier {:?}",
                String::from_utf8_lossy(&bytes[0..8])
            ))
        })?;

        Ok(DeviceHeader {
            kind,
            heads: Endian::Little.get_u32(&bytes[8..12]),
            trksize: Endian::Little.get_u32(&bytes[12..16]),
            devtype: bytes[16],
            fileseq: bytes[17],
            highcyl: Endian::Little.get_u16(&bytes[18..20]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; DEVHDR_SIZE];
        bytes[0..8].copy_from_slice(&self.kind.devid());
        Endian::Little.put_u32(&mut bytes[8..12], self.heads);
        Endian::Little.put_u32(&mut bytes[12..16], self.trksize);
        bytes[16] = self.devtype;
        bytes[17] = self.fileseq;
        Endian::Little.put_u16(&mut bytes[18..20], self.highcyl);
        bytes
    }
}

/// Mutable accounting record (offset 512)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedHeader {
    pub vrm: [u8; 3],
    pub options: u8,
    pub num_l1tab: u32,
    pub num_l2tab: u32,
    pub size: u64,
    pub used: u64,
    pub free_off: u64,
    pub free_total: u64,
    pub free_largest: u64,
    pub free_num: u64,
    pub free_imbed: u64,
    pub cyls: u32,
    pub nullfmt: u8,
    pub compress: u8,
    pub compress_parm: u16,
}

impl CompressedHeader {
    /// Byte order declared by the options byte
    pub fn endian(&self) -> Endian {
        endian_of(self.options)
    }

    pub fn decode<W: Width>(bytes: &[u8], endian: Endian) -> Result<Self> {
        if bytes.len() < CDEVHDR_SIZE {
            return Err(CckdError::Format(
                "file too short for a compressed device header".into(),
            ));
        }
        let l = W::LAYOUT;
        Ok(CompressedHeader {
            vrm: [bytes[0], bytes[1], bytes[2]],
            options: bytes[3],
            num_l1tab: endian.get_u32(&bytes[4..]),
            num_l2tab: endian.get_u32(&bytes[8..]),
            size: W::get_off(endian, &bytes[l.size..]),
            used: W::get_off(endian, &bytes[l.used..]),
            free_off: W::get_off(endian, &bytes[l.free_off..]),
            free_total: W::get_off(endian, &bytes[l.free_total..]),
            free_largest: W::get_off(endian, &bytes[l.free_largest..]),
            free_num: W::get_off(endian, &bytes[l.free_num..]),
            free_imbed: W::get_off(endian, &bytes[l.free_imbed..]),
            cyls: endian.get_u32(&bytes[l.cyls..]),
            nullfmt: bytes[l.nullfmt],
            compress: bytes[l.compress],
            compress_parm: endian.get_u16(&bytes[l.compress_parm..]),
        })
    }

    /// Encode into `bytes`, leaving reserved bytes untouched
    pub fn encode<W: Width>(&self, bytes: &mut [u8], endian: Endian) -> Result<()> {
        let l = W::LAYOUT;
        bytes[0..3].copy_from_slice(&self.vrm);
        bytes[3] = self.options;
        endian.put_u32(&mut bytes[4..], self.num_l1tab);
        endian.put_u32(&mut bytes[8..], self.num_l2tab);
        W::put_off(endian, &mut bytes[l.size..], self.size)?;
        W::put_off(endian, &mut bytes[l.used..], self.used)?;
        W::put_off(endian, &mut bytes[l.free_off..], self.free_off)?;
        W::put_off(endian, &mut bytes[l.free_total..], self.free_total)?;
        W::put_off(endian, &mut bytes[l.free_largest..], self.free_largest)?;
        W::put_off(endian, &mut bytes[l.free_num..], self.free_num)?;
        W::put_off(endian, &mut bytes[l.free_imbed..], self.free_imbed)?;
        endian.put_u32(&mut bytes[l.cyls..], self.cyls);
        bytes[l.nullfmt] = self.nullfmt;
        bytes[l.compress] = self.compress;
        endian.put_u16(&mut bytes[l.compress_parm..], self.compress_parm);
        Ok(())
    }

    pub fn totals(&self) -> HeaderTotals {
        HeaderTotals {
            size: self.size,
            used: self.used,
            free_off: self.free_off,
            free_total: self.free_total,
            free_largest: self.free_largest,
            free_num: self.free_num,
            free_imbed: self.free_imbed,
        }
    }

    pub fn set_totals(&mut self, totals: &HeaderTotals) {
        self.size = totals.size;
        self.used = totals.used;
        self.free_off = totals.free_off;
        self.free_total = totals.free_total;
        self.free_largest = totals.free_largest;
        self.free_num = totals.free_num;
        self.free_imbed = totals.free_imbed;
    }
}

pub fn endian_of(options: u8) -> Endian {
    if options & OPT_BIGENDIAN != 0 {
        Endian::Big
    } else {
        Endian::Little
    }
}

/// The size and free-space columns of the compressed header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeaderTotals {
    pub size: u64,
    pub used: u64,
    pub free_off: u64,
    pub free_total: u64,
    pub free_largest: u64,
    pub free_num: u64,
    pub free_imbed: u64,
}

/// A failed cross-check between header columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeaderViolation {
    UsedPlusFreeNotSize,
    NoLedgerButRegions,
    NoLedgerButFreeSpace,
    LedgerButNoFreeTotal,
    LedgerButNoRegions,
    NoRegionsButFreeSpace,
    RegionsButNoFreeSpace,
    ImbedExceedsTotal,
    LargestExceedsFree,
}

impl std::fmt::Display for HeaderViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            HeaderViolation::UsedPlusFreeNotSize => "used + free_total != size",
            HeaderViolation::NoLedgerButRegions => "free_off is zero but free_num is not",
            HeaderViolation::NoLedgerButFreeSpace => "free_off is zero but free_total != free_imbed",
            HeaderViolation::LedgerButNoFreeTotal => "free_off is set but free_total is zero",
            HeaderViolation::LedgerButNoRegions => "free_off is set but free_num is zero",
            HeaderViolation::NoRegionsButFreeSpace => "free_num is zero but free_total != free_imbed",
            HeaderViolation::RegionsButNoFreeSpace => "free_num is set but free_total <= free_imbed",
            HeaderViolation::ImbedExceedsTotal => "free_imbed exceeds free_total",
            HeaderViolation::LargestExceedsFree => "free_largest exceeds free_total - free_imbed",
        };
        f.write_str(msg)
    }
}

impl HeaderTotals {
    /// Run the arithmetic cross-checks between the columns
    pub fn violations(&self) -> Vec<HeaderViolation> {
        let mut v = Vec::new();
        if self.used.checked_add(self.free_total) != Some(self.size) {
            v.push(HeaderViolation::UsedPlusFreeNotSize);
        }
        if self.free_off == 0 && self.free_num != 0 {
            v.push(HeaderViolation::NoLedgerButRegions);
        }
        if self.free_off == 0 && self.free_total != self.free_imbed {
            v.push(HeaderViolation::NoLedgerButFreeSpace);
        }
        if self.free_off != 0 && self.free_total == 0 {
            v.push(HeaderViolation::LedgerButNoFreeTotal);
        }
        if self.free_off != 0 && self.free_num == 0 {
            v.push(HeaderViolation::LedgerButNoRegions);
        }
        if self.free_num == 0 && self.free_total != self.free_imbed {
            v.push(HeaderViolation::NoRegionsButFreeSpace);
        }
        if self.free_num != 0 && self.free_total <= self.free_imbed {
            v.push(HeaderViolation::RegionsButNoFreeSpace);
        }
        if self.free_imbed > self.free_total {
            v.push(HeaderViolation::ImbedExceedsTotal);
        } else if self.free_largest > self.free_total - self.free_imbed {
            v.push(HeaderViolation::LargestExceedsFree);
        }
        v
    }

    pub fn is_consistent(&self) -> bool {
        self.violations().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::width::{Narrow, Wide};

    fn sample() -> CompressedHeader {
        CompressedHeader {
            vrm: Narrow::VRM,
            options: OPT_NOFUDGE,
            num_l1tab: 4,
            num_l2tab: 256,
            size: 100_000,
            used: 90_000,
            free_off: 50_000,
            free_total: 10_000,
            free_largest: 6_000,
            free_num: 2,
            free_imbed: 1_000,
            cyls: 60,
            nullfmt: 0,
            compress: 1,
            compress_parm: 6,
        }
    }

    #[test]
    fn test_devid_parsing() {
        let kind = ImageKind::from_devid(b"CKD_C370").unwrap();
        assert_eq!(kind.class, DeviceClass::Ckd);
        assert!(!kind.shadow);
        assert_eq!(kind.width, FieldWidth::Bits32);

        let kind = ImageKind::from_devid(b"FBA_S064").unwrap();
        assert_eq!(kind.class, DeviceClass::Fba);
        assert!(kind.shadow);
        assert_eq!(kind.width, FieldWidth::Bits64);
        assert_eq!(&kind.devid(), b"FBA_S064");

        assert!(ImageKind::from_devid(b"CKD_P370").is_none());
        assert!(ImageKind::from_devid(b"INVALID!").is_none());
    }

    #[test]
    fn test_device_header_rejects_unknown_id() {
        let mut bytes = vec![0u8; DEVHDR_SIZE];
        bytes[0..8].copy_from_slice(b"CART\x00\x01\x00\x00");
        assert!(matches!(
            DeviceHeader::from_bytes(&bytes),
            Err(CckdError::Format(_))
        ));
    }

    #[test]
    fn test_device_header_serialization() {
        let hdr = DeviceHeader {
            kind: ImageKind::from_devid(b"CKD_C370").unwrap(),
            heads: 15,
            trksize: 56832,
            devtype: 0x90,
            fileseq: 0,
            highcyl: 0,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), DEVHDR_SIZE);
        assert_eq!(DeviceHeader::from_bytes(&bytes).unwrap(), hdr);
    }

    #[test]
    fn test_compressed_header_layouts() {
        let hdr = sample();
        for endian in [Endian::Little, Endian::Big] {
            let mut bytes = vec![0u8; CDEVHDR_SIZE];
            hdr.encode::<Narrow>(&mut bytes, endian).unwrap();
            assert_eq!(CompressedHeader::decode::<Narrow>(&bytes, endian).unwrap(), hdr);

            let mut bytes = vec![0u8; CDEVHDR_SIZE];
            hdr.encode::<Wide>(&mut bytes, endian).unwrap();
            assert_eq!(CompressedHeader::decode::<Wide>(&bytes, endian).unwrap(), hdr);
        }
    }

    #[test]
    fn test_narrow_header_overflow() {
        let mut hdr = sample();
        hdr.size = 1 << 40;
        let mut bytes = vec![0u8; CDEVHDR_SIZE];
        assert!(hdr.encode::<Narrow>(&mut bytes, Endian::Little).is_err());
        assert!(hdr.encode::<Wide>(&mut bytes, Endian::Little).is_ok());
    }

    #[test]
    fn test_totals_consistent() {
        assert!(sample().totals().is_consistent());
    }

    #[test]
    fn test_totals_violations() {
        let mut t = sample().totals();
        t.used += 1;
        assert_eq!(t.violations(), vec![HeaderViolation::UsedPlusFreeNotSize]);

        let mut t = sample().totals();
        t.free_off = 0;
        let v = t.violations();
        assert!(v.contains(&HeaderViolation::NoLedgerButRegions));
        assert!(v.contains(&HeaderViolation::NoLedgerButFreeSpace));

        let mut t = sample().totals();
        t.free_largest = 9_500;
        assert_eq!(t.violations(), vec![HeaderViolation::LargestExceedsFree]);

        let t = HeaderTotals {
            size: 10,
            used: 10,
            ..Default::default()
        };
        assert!(t.is_consistent());
    }
}
