//! Device geometry lookup
//!
//! Maps the device-type byte of the device header to the geometry needed to
//! bound track and block-group images.

use crate::error::{CckdError, Result};
use crate::header::DeviceClass;

/// Image header: compression tag plus cylinder/head (CKD) or group number (FBA)
pub const IMAGE_HEADER_SIZE: usize = 5;

/// Count field of a CKD record
pub const CKD_COUNT_SIZE: usize = 8;

/// Record 0 carries exactly this many data bytes
pub const CKD_R0_DATA_LEN: usize = 8;

/// FBA block size
pub const FBA_BLOCK_SIZE: usize = 512;

/// Blocks per compressed FBA block-group
pub const FBA_BLOCKS_PER_GROUP: usize = 120;

/// Expanded size of an FBA block-group image
pub const FBA_GROUP_SIZE: usize = IMAGE_HEADER_SIZE + FBA_BLOCKS_PER_GROUP * FBA_BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub class: DeviceClass,
    pub name: &'static str,
    /// Heads per cylinder (CKD); 0 for FBA
    pub heads: u32,
    /// Largest record-1 data length (CKD) or block size (FBA)
    pub max_record: u32,
}

impl Geometry {
    /// Largest expanded image this device can produce
    pub fn max_image_size(&self) -> usize {
        match self.class {
            DeviceClass::Ckd => {
                let raw = IMAGE_HEADER_SIZE
                    + CKD_COUNT_SIZE
                    + CKD_R0_DATA_LEN
                    + CKD_COUNT_SIZE
                    + self.max_record as usize
                    + CKD_COUNT_SIZE;
                (raw + 511) & !511
            }
            DeviceClass::Fba => FBA_GROUP_SIZE,
        }
    }
}

const fn ckd(name: &'static str, heads: u32, max_record: u32) -> Geometry {
    Geometry {
        class: DeviceClass::Ckd,
        name,
        heads,
        max_record,
    }
}

const fn fba(name: &'static str) -> Geometry {
    Geometry {
        class: DeviceClass::Fba,
        name,
        heads: 0,
        max_record: FBA_BLOCK_SIZE as u32,
    }
}

/// Resolve a device-type byte for the given architecture
pub fn lookup(devtype: u8, class: DeviceClass) -> Result<Geometry> {
    let geometry = match (class, devtype) {
        (DeviceClass::Ckd, 0x11) => ckd("2311", 10, 3625),
        (DeviceClass::Ckd, 0x14) => ckd("2314", 20, 7294),
        (DeviceClass::Ckd, 0x30) => ckd("3330", 19, 13030),
        (DeviceClass::Ckd, 0x40) => ckd("3340", 12, 8368),
        (DeviceClass::Ckd, 0x45) => ckd("9345", 15, 46456),
        (DeviceClass::Ckd, 0x50) => ckd("3350", 30, 19069),
        (DeviceClass::Ckd, 0x75) => ckd("3375", 12, 35616),
        (DeviceClass::Ckd, 0x80) => ckd("3380", 15, 47476),
        (DeviceClass::Ckd, 0x90) => ckd("3390", 15, 56664),
        (DeviceClass::Fba, 0x10) => fba("3310"),
        (DeviceClass::Fba, 0x32) => fba("9332"),
        (DeviceClass::Fba, 0x35) => fba("9335"),
        (DeviceClass::Fba, 0x36) => fba("9336"),
        (DeviceClass::Fba, 0x70) => fba("3370"),
        (DeviceClass::Fba, 0x71) => fba("0671"),
        _ => return Err(CckdError::Geometry(devtype)),
    };
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_3390_track_size() {
        let g = lookup(0x90, DeviceClass::Ckd).unwrap();
        assert_eq!(g.heads, 15);
        assert_eq!(g.max_image_size(), 56832);
    }

    #[test]
    fn test_fba_group_size() {
        let g = lookup(0x36, DeviceClass::Fba).unwrap();
        assert_eq!(g.max_image_size(), 61445);
    }

    #[test]
    fn test_unknown_device() {
        assert!(matches!(
            lookup(0x90, DeviceClass::Fba),
            Err(CckdError::Geometry(0x90))
        ));
        assert!(lookup(0xEE, DeviceClass::Ckd).is_err());
    }
}
