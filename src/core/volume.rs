//! An opened image: headers, geometry and the level-1 table
//!
//! Loading fails with a format or geometry error when the file cannot be
//! interpreted at all. Everything else is left to the validator.

use crate::error::{CckdError, Result};
use crate::freespace::{read_ledger, LedgerRead};
use crate::geometry::{self, Geometry, FBA_BLOCKS_PER_GROUP};
use crate::header::{
    endian_of, CompressedHeader, DeviceClass, DeviceHeader, HeaderViolation, CDEVHDR_POS,
    CDEVHDR_SIZE, L1_POS, OPT_OPENED, OPT_SPERRS,
};
use crate::io::{ImageFile, ImageIo};
use crate::table::{decode_l1, L2_ENTRIES};
use crate::track::DeviceLimits;
use crate::width::{Endian, Width};
use std::marker::PhantomData;
use tracing::{debug, warn};

pub(crate) struct Volume<W: Width> {
    pub dev: DeviceHeader,
    pub hdr: CompressedHeader,
    pub endian: Endian,
    pub geometry: Geometry,
    pub limits: DeviceLimits,
    pub l1: Vec<u64>,
    /// Physical file length
    pub file_len: u64,
    pub ledger: LedgerRead,
    /// End of the catalogued area; excludes an array ledger parked past `size`
    pub eof: u64,
    width: PhantomData<W>,
}

/// Tracks (CKD) or block-groups (FBA) the device holds
pub(crate) fn slot_count(dev: &DeviceHeader, hdr: &CompressedHeader) -> u64 {
    match dev.kind.class {
        DeviceClass::Ckd => hdr.cyls as u64 * dev.heads as u64,
        DeviceClass::Fba => (dev.heads as u64).div_ceil(FBA_BLOCKS_PER_GROUP as u64),
    }
}

impl<W: Width> Volume<W> {
    pub fn load<F: ImageIo>(io: &mut ImageFile<F>, dev: DeviceHeader) -> Result<Self> {
        let file_len = io.len()?;
        let raw = io.read_upto(CDEVHDR_POS, CDEVHDR_SIZE)?;
        if raw.len() < CDEVHDR_SIZE {
            return Err(CckdError::Format(
                "file too short for a compressed device header".into(),
            ));
        }
        let endian = endian_of(raw[3]);
        let hdr = CompressedHeader::decode::<W>(&raw, endian)?;
        let geometry = geometry::lookup(dev.devtype, dev.kind.class)?;

        if hdr.num_l2tab as usize != L2_ENTRIES {
            return Err(CckdError::Format(format!(
                "level-2 tables hold {} entries, expected {}",
                hdr.num_l2tab, L2_ENTRIES
            )));
        }
        let slots = slot_count(&dev, &hdr);
        if slots == 0 {
            return Err(CckdError::Format("device has no tracks".into()));
        }
        let needed = slots.div_ceil(L2_ENTRIES as u64);
        if (hdr.num_l1tab as u64) < needed {
            return Err(CckdError::Format(format!(
                "level-1 table has {} entries, device needs {}",
                hdr.num_l1tab, needed
            )));
        }
        let l1_len = hdr.num_l1tab as u64 * W::L1_ENTRY_SIZE as u64;
        if L1_POS + l1_len > file_len {
            return Err(CckdError::Format("level-1 table runs past end of file".into()));
        }
        let l1 = decode_l1::<W>(&io.read_at(L1_POS, l1_len as usize)?, endian);

        let ledger = read_ledger::<W, F>(io, &hdr, endian, file_len)?;
        let eof = match &ledger {
            LedgerRead::Valid(l) if l.trailing_len > 0 && file_len == hdr.size + l.trailing_len => {
                hdr.size
            }
            _ => file_len,
        };

        let limits = DeviceLimits::new(dev.kind.class, &geometry, dev.heads, slots);
        debug!(
            "loaded {} image: {} slots, {} level-1 entries, {} byte order, eof {}",
            geometry.name,
            slots,
            l1.len(),
            if endian == Endian::Big { "big" } else { "little" },
            eof
        );

        Ok(Volume {
            dev,
            hdr,
            endian,
            geometry,
            limits,
            l1,
            file_len,
            ledger,
            eof,
            width: PhantomData,
        })
    }

    pub fn shadow(&self) -> bool {
        self.dev.kind.shadow
    }

    pub fn l1_end(&self) -> u64 {
        L1_POS + (self.l1.len() * W::L1_ENTRY_SIZE) as u64
    }

    /// Thoroughness the header alone demands
    pub fn required_level(&self, requested: i32) -> i32 {
        let mut level = requested;
        if self.hdr.options & (OPT_OPENED | OPT_SPERRS) != 0 {
            debug!("image was not closed cleanly (options 0x{:02X})", self.hdr.options);
            level = level.max(1);
        }
        let violations: Vec<HeaderViolation> = self.hdr.totals().violations();
        for v in &violations {
            warn!("header: {}", v);
        }
        if !violations.is_empty() {
            level = level.max(1);
        }
        if self.eof < self.hdr.size {
            warn!(
                "file is shorter ({}) than the recorded size ({})",
                self.eof, self.hdr.size
            );
            level = level.max(3);
        } else if self.eof != self.hdr.size {
            warn!(
                "file length {} does not match the recorded size {}",
                self.eof, self.hdr.size
            );
            level = level.max(1);
        }
        level
    }
}
