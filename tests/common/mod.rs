//! Builds consistent compressed images for integration tests

#![allow(dead_code)]

use cckd::core::header::{CompressedHeader, OPT_BIGENDIAN, OPT_NOFUDGE};
use cckd::core::table::{encode_l1, l1_empty, L2Entry, L2Table, L2_ENTRIES};
use cckd::core::track::{build_ckd_track, build_fba_group, compress_image};
use cckd::{
    CompressionMethod, DeviceClass, DeviceHeader, Endian, FieldWidth, HeaderTotals, ImageKind,
    LedgerFormat, Narrow, Wide, Width,
};
use std::collections::{BTreeMap, BTreeSet};

pub const FREE_BLK: &[u8; 8] = b"FREE_BLK";

/// Byte that fills every free region; never a valid compression tag
pub const FILL: u8 = 0xA5;

/// One image to place in the file
#[derive(Debug, Clone)]
pub struct Image {
    pub slot: u64,
    pub stored: Vec<u8>,
    /// Reserved bytes past the stored length
    pub slack: u64,
    /// Free bytes placed just before this image
    pub hole_before: u64,
}

#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub class: DeviceClass,
    pub shadow: bool,
    pub width: FieldWidth,
    pub endian: Endian,
    pub devtype: u8,
    /// CKD: heads per cylinder. FBA: total blocks.
    pub heads: u32,
    /// CKD cylinders
    pub cyls: u32,
    pub ledger: Option<LedgerFormat>,
    pub options: u8,
    /// Place the level-2 tables after the images instead of before
    pub tables_last: bool,
    pub images: Vec<Image>,
}

/// A built file plus where everything ended up
#[derive(Debug, Clone)]
pub struct Built {
    pub bytes: Vec<u8>,
    /// slot -> (offset, stored length)
    pub images: BTreeMap<u64, (u64, u64)>,
    /// level-1 index -> level-2 table offset
    pub tables: BTreeMap<usize, u64>,
    pub totals: HeaderTotals,
}

/// Stored CKD track for `slot` on a device with `heads` heads
pub fn ckd_track(slot: u64, heads: u32, method: CompressionMethod) -> Vec<u8> {
    let cyl = (slot / heads as u64) as u16;
    let head = (slot % heads as u64) as u16;
    let fill = (slot % 251) as u8;
    let data = vec![fill; 200 + (slot as usize % 7) * 31];
    let key = [fill ^ 0x5A; 4];
    let expanded = build_ckd_track(cyl, head, &[(1, &key, &data), (2, b"", &data[..64])]);
    compress_image(&expanded, method).expect("track compresses")
}

/// Stored FBA block-group for `group`
pub fn fba_group(group: u64, method: CompressionMethod) -> Vec<u8> {
    let expanded = build_fba_group(group as u32, |i, block| {
        block.fill(0x80 | (group as usize * 7 + i) as u8);
    });
    compress_image(&expanded, method).expect("group compresses")
}

impl ImageSpec {
    /// 3390 volume, 15 heads per cylinder
    pub fn ckd(width: FieldWidth, cyls: u32) -> Self {
        ImageSpec {
            class: DeviceClass::Ckd,
            shadow: false,
            width,
            endian: Endian::host(),
            devtype: 0x90,
            heads: 15,
            cyls,
            ledger: Some(LedgerFormat::Array),
            options: OPT_NOFUDGE,
            tables_last: false,
            images: Vec::new(),
        }
    }

    /// 9336 volume of `groups` block-groups
    pub fn fba(width: FieldWidth, groups: u32) -> Self {
        ImageSpec {
            class: DeviceClass::Fba,
            shadow: false,
            width,
            endian: Endian::host(),
            devtype: 0x36,
            heads: groups * 120,
            cyls: 0,
            ledger: Some(LedgerFormat::Array),
            options: OPT_NOFUDGE,
            tables_last: false,
            images: Vec::new(),
        }
    }

    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }

    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn ledger(mut self, ledger: LedgerFormat) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn tables_last(mut self) -> Self {
        self.tables_last = true;
        self
    }

    pub fn options(mut self, options: u8) -> Self {
        self.options = options;
        self
    }

    pub fn slots(&self) -> u64 {
        match self.class {
            DeviceClass::Ckd => self.cyls as u64 * self.heads as u64,
            DeviceClass::Fba => (self.heads as u64).div_ceil(120),
        }
    }

    /// Add the default image for `slot`
    pub fn with(mut self, slot: u64, method: CompressionMethod) -> Self {
        let stored = match self.class {
            DeviceClass::Ckd => ckd_track(slot, self.heads, method),
            DeviceClass::Fba => fba_group(slot, method),
        };
        self.images.push(Image {
            slot,
            stored,
            slack: 0,
            hole_before: 0,
        });
        self
    }

    /// Add the default image for `slot` behind a free region of `hole` bytes
    pub fn with_hole(mut self, hole: u64, slot: u64, method: CompressionMethod) -> Self {
        self = self.with(slot, method);
        if let Some(last) = self.images.last_mut() {
            last.hole_before = hole;
        }
        self
    }

    /// Give the most recently added image `slack` reserved bytes
    pub fn slack(mut self, slack: u64) -> Self {
        if let Some(last) = self.images.last_mut() {
            last.slack = slack;
        }
        self
    }

    fn kind(&self) -> ImageKind {
        ImageKind {
            class: self.class,
            shadow: self.shadow,
            width: self.width,
        }
    }

    pub fn build(&self) -> Built {
        match self.width {
            FieldWidth::Bits32 => self.build_as::<Narrow>(),
            FieldWidth::Bits64 => self.build_as::<Wide>(),
        }
    }

    fn build_as<W: Width>(&self) -> Built {
        let slots = self.slots();
        let num_l1tab = slots.div_ceil(L2_ENTRIES as u64) as usize;
        let l1_end = 1024 + (num_l1tab * W::L1_ENTRY_SIZE) as u64;
        let l2_size = W::l2_table_size();

        let groups: BTreeSet<usize> = self
            .images
            .iter()
            .map(|i| (i.slot / L2_ENTRIES as u64) as usize)
            .collect();
        let mut l1 = vec![0u64; num_l1tab];
        let mut tables = BTreeMap::new();
        let mut pos = l1_end;
        let mut place_tables = |pos: &mut u64| {
            for &g in &groups {
                l1[g] = *pos;
                tables.insert(g, *pos);
                *pos += l2_size;
            }
        };
        if !self.tables_last {
            place_tables(&mut pos);
        }

        let mut l2: BTreeMap<usize, L2Table> = groups
            .iter()
            .map(|&g| (g, L2Table::null::<W>(self.shadow)))
            .collect();
        let mut placed = BTreeMap::new();
        let mut holes = Vec::new();
        let mut body = Vec::new();
        let mut imbed = 0u64;
        for image in &self.images {
            if image.hole_before > 0 {
                holes.push((pos, image.hole_before));
                body.push((pos, vec![FILL; image.hole_before as usize]));
                pos += image.hole_before;
            }
            let len = image.stored.len() as u64;
            let (g, j) = (
                (image.slot / L2_ENTRIES as u64) as usize,
                (image.slot % L2_ENTRIES as u64) as usize,
            );
            let size = len + image.slack;
            l2.get_mut(&g).expect("group table").entries[j] =
                L2Entry::new(pos, len as u16, size as u16);
            placed.insert(image.slot, (pos, len));
            let mut bytes = image.stored.clone();
            bytes.resize(size as usize, FILL);
            body.push((pos, bytes));
            imbed += image.slack;
            pos += size;
        }
        if self.tables_last {
            place_tables(&mut pos);
        }
        let size = pos;

        let free: u64 = holes.iter().map(|h| h.1).sum();
        let ledger = if holes.is_empty() { None } else { self.ledger };
        let free_off = match ledger {
            None => 0,
            Some(LedgerFormat::Chain) => holes[0].0,
            Some(LedgerFormat::Array) => size,
        };
        let totals = HeaderTotals {
            size,
            used: size - free - imbed,
            free_off,
            free_total: free + imbed,
            free_largest: holes.iter().map(|h| h.1).max().unwrap_or(0),
            free_num: if ledger.is_some() { holes.len() as u64 } else { 0 },
            free_imbed: imbed,
        };

        let mut bytes = vec![0u8; size as usize];
        let dev = DeviceHeader {
            kind: self.kind(),
            heads: self.heads,
            trksize: if self.class == DeviceClass::Fba { 512 } else { 56832 },
            devtype: self.devtype,
            fileseq: 0,
            highcyl: 0,
        };
        bytes[..512].copy_from_slice(&dev.to_bytes());

        let options = if self.endian == Endian::Big {
            self.options | OPT_BIGENDIAN
        } else {
            self.options & !OPT_BIGENDIAN
        };
        let mut hdr = CompressedHeader {
            vrm: W::VRM,
            options,
            num_l1tab: num_l1tab as u32,
            num_l2tab: L2_ENTRIES as u32,
            size: 0,
            used: 0,
            free_off: 0,
            free_total: 0,
            free_largest: 0,
            free_num: 0,
            free_imbed: 0,
            cyls: self.cyls,
            nullfmt: 0,
            compress: 1,
            compress_parm: 0xFFFF,
        };
        hdr.set_totals(&totals);
        hdr.encode::<W>(&mut bytes[512..1024], self.endian)
            .expect("header encodes");

        let l1_bytes = encode_l1::<W>(&l1, self.endian).expect("level-1 encodes");
        bytes[1024..l1_end as usize].copy_from_slice(&l1_bytes);
        for (g, table) in &l2 {
            let at = tables[g] as usize;
            let encoded = table.encode::<W>(self.endian).expect("level-2 encodes");
            bytes[at..at + encoded.len()].copy_from_slice(&encoded);
        }
        for (at, data) in body {
            bytes[at as usize..at as usize + data.len()].copy_from_slice(&data);
        }

        match ledger {
            Some(LedgerFormat::Chain) => {
                for (i, &(at, len)) in holes.iter().enumerate() {
                    let next = holes.get(i + 1).map_or(0, |h| h.0);
                    let at = at as usize;
                    W::put_off(self.endian, &mut bytes[at..], next).expect("fits");
                    W::put_off(self.endian, &mut bytes[at + W::OFFSET_BYTES..], len)
                        .expect("fits");
                }
            }
            Some(LedgerFormat::Array) => {
                bytes.extend_from_slice(FREE_BLK);
                for &(at, len) in &holes {
                    let mut rec = vec![0u8; W::FREE_RECORD_SIZE];
                    W::put_off(self.endian, &mut rec, at).expect("fits");
                    W::put_off(self.endian, &mut rec[W::OFFSET_BYTES..], len).expect("fits");
                    bytes.extend_from_slice(&rec);
                }
            }
            None => {}
        }

        Built {
            bytes,
            images: placed,
            tables,
            totals,
        }
    }
}

/// Mark every group without images as "allocated, empty" instead of absent
pub fn allocated_empty_l1<W: Width>(built: &mut Built, endian: Endian, num_l1tab: usize) {
    for g in 0..num_l1tab {
        if !built.tables.contains_key(&g) {
            let at = 1024 + g * W::L1_ENTRY_SIZE;
            W::put_off(endian, &mut built.bytes[at..], l1_empty::<W>()).expect("fits");
        }
    }
}

/// Decoded compressed header of an image in memory
pub fn header_of(bytes: &[u8], width: FieldWidth) -> CompressedHeader {
    let endian = if bytes[512 + 3] & OPT_BIGENDIAN != 0 {
        Endian::Big
    } else {
        Endian::Little
    };
    match width {
        FieldWidth::Bits32 => CompressedHeader::decode::<Narrow>(&bytes[512..1024], endian),
        FieldWidth::Bits64 => CompressedHeader::decode::<Wide>(&bytes[512..1024], endian),
    }
    .expect("header decodes")
}

/// Level-2 entry of `slot` in an image in memory
pub fn l2_entry_of(bytes: &[u8], width: FieldWidth, slot: u64) -> L2Entry {
    let hdr = header_of(bytes, width);
    let endian = hdr.endian();
    fn lookup<W: Width>(bytes: &[u8], endian: Endian, slot: u64) -> L2Entry {
        let g = (slot / L2_ENTRIES as u64) as usize;
        let j = (slot % L2_ENTRIES as u64) as usize;
        let l1 = W::get_off(endian, &bytes[1024 + g * W::L1_ENTRY_SIZE..]);
        if l1 == 0 || l1 == W::MAX {
            return L2Entry::ZERO;
        }
        let table =
            L2Table::decode::<W>(&bytes[l1 as usize..l1 as usize + W::l2_table_size() as usize], endian);
        table.entries[j]
    }
    match width {
        FieldWidth::Bits32 => lookup::<Narrow>(bytes, endian, slot),
        FieldWidth::Bits64 => lookup::<Wide>(bytes, endian, slot),
    }
}

/// Stored bytes of `slot` in an image in memory, if it has one
pub fn image_of(bytes: &[u8], width: FieldWidth, slot: u64) -> Option<Vec<u8>> {
    let e = l2_entry_of(bytes, width, slot);
    let max = match width {
        FieldWidth::Bits32 => Narrow::MAX,
        FieldWidth::Bits64 => Wide::MAX,
    };
    if e.pos == 0 || e.pos == max {
        return None;
    }
    let at = e.pos as usize;
    Some(bytes[at..at + e.len as usize].to_vec())
}

/// Overwrite the level-2 entry of `slot` in place
pub fn set_l2_entry(bytes: &mut [u8], width: FieldWidth, slot: u64, entry: L2Entry) {
    let hdr = header_of(bytes, width);
    let endian = hdr.endian();
    fn put<W: Width>(bytes: &mut [u8], endian: Endian, slot: u64, entry: L2Entry) {
        let g = (slot / L2_ENTRIES as u64) as usize;
        let j = (slot % L2_ENTRIES as u64) as usize;
        let l1 = W::get_off(endian, &bytes[1024 + g * W::L1_ENTRY_SIZE..]) as usize;
        let at = l1 + j * W::L2_ENTRY_SIZE;
        W::put_off(endian, &mut bytes[at..], entry.pos).expect("fits");
        endian.put_u16(&mut bytes[at + W::OFFSET_BYTES..], entry.len);
        endian.put_u16(&mut bytes[at + W::OFFSET_BYTES + 2..], entry.size);
    }
    match width {
        FieldWidth::Bits32 => put::<Narrow>(bytes, endian, slot, entry),
        FieldWidth::Bits64 => put::<Wide>(bytes, endian, slot, entry),
    }
}
