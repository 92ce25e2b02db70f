//! Byte-order conversion of whole images

mod common;

use cckd::{
    check, compact, swap_endian, CheckOptions, CompactOptions, CompressionMethod, Endian,
    FieldWidth, LedgerFormat,
};
use common::{header_of, image_of, ImageSpec};
use std::io::Cursor;

fn swapped(bytes: &[u8]) -> (Endian, Vec<u8>) {
    let mut cursor = Cursor::new(bytes.to_vec());
    let endian = swap_endian(&mut cursor).unwrap();
    (endian, cursor.into_inner())
}

#[test]
fn test_swapping_twice_restores_the_file() {
    let specs = [
        ImageSpec::ckd(FieldWidth::Bits32, 2)
            .ledger(LedgerFormat::Chain)
            .with(0, CompressionMethod::Zlib)
            .with_hole(64, 4, CompressionMethod::None)
            .with_hole(48, 11, CompressionMethod::Zlib),
        ImageSpec::fba(FieldWidth::Bits64, 4)
            .with(0, CompressionMethod::Zlib)
            .with_hole(128, 3, CompressionMethod::Zlib),
        ImageSpec::ckd(FieldWidth::Bits64, 2)
            .shadow()
            .with_hole(32, 6, CompressionMethod::Zlib),
    ];
    for spec in specs {
        let built = spec.build();
        let (other, once) = swapped(&built.bytes);
        assert_eq!(other, Endian::host().swapped());
        assert_ne!(once, built.bytes);
        assert_eq!(header_of(&once, spec.width).endian(), other);
        assert_eq!(header_of(&once, spec.width).totals(), built.totals);

        let (back, twice) = swapped(&once);
        assert_eq!(back, Endian::host());
        assert_eq!(twice, built.bytes);
    }
}

#[test]
fn test_swapped_file_checks_clean() {
    let width = FieldWidth::Bits32;
    let built = ImageSpec::ckd(width, 2)
        .with(1, CompressionMethod::Zlib)
        .with_hole(64, 5, CompressionMethod::None)
        .build();
    let (_, other) = swapped(&built.bytes);

    let mut cursor = Cursor::new(other);
    let report = check(&mut cursor, &CheckOptions::new().with_level(3)).unwrap();
    assert!(report.swapped);
    assert_eq!(report.code(), 0);
    assert_eq!(cursor.into_inner(), built.bytes);
}

#[test]
fn test_compaction_converts_the_byte_order_first() {
    let width = FieldWidth::Bits64;
    let built = ImageSpec::ckd(width, 2)
        .endian(Endian::host().swapped())
        .with_hole(80, 2, CompressionMethod::Zlib)
        .with(3, CompressionMethod::None)
        .build();

    let mut cursor = Cursor::new(built.bytes.clone());
    let report = compact(&mut cursor, &CompactOptions::default()).unwrap();
    assert!(report.swapped);
    let after = cursor.into_inner();
    assert_eq!(header_of(&after, width).endian(), Endian::host());
    assert_eq!(header_of(&after, width).totals().free_num, 0);
    for slot in [2, 3] {
        assert_eq!(image_of(&after, width, slot), image_of(&built.bytes, width, slot));
    }
}
