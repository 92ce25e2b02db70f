#![no_main]
use cckd::{compact, CompactOptions};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    if data.len() < 1024 {
        return;
    }
    let mut cursor = Cursor::new(data.to_vec());
    let _ = compact(&mut cursor, &CompactOptions::default());
});
