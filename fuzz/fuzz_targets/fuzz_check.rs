#![no_main]
use arbitrary::Arbitrary;
use cckd::{check, CheckOptions};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

#[derive(Arbitrary, Debug)]
struct Input {
    level: i8,
    image: Vec<u8>,
}

// Arbitrary bytes must produce a report or an error, never a panic
fuzz_target!(|input: Input| {
    let level = (input.level as i32).rem_euclid(6) - 1;
    let mut cursor = Cursor::new(input.image);
    let _ = check(&mut cursor, &CheckOptions::new().with_level(level));
});
