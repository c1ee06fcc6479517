//! Fuzz the MS/TP frame extractor with arbitrary line noise.
//!
//! The extractor sits directly on RS-485 input and must resynchronize
//! from any byte sequence without panicking or stalling.

#![no_main]

use baclink_mstp::frame::FrameExtractor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut extractor = FrameExtractor::new();
    // Feed in two chunks so read-boundary handling is exercised too.
    let split = data.len() / 2;
    extractor.push_bytes(&data[..split]);
    loop {
        match extractor.next_frame() {
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => break,
        }
    }
    extractor.push_bytes(&data[split..]);
    loop {
        match extractor.next_frame() {
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => break,
        }
    }
});
