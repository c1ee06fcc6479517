//! Fuzz the PTP stream decoder: stuffed escapes, greeting detection, and
//! the garbage scan must hold up against arbitrary split input.

#![no_main]

use baclink_ptp::codec::PtpDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = PtpDecoder::new();
    // Byte-at-a-time feed stresses every partial-frame path.
    for &byte in data {
        decoder.push_bytes(&[byte]);
        loop {
            match decoder.next_event() {
                Ok(Some(_)) | Err(_) => {}
                Ok(None) => break,
            }
        }
    }
});
