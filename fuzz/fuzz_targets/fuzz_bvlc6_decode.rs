//! Fuzz the BVLC6 header and forwarded-origin decoders, and check that
//! anything that decodes re-encodes to the same bytes.

#![no_main]

use baclink_core::encoding::{Reader, Writer};
use baclink_datalink::bip6::bvlc6::{Bvlc6Header, ForwardedOrigin};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut r = Reader::new(data);
    if let Ok(header) = Bvlc6Header::decode(&mut r) {
        let consumed = r.position();
        let mut buf = vec![0u8; consumed];
        let mut w = Writer::new(&mut buf);
        header.encode(&mut w).expect("decoded header re-encodes");
        assert_eq!(&buf[..], &data[..consumed]);
    }

    let mut r = Reader::new(data);
    if let Ok(origin) = ForwardedOrigin::decode(&mut r) {
        let consumed = r.position();
        let mut buf = vec![0u8; consumed];
        let mut w = Writer::new(&mut buf);
        origin.encode(&mut w).expect("decoded origin re-encodes");
        assert_eq!(&buf[..], &data[..consumed]);
    }
});
