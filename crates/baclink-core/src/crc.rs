//! CRC algorithms shared by the MS/TP and PTP frame formats.
//!
//! Header CRC-8 uses polynomial X^8 + X^7 + 1 (ASHRAE 135 Annex G.1, the
//! parallel formulation, not a table CRC). Data CRC-16 uses the reflected
//! CCITT polynomial 0x8408 (Annex G.2). Both run with an all-ones preset and
//! are complemented before transmission.

/// Accumulate one octet into the running header CRC register.
///
/// Start with `0xFF`, feed the five header octets, complement the result for
/// the wire. Feeding the transmitted CRC octet back in leaves `0x55` in the
/// register, which is how received headers are checked.
pub const fn header_crc_accumulate(crc: u8, byte: u8) -> u8 {
    let mut temp = (crc ^ byte) as u16;
    temp = temp
        ^ (temp << 1)
        ^ (temp << 2)
        ^ (temp << 3)
        ^ (temp << 4)
        ^ (temp << 5)
        ^ (temp << 6)
        ^ (temp << 7);
    ((temp & 0xFE) ^ ((temp >> 8) & 1)) as u8
}

/// Header CRC-8 of a frame header, complemented for transmission.
pub fn header_crc(header: &[u8]) -> u8 {
    let mut crc = 0xFFu8;
    for &byte in header {
        crc = header_crc_accumulate(crc, byte);
    }
    !crc
}

/// True if `header` followed by `crc_octet` validates.
pub fn header_crc_ok(header: &[u8], crc_octet: u8) -> bool {
    let mut crc = 0xFFu8;
    for &byte in header {
        crc = header_crc_accumulate(crc, byte);
    }
    header_crc_accumulate(crc, crc_octet) == 0x55
}

/// Data CRC-16 of a payload, complemented for transmission. Goes on the wire
/// least-significant octet first.
pub fn data_crc(data: &[u8]) -> u16 {
    !data_crc_raw(data)
}

fn data_crc_raw(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= byte as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
    }
    crc
}

/// True if `data` followed by its two wire-order CRC octets validates.
///
/// Accumulating the transmitted CRC octets leaves the residue `0xF0B8` in
/// the register.
pub fn data_crc_ok(data: &[u8], crc_lo: u8, crc_hi: u8) -> bool {
    let mut crc = 0xFFFFu16;
    for &byte in data.iter().chain([crc_lo, crc_hi].iter()) {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc == 0xF0B8
}

#[cfg(test)]
mod tests {
    use super::{data_crc, data_crc_ok, header_crc, header_crc_accumulate, header_crc_ok};
    use proptest::prelude::*;

    #[test]
    fn header_residue_is_55() {
        let header = [0x00, 0x05, 0x03, 0x00, 0x00];
        let crc = header_crc(&header);
        let mut reg = 0xFFu8;
        for &b in &header {
            reg = header_crc_accumulate(reg, b);
        }
        assert_eq!(header_crc_accumulate(reg, crc), 0x55);
        assert!(header_crc_ok(&header, crc));
        assert!(!header_crc_ok(&header, crc ^ 0x01));
    }

    #[test]
    fn data_crc_known_answer() {
        // CRC-16/X-25 check value.
        assert_eq!(data_crc(b"123456789"), 0x906E);
    }

    #[test]
    fn data_residue_validates() {
        let payload = [0x01, 0x20, 0xFF, 0x00, 0x10, 0x08];
        let crc = data_crc(&payload);
        let [lo, hi] = crc.to_le_bytes();
        assert!(data_crc_ok(&payload, lo, hi));
        assert!(!data_crc_ok(&payload, lo ^ 0x80, hi));
    }

    proptest! {
        #[test]
        fn header_crc_roundtrips(header in proptest::array::uniform5(any::<u8>())) {
            let crc = header_crc(&header);
            prop_assert!(header_crc_ok(&header, crc));
        }

        #[test]
        fn data_crc_roundtrips(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let crc = data_crc(&data);
            let [lo, hi] = crc.to_le_bytes();
            prop_assert!(data_crc_ok(&data, lo, hi));
        }

        #[test]
        fn corrupted_payload_fails(data in proptest::collection::vec(any::<u8>(), 1..128), flip in 0usize..128) {
            let crc = data_crc(&data);
            let [lo, hi] = crc.to_le_bytes();
            let mut corrupted = data.clone();
            let idx = flip % corrupted.len();
            corrupted[idx] ^= 0x01;
            prop_assert!(!data_crc_ok(&corrupted, lo, hi));
        }
    }
}
