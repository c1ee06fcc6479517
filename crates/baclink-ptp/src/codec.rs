//! PTP frame codec (Clause 10).
//!
//! Wire format: 2-byte preamble `0x05 0x64`, frame type, 2-byte big-endian
//! data length, header CRC-8, then if length > 0 the payload followed by a
//! CRC-16 (least-significant octet first). Everything after the preamble is
//! byte-stuffed so the XON/XOFF flow-control characters never appear
//! literally inside a frame.
//!
//! A fixed 7-byte ASCII greeting precedes normal framing when a connection
//! is established; the decoder recognizes it out of band.

use baclink_core::crc::{data_crc, data_crc_ok, header_crc, header_crc_ok};
use log::trace;
use thiserror::Error;

pub const PTP_PREAMBLE: [u8; 2] = [0x05, 0x64];

/// Greeting literal exchanged before normal framing on connect.
pub const PTP_GREETING: &[u8; 7] = b"BACnet\r";

/// Escape character for byte stuffing.
pub const DLE: u8 = 0x10;
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;

/// Largest payload a PTP data frame may carry.
pub const MAX_DATA_LEN: usize = 501;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtpFrameType {
    HeartbeatXon = 0x00,
    HeartbeatXoff = 0x01,
    Data0 = 0x02,
    Data1 = 0x03,
    Ack0Xon = 0x04,
    Ack1Xon = 0x05,
    Ack0Xoff = 0x06,
    Ack1Xoff = 0x07,
    Nak0Xon = 0x08,
    Nak1Xon = 0x09,
    Nak0Xoff = 0x0A,
    Nak1Xoff = 0x0B,
    ConnectRequest = 0x0C,
    ConnectResponse = 0x0D,
    DisconnectRequest = 0x0E,
    DisconnectResponse = 0x0F,
    TestRequest = 0x10,
    TestResponse = 0x11,
}

impl PtpFrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::HeartbeatXon,
            0x01 => Self::HeartbeatXoff,
            0x02 => Self::Data0,
            0x03 => Self::Data1,
            0x04 => Self::Ack0Xon,
            0x05 => Self::Ack1Xon,
            0x06 => Self::Ack0Xoff,
            0x07 => Self::Ack1Xoff,
            0x08 => Self::Nak0Xon,
            0x09 => Self::Nak1Xon,
            0x0A => Self::Nak0Xoff,
            0x0B => Self::Nak1Xoff,
            0x0C => Self::ConnectRequest,
            0x0D => Self::ConnectResponse,
            0x0E => Self::DisconnectRequest,
            0x0F => Self::DisconnectResponse,
            0x10 => Self::TestRequest,
            0x11 => Self::TestResponse,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Data frame carrying the given 1-bit sequence number.
    pub fn data(sequence: bool) -> Self {
        if sequence {
            Self::Data1
        } else {
            Self::Data0
        }
    }

    /// Ack for `sequence`, carrying the sender's flow-control state.
    pub fn ack(sequence: bool, xon: bool) -> Self {
        match (sequence, xon) {
            (false, true) => Self::Ack0Xon,
            (true, true) => Self::Ack1Xon,
            (false, false) => Self::Ack0Xoff,
            (true, false) => Self::Ack1Xoff,
        }
    }

    /// Nak for `sequence`, carrying the sender's flow-control state.
    pub fn nak(sequence: bool, xon: bool) -> Self {
        match (sequence, xon) {
            (false, true) => Self::Nak0Xon,
            (true, true) => Self::Nak1Xon,
            (false, false) => Self::Nak0Xoff,
            (true, false) => Self::Nak1Xoff,
        }
    }

    /// Sequence bit if this is a data frame.
    pub fn data_sequence(self) -> Option<bool> {
        match self {
            Self::Data0 => Some(false),
            Self::Data1 => Some(true),
            _ => None,
        }
    }

    /// `(sequence, xon)` if this is an ack frame.
    pub fn ack_bits(self) -> Option<(bool, bool)> {
        match self {
            Self::Ack0Xon => Some((false, true)),
            Self::Ack1Xon => Some((true, true)),
            Self::Ack0Xoff => Some((false, false)),
            Self::Ack1Xoff => Some((true, false)),
            _ => None,
        }
    }

    /// `(sequence, xon)` if this is a nak frame.
    pub fn nak_bits(self) -> Option<(bool, bool)> {
        match self {
            Self::Nak0Xon => Some((false, true)),
            Self::Nak1Xon => Some((true, true)),
            Self::Nak0Xoff => Some((false, false)),
            Self::Nak1Xoff => Some((true, false)),
            _ => None,
        }
    }

    /// Flow-control state if this is a heartbeat frame.
    pub fn heartbeat_xon(self) -> Option<bool> {
        match self {
            Self::HeartbeatXon => Some(true),
            Self::HeartbeatXoff => Some(false),
            _ => None,
        }
    }
}

/// A decoded PTP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpFrame {
    pub frame_type: PtpFrameType,
    pub data: Vec<u8>,
}

impl PtpFrame {
    pub fn control(frame_type: PtpFrameType) -> Self {
        Self {
            frame_type,
            data: Vec::new(),
        }
    }

    pub fn with_data(frame_type: PtpFrameType, data: Vec<u8>) -> Self {
        Self { frame_type, data }
    }

    /// Serialize for the wire, stuffing every octet after the preamble.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len() as u16;
        let header = [self.frame_type.to_u8(), (len >> 8) as u8, (len & 0xFF) as u8];

        let mut out = Vec::with_capacity(8 + self.data.len() * 2);
        out.extend_from_slice(&PTP_PREAMBLE);
        stuff_into(&mut out, &header);
        stuff_into(&mut out, &[header_crc(&header)]);
        if !self.data.is_empty() {
            stuff_into(&mut out, &self.data);
            stuff_into(&mut out, &data_crc(&self.data).to_le_bytes());
        }
        out
    }
}

/// Append `bytes` to `out`, escaping the reserved control characters.
fn stuff_into(out: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        if byte == DLE || byte == XON || byte == XOFF {
            out.push(DLE);
            out.push(byte | 0x80);
        } else {
            out.push(byte);
        }
    }
}

/// Destuff `needed` octets from `raw`. Returns the octets and the count of
/// raw bytes consumed, or `None` when `raw` runs out first (including a
/// dangling DLE at the end of the buffer, which waits for its partner).
fn destuff(raw: &[u8], needed: usize) -> Option<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(needed);
    let mut i = 0;
    while out.len() < needed {
        match raw.get(i)? {
            &DLE => {
                out.push(raw.get(i + 1)? & 0x7F);
                i += 2;
            }
            &byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    Some((out, i))
}

/// Something the decoder recognized on the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtpEvent {
    Greeting,
    Frame(PtpFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PtpDecodeError {
    #[error("header crc mismatch")]
    BadHeaderCrc,
    #[error("data crc mismatch")]
    BadDataCrc,
    #[error("frame length exceeds {}", MAX_DATA_LEN)]
    Oversized,
    #[error("unknown frame type 0x{0:02X}")]
    UnknownFrameType(u8),
}

/// Number of leading garbage bytes before the next plausible frame start.
///
/// A frame may start at a full preamble pair or anywhere the buffer tail is
/// a prefix of the greeting literal. A single `0x05` as the very last byte
/// is kept: its partner may arrive in the next read.
fn garbage_prefix(buf: &[u8]) -> usize {
    for (i, &byte) in buf.iter().enumerate() {
        match byte {
            0x05 => match buf.get(i + 1) {
                Some(&0x64) => return i,
                Some(_) => {}
                None => return i,
            },
            b'B' => {
                let rest = &buf[i..];
                let n = rest.len().min(PTP_GREETING.len());
                if rest[..n] == PTP_GREETING[..n] {
                    return i;
                }
            }
            _ => {}
        }
    }
    buf.len()
}

/// Incremental PTP stream decoder.
///
/// Raw serial bytes go in via [`push_bytes`](Self::push_bytes); complete
/// events come out of [`next_event`](Self::next_event). Stuffed escape
/// sequences and frames may span any number of reads. Decode errors consume
/// the offending bytes so the scan resynchronizes on the next call.
#[derive(Debug, Default)]
pub struct PtpDecoder {
    buf: Vec<u8>,
}

impl PtpDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True while the buffer holds the start of an incomplete frame. Used
    /// by the link engine to abort a frame after mid-frame silence.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn next_event(&mut self) -> Result<Option<PtpEvent>, PtpDecodeError> {
        loop {
            let skip = garbage_prefix(&self.buf);
            if skip > 0 {
                trace!("ptp: discarding {skip} garbage bytes");
                self.buf.drain(..skip);
            }
            if self.buf.is_empty() {
                return Ok(None);
            }

            if self.buf[0] == b'B' {
                // A greeting prefix; garbage_prefix verified every byte
                // present so far, so a short buffer just needs more data.
                if self.buf.len() < PTP_GREETING.len() {
                    return Ok(None);
                }
                self.buf.drain(..PTP_GREETING.len());
                return Ok(Some(PtpEvent::Greeting));
            }

            // At a preamble. A lone trailing 0x05 waits for its partner.
            if self.buf.len() < 2 {
                return Ok(None);
            }

            let Some((header, header_raw)) = destuff(&self.buf[2..], 4) else {
                return Ok(None);
            };
            if !header_crc_ok(&header[..3], header[3]) {
                self.buf.drain(..2);
                return Err(PtpDecodeError::BadHeaderCrc);
            }
            let Some(frame_type) = PtpFrameType::from_u8(header[0]) else {
                let value = header[0];
                self.buf.drain(..2);
                return Err(PtpDecodeError::UnknownFrameType(value));
            };
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            if len > MAX_DATA_LEN {
                self.buf.drain(..2);
                return Err(PtpDecodeError::Oversized);
            }

            if len == 0 {
                self.buf.drain(..2 + header_raw);
                return Ok(Some(PtpEvent::Frame(PtpFrame::control(frame_type))));
            }

            let Some((mut body, body_raw)) = destuff(&self.buf[2 + header_raw..], len + 2) else {
                return Ok(None);
            };
            let crc_hi = body.pop().unwrap_or_default();
            let crc_lo = body.pop().unwrap_or_default();
            let total = 2 + header_raw + body_raw;
            if !data_crc_ok(&body, crc_lo, crc_hi) {
                self.buf.drain(..total);
                return Err(PtpDecodeError::BadDataCrc);
            }
            self.buf.drain(..total);
            return Ok(Some(PtpEvent::Frame(PtpFrame::with_data(frame_type, body))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(bytes: &[u8]) -> Vec<Result<PtpEvent, PtpDecodeError>> {
        let mut decoder = PtpDecoder::new();
        decoder.push_bytes(bytes);
        let mut out = Vec::new();
        loop {
            match decoder.next_event() {
                Ok(Some(event)) => out.push(Ok(event)),
                Ok(None) => return out,
                Err(err) => out.push(Err(err)),
            }
        }
    }

    #[test]
    fn control_frame_byte_layout() {
        let wire = PtpFrame::control(PtpFrameType::HeartbeatXon).encode();
        assert_eq!(&wire[..2], &[0x05, 0x64]);
        assert_eq!(&wire[2..5], &[0x00, 0x00, 0x00]);
        assert_eq!(wire[5], header_crc(&[0x00, 0x00, 0x00]));
        assert_eq!(wire.len(), 6);
    }

    #[test]
    fn reserved_bytes_are_stuffed() {
        // TestRequest's frame-type octet is DLE itself; the payload holds
        // every reserved character.
        let frame = PtpFrame::with_data(PtpFrameType::TestRequest, vec![DLE, XON, XOFF, 0x42]);
        let wire = frame.encode();
        assert_eq!(&wire[2..4], &[DLE, DLE | 0x80]);
        for window in wire[2..].windows(1) {
            assert!(window[0] != XON && window[0] != XOFF);
        }
        assert_eq!(
            decode_all(&wire),
            vec![Ok(PtpEvent::Frame(frame))]
        );
    }

    #[test]
    fn greeting_is_recognized_out_of_band() {
        let mut bytes = PTP_GREETING.to_vec();
        bytes.extend_from_slice(&PtpFrame::control(PtpFrameType::ConnectRequest).encode());
        let events = decode_all(&bytes);
        assert_eq!(events[0], Ok(PtpEvent::Greeting));
        assert_eq!(
            events[1],
            Ok(PtpEvent::Frame(PtpFrame::control(PtpFrameType::ConnectRequest)))
        );
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let mut bytes = vec![0xDE, 0xAD, 0x05, 0x07, 0xBE];
        bytes.extend_from_slice(&PtpFrame::control(PtpFrameType::HeartbeatXon).encode());
        assert_eq!(
            decode_all(&bytes),
            vec![Ok(PtpEvent::Frame(PtpFrame::control(PtpFrameType::HeartbeatXon)))]
        );
    }

    #[test]
    fn trailing_lone_preamble_byte_is_kept() {
        let mut decoder = PtpDecoder::new();
        decoder.push_bytes(&[0xAA, 0xBB, 0x05]);
        assert_eq!(decoder.next_event(), Ok(None));
        // The 0x05 survived the garbage scan; its partner completes it.
        let wire = PtpFrame::control(PtpFrameType::HeartbeatXoff).encode();
        decoder.push_bytes(&wire[1..]);
        assert_eq!(
            decoder.next_event(),
            Ok(Some(PtpEvent::Frame(PtpFrame::control(
                PtpFrameType::HeartbeatXoff
            ))))
        );
    }

    #[test]
    fn greeting_prefix_survives_split_reads() {
        let mut decoder = PtpDecoder::new();
        decoder.push_bytes(&[0x99, b'B', b'A', b'C']);
        assert_eq!(decoder.next_event(), Ok(None));
        decoder.push_bytes(b"net\r");
        assert_eq!(decoder.next_event(), Ok(Some(PtpEvent::Greeting)));
    }

    #[test]
    fn escape_sequence_split_across_reads() {
        let frame = PtpFrame::with_data(PtpFrameType::Data0, vec![0x01, XOFF, 0x02]);
        let wire = frame.encode();
        // Split the stream right after a DLE escape byte.
        let dle_pos = wire.iter().rposition(|&b| b == DLE).unwrap();
        let mut decoder = PtpDecoder::new();
        decoder.push_bytes(&wire[..=dle_pos]);
        assert_eq!(decoder.next_event(), Ok(None));
        decoder.push_bytes(&wire[dle_pos + 1..]);
        assert_eq!(decoder.next_event(), Ok(Some(PtpEvent::Frame(frame))));
    }

    #[test]
    fn header_crc_failure_resyncs() {
        let mut wire = PtpFrame::control(PtpFrameType::HeartbeatXon).encode();
        wire[5] ^= 0x01;
        wire.extend_from_slice(&PtpFrame::control(PtpFrameType::HeartbeatXon).encode());
        let events = decode_all(&wire);
        assert_eq!(events[0], Err(PtpDecodeError::BadHeaderCrc));
        assert_eq!(
            events[1],
            Ok(PtpEvent::Frame(PtpFrame::control(PtpFrameType::HeartbeatXon)))
        );
    }

    #[test]
    fn data_crc_failure_consumes_frame() {
        let frame = PtpFrame::with_data(PtpFrameType::Data1, vec![1, 2, 3]);
        let mut wire = frame.encode();
        let last = wire.len() - 1;
        wire[last] ^= 0x40;
        wire.extend_from_slice(&PtpFrame::control(PtpFrameType::Ack0Xon).encode());
        let events = decode_all(&wire);
        assert_eq!(events[0], Err(PtpDecodeError::BadDataCrc));
        assert_eq!(
            events[1],
            Ok(PtpEvent::Frame(PtpFrame::control(PtpFrameType::Ack0Xon)))
        );
    }

    proptest! {
        #[test]
        fn frames_roundtrip(
            type_byte in 0u8..=0x11,
            data in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let frame_type = PtpFrameType::from_u8(type_byte).unwrap();
            let frame = PtpFrame::with_data(frame_type, data);
            let events = decode_all(&frame.encode());
            prop_assert_eq!(events, vec![Ok(PtpEvent::Frame(frame))]);
        }

        #[test]
        fn frames_roundtrip_under_any_read_split(
            data in proptest::collection::vec(any::<u8>(), 0..64),
            split in 0usize..256,
        ) {
            let frame = PtpFrame::with_data(PtpFrameType::Data0, data);
            let wire = frame.encode();
            let split = split % wire.len().max(1);
            let mut decoder = PtpDecoder::new();
            decoder.push_bytes(&wire[..split]);
            let mut events = Vec::new();
            while let Ok(Some(event)) = decoder.next_event() {
                events.push(event);
            }
            decoder.push_bytes(&wire[split..]);
            while let Ok(Some(event)) = decoder.next_event() {
                events.push(event);
            }
            prop_assert_eq!(events, vec![PtpEvent::Frame(frame)]);
        }
    }
}
