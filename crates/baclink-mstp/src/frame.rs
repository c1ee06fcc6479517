//! MS/TP frame codec.
//!
//! Wire format (Clause 9): preamble `0x55 0xFF`, frame type, destination,
//! source, 2-byte big-endian data length, header CRC-8, then for non-empty
//! frames the data followed by a CRC-16 transmitted LSB first. The decoder
//! works on a byte stream: noise before a preamble is discarded, and any
//! malformed header or failed CRC resynchronizes to the next preamble
//! instead of failing the stream.

use baclink_core::crc::{data_crc, data_crc_ok, header_crc, header_crc_ok};
use thiserror::Error;

pub const PREAMBLE: [u8; 2] = [0x55, 0xFF];

/// Preamble + type + dest + src + 2-byte length + header CRC.
pub const HEADER_LEN: usize = 8;

/// Largest data field a frame may carry.
pub const MAX_DATA_LEN: usize = 501;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Token,
    PollForMaster,
    ReplyToPollForMaster,
    TestRequest,
    TestResponse,
    DataExpectingReply,
    DataNotExpectingReply,
    ReplyPostponed,
}

impl FrameType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Token),
            1 => Some(Self::PollForMaster),
            2 => Some(Self::ReplyToPollForMaster),
            3 => Some(Self::TestRequest),
            4 => Some(Self::TestResponse),
            5 => Some(Self::DataExpectingReply),
            6 => Some(Self::DataNotExpectingReply),
            7 => Some(Self::ReplyPostponed),
            _ => None,
        }
    }

    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Token => 0,
            Self::PollForMaster => 1,
            Self::ReplyToPollForMaster => 2,
            Self::TestRequest => 3,
            Self::TestResponse => 4,
            Self::DataExpectingReply => 5,
            Self::DataNotExpectingReply => 6,
            Self::ReplyPostponed => 7,
        }
    }

    /// True for the frame types whose sender then waits in WaitForReply.
    pub const fn expects_reply(self) -> bool {
        matches!(self, Self::DataExpectingReply | Self::TestRequest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub destination: u8,
    pub source: u8,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn control(frame_type: FrameType, destination: u8, source: u8) -> Self {
        Self {
            frame_type,
            destination,
            source,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.data.len() <= MAX_DATA_LEN);
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() + 2);
        out.extend_from_slice(&PREAMBLE);
        out.push(self.frame_type.to_u8());
        out.push(self.destination);
        out.push(self.source);
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.push(header_crc(&out[2..7]));
        if !self.data.is_empty() {
            out.extend_from_slice(&self.data);
            let crc = data_crc(&self.data);
            // LSB first on the wire
            out.push(crc as u8);
            out.push((crc >> 8) as u8);
        }
        out
    }
}

/// A decoded header for passive observation, delivered for every valid
/// frame whether or not its payload is addressed to this station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedFrame {
    pub frame_type: FrameType,
    pub destination: u8,
    pub source: u8,
    pub data_len: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("header CRC mismatch")]
    BadHeaderCrc,
    #[error("data CRC mismatch")]
    BadDataCrc,
    #[error("data length exceeds {}", MAX_DATA_LEN)]
    Oversized,
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
}

/// Incremental frame extractor over a raw byte stream.
///
/// `next_frame` returns `Ok(Some(..))` per complete valid frame,
/// `Ok(None)` when more bytes are needed, and `Err(..)` once per malformed
/// frame after resynchronizing past it; callers keep calling to drain the
/// buffer.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buf: Vec<u8>,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, ExtractError> {
        // Scan to the next preamble, keeping a trailing 0x55 that may be
        // the start of one.
        match self
            .buf
            .windows(2)
            .position(|w| w == PREAMBLE)
        {
            Some(pos) => {
                self.buf.drain(..pos);
            }
            None => {
                let keep = if self.buf.last() == Some(&PREAMBLE[0]) {
                    1
                } else {
                    0
                };
                self.buf.drain(..self.buf.len() - keep);
                return Ok(None);
            }
        }

        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        if !header_crc_ok(&self.buf[2..7], self.buf[7]) {
            self.buf.drain(..2);
            return Err(ExtractError::BadHeaderCrc);
        }

        let type_octet = self.buf[2];
        let destination = self.buf[3];
        let source = self.buf[4];
        let data_len = u16::from_be_bytes([self.buf[5], self.buf[6]]) as usize;

        let frame_type = match FrameType::from_u8(type_octet) {
            Some(frame_type) => frame_type,
            None => {
                self.buf.drain(..2);
                return Err(ExtractError::UnknownFrameType(type_octet));
            }
        };
        if data_len > MAX_DATA_LEN {
            self.buf.drain(..2);
            return Err(ExtractError::Oversized);
        }

        let total_len = if data_len > 0 {
            HEADER_LEN + data_len + 2
        } else {
            HEADER_LEN
        };
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let data = if data_len > 0 {
            let data = &self.buf[HEADER_LEN..HEADER_LEN + data_len];
            let crc_lo = self.buf[HEADER_LEN + data_len];
            let crc_hi = self.buf[HEADER_LEN + data_len + 1];
            if !data_crc_ok(data, crc_lo, crc_hi) {
                self.buf.drain(..total_len);
                return Err(ExtractError::BadDataCrc);
            }
            data.to_vec()
        } else {
            Vec::new()
        };

        self.buf.drain(..total_len);
        Ok(Some(Frame {
            frame_type,
            destination,
            source,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{ExtractError, Frame, FrameExtractor, FrameType};
    use baclink_core::crc::header_crc;
    use proptest::prelude::*;

    #[test]
    fn token_frame_byte_layout() {
        let encoded = Frame::control(FrameType::Token, 5, 3).encode();
        let crc = header_crc(&[0x00, 0x05, 0x03, 0x00, 0x00]);
        assert_eq!(encoded, vec![0x55, 0xFF, 0x00, 0x05, 0x03, 0x00, 0x00, crc]);
    }

    #[test]
    fn data_frame_roundtrip() {
        let frame = Frame {
            frame_type: FrameType::DataNotExpectingReply,
            destination: 0xFF,
            source: 7,
            data: vec![0x01, 0x20, 0xFF, 0x00],
        };
        let mut ex = FrameExtractor::new();
        ex.push_bytes(&frame.encode());
        assert_eq!(ex.next_frame().unwrap(), Some(frame));
        assert_eq!(ex.next_frame().unwrap(), None);
    }

    #[test]
    fn noise_prefix_is_discarded() {
        let frame = Frame::control(FrameType::Token, 2, 1);
        let mut stream = vec![0x00, 0x13, 0x55, 0x42, 0xAB];
        stream.extend_from_slice(&frame.encode());
        let mut ex = FrameExtractor::new();
        ex.push_bytes(&stream);
        assert_eq!(ex.next_frame().unwrap(), Some(frame));
    }

    #[test]
    fn header_crc_error_resyncs_to_following_frame() {
        let good = Frame::control(FrameType::Token, 2, 1);
        let mut corrupted = good.encode();
        corrupted[3] ^= 0x01; // flip destination, CRC now wrong
        let mut stream = corrupted;
        stream.extend_from_slice(&good.encode());

        let mut ex = FrameExtractor::new();
        ex.push_bytes(&stream);
        assert_eq!(ex.next_frame().unwrap_err(), ExtractError::BadHeaderCrc);
        assert_eq!(ex.next_frame().unwrap(), Some(good));
    }

    #[test]
    fn data_crc_error_consumes_whole_frame() {
        let frame = Frame {
            frame_type: FrameType::DataNotExpectingReply,
            destination: 4,
            source: 9,
            data: vec![1, 2, 3],
        };
        let mut encoded = frame.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let follow = Frame::control(FrameType::Token, 4, 9);
        encoded.extend_from_slice(&follow.encode());

        let mut ex = FrameExtractor::new();
        ex.push_bytes(&encoded);
        assert_eq!(ex.next_frame().unwrap_err(), ExtractError::BadDataCrc);
        assert_eq!(ex.next_frame().unwrap(), Some(follow));
    }

    #[test]
    fn frame_split_across_reads() {
        let frame = Frame {
            frame_type: FrameType::DataExpectingReply,
            destination: 1,
            source: 2,
            data: vec![0xAA; 32],
        };
        let encoded = frame.encode();
        let mut ex = FrameExtractor::new();
        for chunk in encoded.chunks(5) {
            ex.push_bytes(chunk);
        }
        assert_eq!(ex.next_frame().unwrap(), Some(frame));
    }

    #[test]
    fn trailing_preamble_byte_is_kept() {
        let mut ex = FrameExtractor::new();
        ex.push_bytes(&[0x01, 0x02, 0x55]);
        assert_eq!(ex.next_frame().unwrap(), None);
        // The dangling 0x55 must still pair with a following 0xFF.
        let frame = Frame::control(FrameType::Token, 8, 3);
        ex.push_bytes(&frame.encode()[1..]);
        assert_eq!(ex.next_frame().unwrap(), Some(frame));
    }

    proptest! {
        #[test]
        fn roundtrip_any_frame(
            type_octet in 0u8..=7,
            destination: u8,
            source: u8,
            data in proptest::collection::vec(any::<u8>(), 0..=501),
        ) {
            let frame = Frame {
                frame_type: FrameType::from_u8(type_octet).unwrap(),
                destination,
                source,
                data,
            };
            let mut ex = FrameExtractor::new();
            ex.push_bytes(&frame.encode());
            prop_assert_eq!(ex.next_frame().unwrap(), Some(frame));
        }

        #[test]
        fn recovers_after_noise_prefix(
            // Noise free of 0x55 so it cannot fake a preamble.
            noise in proptest::collection::vec(0u8..0x50, 0..64),
            destination: u8,
            source: u8,
        ) {
            let frame = Frame::control(FrameType::PollForMaster, destination, source);
            let mut ex = FrameExtractor::new();
            ex.push_bytes(&noise);
            ex.push_bytes(&frame.encode());
            prop_assert_eq!(ex.next_frame().unwrap(), Some(frame));
        }
    }
}
