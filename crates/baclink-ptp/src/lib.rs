//! BACnet PTP data link layer.
//!
//! PTP (Point-To-Point, Clause 10) runs a framed, flow-controlled protocol
//! over a dedicated serial line between exactly two stations. Frames are
//! byte-stuffed so XON/XOFF never appear literally, data frames carry a
//! 1-bit sequence number acknowledged by the peer, and heartbeats keep an
//! idle link verifiably alive. This crate provides the frame codec and the
//! connection engine behind a [`DataLink`](baclink_datalink::DataLink)
//! transport.

pub mod codec;
pub mod link;
pub mod transport;

pub use codec::{PtpDecoder, PtpEvent, PtpFrame, PtpFrameType, MAX_DATA_LEN, PTP_GREETING};
pub use link::{
    DisconnectReason, PtpConfig, PtpRole, PtpStats, RECONNECT_BACKOFF, T_ACK_TIMEOUT,
    T_FRAME_ABORT, T_HEARTBEAT,
};
pub use transport::PtpTransport;
