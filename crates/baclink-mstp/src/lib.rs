//! BACnet MS/TP data link layer.
//!
//! MS/TP (Master-Slave/Token-Passing, Clause 9) runs a token ring over
//! half-duplex RS-485: a station may only transmit data while it holds the
//! token, passes it to its successor when done, and periodically polls for
//! stations that joined since the ring formed. This crate provides the
//! frame codec with garbage resynchronization and the master state machine
//! behind a [`DataLink`](baclink_datalink::DataLink) transport.

pub mod frame;
pub mod node;
pub mod transport;

pub use frame::{Frame, FrameExtractor, FrameType, ObservedFrame, MAX_DATA_LEN};
pub use node::{MstpConfig, MstpStats, MAX_POLL, RETRY_TOKEN};
pub use transport::MstpTransport;
