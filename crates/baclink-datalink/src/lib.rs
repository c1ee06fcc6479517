//! BACnet data-link transports and traits.
//!
//! This crate carries the pieces every BACnet transport shares — the
//! [`DataLinkAddress`] union, the [`DataLink`] trait, and the serial channel
//! abstraction — plus the two IP transports: BACnet/IP over UDP (BVLC) and
//! BACnet/IPv6 (BVLC6) with its broadcast-management-device (BBMD) engine.
//! The serial link layers (MS/TP, PTP) live in their own crates on top of
//! [`serial::SerialLink`].

#![allow(async_fn_in_trait)]

pub mod address;
pub mod bip;
pub mod bip6;
pub mod capture;
pub mod serial;
pub mod traits;

pub use address::{DataLinkAddress, LinkAddress, Vmac};
pub use bip::transport::{BacnetIpTransport, BipConfig};
pub use bip6::bbmd::{Bbmd6, Bbmd6Config};
pub use bip6::transport::{BacnetIp6Transport, Bip6Config};
pub use capture::CapturingDataLink;
#[cfg(unix)]
pub use serial::PipeSerial;
pub use serial::{MemorySerial, PhysicalSerial, SerialError, SerialLink};
pub use traits::{DataLink, DataLinkError};
