//! Shared primitives for the baclink data-link crates.
//!
//! `baclink-core` carries only what every transport needs: bounds-checked
//! zero-copy encoding, the MS/TP-family CRC algorithms, and the error kinds
//! the codecs speak. It is deliberately free of any application-layer
//! (APDU/NPDU) knowledge.
//!
//! # Feature flags
//!
//! - **`std`** (default) — enables `std::error::Error` implementations.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

/// CRC-8 and CRC-16 as used by the MS/TP and PTP frame formats.
pub mod crc;
/// Bounds-checked zero-copy reader/writer.
pub mod encoding;
/// Error types for encoding and decoding operations.
pub mod error;

pub use error::{DecodeError, EncodeError};
