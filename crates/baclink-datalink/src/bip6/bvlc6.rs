//! BVLC framing for BACnet/IPv6 (Annex U).
//!
//! Unlike Annex J, IPv6 frames carry 3-byte virtual MACs in the header:
//! every frame names its source VMAC (7-byte header), and the unicast forms
//! add a destination VMAC (10-byte header). Forwarded-NPDU additionally
//! carries the original sender's full IPv6 endpoint so relayed broadcasts
//! keep their provenance.

use crate::address::Vmac;
use baclink_core::encoding::{Reader, Writer};
use baclink_core::{DecodeError, EncodeError};
use std::net::{Ipv6Addr, SocketAddrV6};

pub const BVLC_TYPE_BIP6: u8 = 0x82;

/// Header length without a destination VMAC.
pub const BVLC6_HEADER_LEN: usize = 7;

/// Header length of the unicast forms (destination VMAC present).
pub const BVLC6_UNICAST_HEADER_LEN: usize = 10;

/// Original-source block appended by Forwarded-NPDU: 16-byte address plus
/// 2-byte port.
pub const BVLC6_ORIGIN_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bvlc6Function {
    Result,
    OriginalUnicastNpdu,
    OriginalBroadcastNpdu,
    AddressResolution,
    ForwardedAddressResolution,
    AddressResolutionAck,
    VirtualAddressResolution,
    VirtualAddressResolutionAck,
    ForwardedNpdu,
    RegisterForeignDevice,
    DeleteForeignDeviceTableEntry,
    SecureBvll,
    DistributeBroadcastToNetwork,
    Unknown(u8),
}

impl Bvlc6Function {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Result,
            0x01 => Self::OriginalUnicastNpdu,
            0x02 => Self::OriginalBroadcastNpdu,
            0x03 => Self::AddressResolution,
            0x04 => Self::ForwardedAddressResolution,
            0x05 => Self::AddressResolutionAck,
            0x06 => Self::VirtualAddressResolution,
            0x07 => Self::VirtualAddressResolutionAck,
            0x08 => Self::ForwardedNpdu,
            0x09 => Self::RegisterForeignDevice,
            0x0A => Self::DeleteForeignDeviceTableEntry,
            0x0B => Self::SecureBvll,
            0x0C => Self::DistributeBroadcastToNetwork,
            v => Self::Unknown(v),
        }
    }

    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Result => 0x00,
            Self::OriginalUnicastNpdu => 0x01,
            Self::OriginalBroadcastNpdu => 0x02,
            Self::AddressResolution => 0x03,
            Self::ForwardedAddressResolution => 0x04,
            Self::AddressResolutionAck => 0x05,
            Self::VirtualAddressResolution => 0x06,
            Self::VirtualAddressResolutionAck => 0x07,
            Self::ForwardedNpdu => 0x08,
            Self::RegisterForeignDevice => 0x09,
            Self::DeleteForeignDeviceTableEntry => 0x0A,
            Self::SecureBvll => 0x0B,
            Self::DistributeBroadcastToNetwork => 0x0C,
            Self::Unknown(v) => v,
        }
    }

    /// Unicast forms carry a destination VMAC after the source VMAC.
    pub const fn has_destination_vmac(self) -> bool {
        matches!(
            self,
            Self::OriginalUnicastNpdu
                | Self::AddressResolutionAck
                | Self::VirtualAddressResolutionAck
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bvlc6Header {
    pub function: Bvlc6Function,
    /// Total frame length including the header.
    pub length: u16,
    pub source: Vmac,
    /// Present exactly when [`Bvlc6Function::has_destination_vmac`] holds.
    pub destination: Option<Vmac>,
}

impl Bvlc6Header {
    pub fn header_len(&self) -> usize {
        if self.destination.is_some() {
            BVLC6_UNICAST_HEADER_LEN
        } else {
            BVLC6_HEADER_LEN
        }
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - self.header_len()
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.destination.is_some() != self.function.has_destination_vmac() {
            return Err(EncodeError::ValueOutOfRange);
        }
        w.write_u8(BVLC_TYPE_BIP6)?;
        w.write_u8(self.function.to_u8())?;
        w.write_be_u16(self.length)?;
        w.write_all(&self.source.octets())?;
        if let Some(dest) = self.destination {
            w.write_all(&dest.octets())?;
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        if r.read_u8()? != BVLC_TYPE_BIP6 {
            return Err(DecodeError::InvalidValue);
        }
        let function = Bvlc6Function::from_u8(r.read_u8()?);
        let length = r.read_be_u16()?;
        let source = Vmac(read_vmac(r)?);
        let destination = if function.has_destination_vmac() {
            Some(Vmac(read_vmac(r)?))
        } else {
            None
        };
        let header = Self {
            function,
            length,
            source,
            destination,
        };
        if (length as usize) < header.header_len() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(header)
    }
}

fn read_vmac(r: &mut Reader<'_>) -> Result<[u8; 3], DecodeError> {
    let bytes = r.read_exact(3)?;
    Ok([bytes[0], bytes[1], bytes[2]])
}

/// The original-sender endpoint embedded in a Forwarded-NPDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedOrigin {
    pub address: Ipv6Addr,
    pub port: u16,
}

impl ForwardedOrigin {
    pub fn from_endpoint(endpoint: SocketAddrV6) -> Self {
        Self {
            address: *endpoint.ip(),
            port: endpoint.port(),
        }
    }

    pub fn endpoint(&self) -> SocketAddrV6 {
        SocketAddrV6::new(self.address, self.port, 0, 0)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_all(&self.address.octets())?;
        w.write_be_u16(self.port)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let octets = r.read_exact(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(octets);
        let port = r.read_be_u16()?;
        Ok(Self {
            address: Ipv6Addr::from(raw),
            port,
        })
    }
}
