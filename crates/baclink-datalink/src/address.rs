use core::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

/// The BACnet network number that addresses every network (global broadcast).
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

/// The UDP port BACnet/IP and BACnet/IPv6 devices listen on by default.
pub const BACNET_DEFAULT_PORT: u16 = 0xBAC0;

/// The MS/TP station address that addresses every station on the segment.
pub const MSTP_BROADCAST_STATION: u8 = 0xFF;

/// A 3-byte virtual MAC address, used by BACnet/IPv6 in place of a physical
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vmac(pub [u8; 3]);

impl Vmac {
    pub const fn octets(self) -> [u8; 3] {
        self.0
    }
}

impl fmt::Display for Vmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}:{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// The medium-specific part of a [`DataLinkAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkAddress {
    /// BACnet/IP endpoint.
    Ipv4(SocketAddrV4),
    /// BACnet/IPv6 endpoint with its virtual MAC.
    Ipv6 { endpoint: SocketAddrV6, vmac: Vmac },
    /// MS/TP station (0-254; 255 is broadcast).
    Mstp(u8),
    /// Point-to-point serial link; the medium has no addresses.
    Ptp,
    /// Raw Ethernet MAC.
    Ethernet([u8; 6]),
}

/// A data-link address, compared and hashed by value.
///
/// `network` distinguishes the local segment (`None`), a routed remote
/// network, and the global broadcast network
/// ([`GLOBAL_BROADCAST_NETWORK`]). Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataLinkAddress {
    pub link: LinkAddress,
    pub network: Option<u16>,
}

impl DataLinkAddress {
    pub const fn new(link: LinkAddress) -> Self {
        Self {
            link,
            network: None,
        }
    }

    pub const fn with_network(mut self, network: u16) -> Self {
        self.network = Some(network);
        self
    }

    pub const fn ipv4(addr: SocketAddrV4) -> Self {
        Self::new(LinkAddress::Ipv4(addr))
    }

    pub const fn ipv6(endpoint: SocketAddrV6, vmac: Vmac) -> Self {
        Self::new(LinkAddress::Ipv6 { endpoint, vmac })
    }

    pub const fn mstp(station: u8) -> Self {
        Self::new(LinkAddress::Mstp(station))
    }

    pub const fn ptp() -> Self {
        Self::new(LinkAddress::Ptp)
    }

    /// Subnet-local BACnet/IP broadcast.
    pub const fn ipv4_broadcast(port: u16) -> Self {
        Self::new(LinkAddress::Ipv4(SocketAddrV4::new(
            Ipv4Addr::BROADCAST,
            port,
        )))
    }

    /// The BACnet/IPv6 link-local multicast group.
    pub const fn ipv6_broadcast(port: u16) -> Self {
        Self::new(LinkAddress::Ipv6 {
            endpoint: SocketAddrV6::new(Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xBAC0), port, 0, 0),
            vmac: Vmac([0xFF, 0xFF, 0xFF]),
        })
    }

    pub const fn mstp_broadcast() -> Self {
        Self::new(LinkAddress::Mstp(MSTP_BROADCAST_STATION))
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.network == Some(GLOBAL_BROADCAST_NETWORK)
    }

    /// True if this address names every station on its local medium.
    pub fn is_local_broadcast(&self) -> bool {
        match self.link {
            LinkAddress::Ipv4(addr) => addr.ip().is_broadcast(),
            LinkAddress::Ipv6 { endpoint, .. } => endpoint.ip().is_multicast(),
            LinkAddress::Mstp(station) => station == MSTP_BROADCAST_STATION,
            LinkAddress::Ptp => false,
            LinkAddress::Ethernet(mac) => mac == [0xFF; 6],
        }
    }
}

impl fmt::Display for DataLinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.link {
            LinkAddress::Ipv4(addr) => write!(f, "{addr}")?,
            LinkAddress::Ipv6 { endpoint, vmac } => write!(f, "{endpoint}%{vmac}")?,
            LinkAddress::Mstp(station) => write!(f, "mstp:{station}")?,
            LinkAddress::Ptp => write!(f, "ptp")?,
            LinkAddress::Ethernet(mac) => write!(
                f,
                "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            )?,
        }
        if let Some(net) = self.network {
            write!(f, "@net{net}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DataLinkAddress, GLOBAL_BROADCAST_NETWORK};
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn compared_by_value_and_hashable() {
        let a = DataLinkAddress::ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 0xBAC0));
        let b = DataLinkAddress::ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 0xBAC0));
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_ne!(a, a.with_network(5));
    }

    #[test]
    fn broadcast_classification() {
        assert!(DataLinkAddress::mstp_broadcast().is_local_broadcast());
        assert!(!DataLinkAddress::mstp(12).is_local_broadcast());
        assert!(DataLinkAddress::ipv4_broadcast(0xBAC0).is_local_broadcast());
        assert!(DataLinkAddress::ipv6_broadcast(0xBAC0).is_local_broadcast());
        assert!(DataLinkAddress::mstp(0)
            .with_network(GLOBAL_BROADCAST_NETWORK)
            .is_global_broadcast());
    }
}
