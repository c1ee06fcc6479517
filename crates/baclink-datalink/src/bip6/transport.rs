//! BACnet/IPv6 transport over UDP.
//!
//! Devices address each other by 3-byte virtual MAC; the link-local
//! multicast group `FF02::BAC0` stands in for the IPv4 subnet broadcast.
//! The transport answers Address-Resolution and Virtual-Address-Resolution
//! queries for its own VMAC and regenerates that VMAC when another endpoint
//! is observed using it.

use crate::address::{Vmac, BACNET_DEFAULT_PORT};
use crate::bip6::bvlc6::{
    Bvlc6Function, Bvlc6Header, ForwardedOrigin, BVLC6_ORIGIN_LEN, BVLC6_UNICAST_HEADER_LEN,
};
use crate::{DataLink, DataLinkAddress, DataLinkError, LinkAddress};
use baclink_core::encoding::{Reader, Writer};
use log::{debug, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Largest BVLC6 frame we will send or accept.
const MAX_BIP6_FRAME_LEN: usize = 1600;

/// The all-stations link-local multicast group.
pub const BIP6_MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xBAC0);

/// Construction-time configuration; not reloaded at runtime.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Bip6Config {
    pub port: u16,
    /// Fixed virtual MAC; `None` assigns a random one.
    pub vmac: Option<Vmac>,
    /// Interface index for the multicast join (0 = any).
    pub interface: u32,
    pub shared_socket: bool,
    pub max_payload: usize,
}

impl Default for Bip6Config {
    fn default() -> Self {
        Self {
            port: BACNET_DEFAULT_PORT,
            vmac: None,
            interface: 0,
            shared_socket: false,
            max_payload: MAX_BIP6_FRAME_LEN - BVLC6_UNICAST_HEADER_LEN,
        }
    }
}

/// Draw a fresh virtual MAC. Seeded from the clock and pid; a VMAC only has
/// to be unique within one multicast scope, and observed conflicts trigger
/// regeneration anyway.
pub(crate) fn random_vmac() -> Vmac {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut state = nanos ^ ((std::process::id() as u64) << 32);
    loop {
        // splitmix64 step
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        let octets = [(z >> 16) as u8, (z >> 8) as u8, z as u8];
        if octets != [0, 0, 0] && octets != [0xFF, 0xFF, 0xFF] {
            return Vmac(octets);
        }
    }
}

pub(crate) fn bind_udp6(config_port: u16, shared: bool) -> Result<UdpSocket, DataLinkError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    if shared {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr =
        SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, config_port, 0, 0).into();
    socket.bind(&bind_addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[derive(Debug)]
pub struct BacnetIp6Transport {
    socket: Arc<UdpSocket>,
    config: Bip6Config,
    // 3 VMAC octets packed into the low 24 bits; swapped on conflict.
    vmac: AtomicU32,
}

impl BacnetIp6Transport {
    pub fn bind(config: Bip6Config) -> Result<Self, DataLinkError> {
        let socket = bind_udp6(config.port, config.shared_socket)?;
        socket.join_multicast_v6(&BIP6_MULTICAST_GROUP, config.interface)?;
        let vmac = config.vmac.unwrap_or_else(random_vmac);
        debug!("BACnet/IPv6 transport on port {} as {vmac}", config.port);
        Ok(Self {
            socket: Arc::new(socket),
            config,
            vmac: AtomicU32::new(pack_vmac(vmac)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DataLinkError> {
        self.socket.local_addr().map_err(DataLinkError::Io)
    }

    pub fn vmac(&self) -> Vmac {
        unpack_vmac(self.vmac.load(Ordering::Relaxed))
    }

    fn multicast_endpoint(&self) -> SocketAddrV6 {
        SocketAddrV6::new(BIP6_MULTICAST_GROUP, self.config.port, 0, self.config.interface)
    }

    fn build_frame(
        &self,
        function: Bvlc6Function,
        destination: Option<Vmac>,
        payload: &[u8],
    ) -> Result<Vec<u8>, DataLinkError> {
        if payload.len() > self.config.max_payload {
            return Err(DataLinkError::FrameTooLarge);
        }
        let header = Bvlc6Header {
            function,
            length: 0,
            source: self.vmac(),
            destination,
        };
        let total_len = header.header_len() + payload.len();
        let header = Bvlc6Header {
            length: total_len as u16,
            ..header
        };
        let mut frame = vec![0u8; total_len];
        let mut w = Writer::new(&mut frame);
        header.encode(&mut w).map_err(|_| DataLinkError::InvalidFrame)?;
        w.write_all(payload)
            .map_err(|_| DataLinkError::FrameTooLarge)?;
        Ok(frame)
    }

    /// Multicast a Virtual-Address-Resolution probe so existing holders of
    /// our VMAC make themselves known.
    pub async fn announce(&self) -> Result<(), DataLinkError> {
        let frame = self.build_frame(Bvlc6Function::VirtualAddressResolution, None, &[])?;
        self.socket
            .send_to(&frame, SocketAddr::V6(self.multicast_endpoint()))
            .await?;
        Ok(())
    }

    /// Another endpoint is using our VMAC: pick a new one.
    fn regenerate_vmac(&self, peer: SocketAddrV6) {
        let fresh = random_vmac();
        warn!(
            "virtual MAC conflict with {peer}: replacing {} with {fresh}",
            self.vmac()
        );
        self.vmac.store(pack_vmac(fresh), Ordering::Relaxed);
    }

    async fn reply_vmac_ack(&self, function: Bvlc6Function, to: SocketAddrV6, dest: Vmac) {
        match self.build_frame(function, Some(dest), &[]) {
            Ok(frame) => {
                if let Err(err) = self.socket.send_to(&frame, SocketAddr::V6(to)).await {
                    warn!("address-resolution reply to {to} failed: {err}");
                }
            }
            Err(err) => warn!("address-resolution reply encode failed: {err}"),
        }
    }
}

fn pack_vmac(vmac: Vmac) -> u32 {
    let [a, b, c] = vmac.octets();
    u32::from_be_bytes([0, a, b, c])
}

fn unpack_vmac(packed: u32) -> Vmac {
    let [_, a, b, c] = packed.to_be_bytes();
    Vmac([a, b, c])
}

impl DataLink for BacnetIp6Transport {
    async fn send(&self, address: DataLinkAddress, payload: &[u8]) -> Result<(), DataLinkError> {
        let (endpoint, vmac) = match address.link {
            LinkAddress::Ipv6 { endpoint, vmac } => (endpoint, vmac),
            _ => return Err(DataLinkError::AddressFamily(address)),
        };
        let frame = if endpoint.ip().is_multicast() {
            self.build_frame(Bvlc6Function::OriginalBroadcastNpdu, None, payload)?
        } else {
            self.build_frame(Bvlc6Function::OriginalUnicastNpdu, Some(vmac), payload)?
        };
        self.socket.send_to(&frame, SocketAddr::V6(endpoint)).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, DataLinkAddress), DataLinkError> {
        let mut frame = [0u8; MAX_BIP6_FRAME_LEN];
        loop {
            let (n, src) = self.socket.recv_from(&mut frame).await?;
            let src_v6 = match src {
                SocketAddr::V6(v6) => v6,
                SocketAddr::V4(_) => continue,
            };

            let mut r = Reader::new(&frame[..n]);
            let hdr = match Bvlc6Header::decode(&mut r) {
                Ok(hdr) => hdr,
                Err(err) => {
                    warn!("dropping malformed BVLC6 datagram from {src_v6}: {err}");
                    continue;
                }
            };
            let payload = match r.read_exact(hdr.payload_len()) {
                Ok(payload) => payload,
                Err(_) => {
                    warn!("dropping truncated BVLC6 frame from {src_v6}");
                    continue;
                }
            };

            if hdr.source == self.vmac()
                && self.local_addr().map(|a| a != SocketAddr::V6(src_v6)).unwrap_or(false)
            {
                self.regenerate_vmac(src_v6);
                continue;
            }

            match hdr.function {
                Bvlc6Function::OriginalUnicastNpdu | Bvlc6Function::OriginalBroadcastNpdu => {
                    if payload.len() > buf.len() {
                        return Err(DataLinkError::FrameTooLarge);
                    }
                    buf[..payload.len()].copy_from_slice(payload);
                    return Ok((
                        payload.len(),
                        DataLinkAddress::ipv6(src_v6, hdr.source),
                    ));
                }
                Bvlc6Function::ForwardedNpdu => {
                    if payload.len() < BVLC6_ORIGIN_LEN {
                        warn!("dropping short Forwarded-NPDU from {src_v6}");
                        continue;
                    }
                    let mut or = Reader::new(payload);
                    let origin = match ForwardedOrigin::decode(&mut or) {
                        Ok(origin) => origin,
                        Err(_) => continue,
                    };
                    let npdu = &payload[BVLC6_ORIGIN_LEN..];
                    if npdu.len() > buf.len() {
                        return Err(DataLinkError::FrameTooLarge);
                    }
                    buf[..npdu.len()].copy_from_slice(npdu);
                    return Ok((
                        npdu.len(),
                        DataLinkAddress::ipv6(origin.endpoint(), hdr.source),
                    ));
                }
                Bvlc6Function::VirtualAddressResolution => {
                    self.reply_vmac_ack(
                        Bvlc6Function::VirtualAddressResolutionAck,
                        src_v6,
                        hdr.source,
                    )
                    .await;
                }
                Bvlc6Function::AddressResolution => {
                    // Payload names the VMAC being sought.
                    if payload.len() >= 3
                        && Vmac([payload[0], payload[1], payload[2]]) == self.vmac()
                    {
                        self.reply_vmac_ack(
                            Bvlc6Function::AddressResolutionAck,
                            src_v6,
                            hdr.source,
                        )
                        .await;
                    }
                }
                other => {
                    trace!(
                        "ignoring BVLC6 function 0x{:02x} from {src_v6}",
                        other.to_u8()
                    );
                }
            }
        }
    }

    fn broadcast_address(&self) -> DataLinkAddress {
        DataLinkAddress::ipv6(
            self.multicast_endpoint(),
            Vmac([0xFF, 0xFF, 0xFF]),
        )
    }
}
