//! BACnet/IPv6 broadcast management device (BBMD).
//!
//! Broadcasts do not cross IP subnets, so devices on a routed segment
//! register with a BBMD as foreign devices. The engine re-encapsulates
//! every broadcast it sees as Forwarded-NPDU and relays it to all
//! registered foreign devices (never back to the origin), all statically
//! configured peer BBMDs, and optionally the local multicast group.
//!
//! The foreign-device table is the one piece of state shared between the
//! receive path and administrative callers; every read-modify-write,
//! including the expire-then-iterate pass, runs under its single mutex.
//! Relay sends are dispatched onto separate tasks so a slow socket never
//! stalls the receive loop. This listens on an unauthenticated UDP surface:
//! malformed input is dropped with a warning, never a panic.

use crate::address::{Vmac, BACNET_DEFAULT_PORT};
use crate::bip6::bvlc6::{
    Bvlc6Function, Bvlc6Header, ForwardedOrigin, BVLC6_HEADER_LEN, BVLC6_ORIGIN_LEN,
};
use crate::bip6::transport::{bind_udp6, random_vmac, BIP6_MULTICAST_GROUP};
use crate::DataLinkError;
use baclink_core::encoding::{Reader, Writer};
use log::{debug, trace, warn};
use std::net::{SocketAddr, SocketAddrV6};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

const MAX_BIP6_FRAME_LEN: usize = 1600;

/// Grace added on top of the registered TTL before an entry expires.
pub const FD_GRACE_PERIOD: Duration = Duration::from_secs(30);

pub const RESULT_SUCCESS: u16 = 0x0000;
pub const RESULT_REGISTER_NAK: u16 = 0x0030;
pub const RESULT_DELETE_NAK: u16 = 0x0050;
pub const RESULT_DISTRIBUTE_NAK: u16 = 0x0060;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Bbmd6Config {
    pub port: u16,
    /// Fixed virtual MAC; `None` assigns a random one.
    pub vmac: Option<Vmac>,
    /// Interface index for the multicast join (0 = any).
    pub interface: u32,
    /// Statically configured peer BBMDs; never expire.
    pub peers: Vec<SocketAddrV6>,
    /// Also relay forwarded broadcasts onto the local multicast group.
    pub relay_to_multicast: bool,
    pub shared_socket: bool,
}

impl Default for Bbmd6Config {
    fn default() -> Self {
        Self {
            port: BACNET_DEFAULT_PORT,
            vmac: None,
            interface: 0,
            peers: Vec::new(),
            relay_to_multicast: false,
            shared_socket: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FdEntry {
    endpoint: SocketAddrV6,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct Bbmd6 {
    socket: Arc<UdpSocket>,
    config: Bbmd6Config,
    vmac: Vmac,
    fdt: Mutex<Vec<FdEntry>>,
}

impl Bbmd6 {
    pub fn bind(config: Bbmd6Config) -> Result<Self, DataLinkError> {
        let socket = bind_udp6(config.port, config.shared_socket)?;
        socket.join_multicast_v6(&BIP6_MULTICAST_GROUP, config.interface)?;
        let vmac = config.vmac.unwrap_or_else(random_vmac);
        debug!(
            "BBMD on port {} as {vmac}, {} peer(s)",
            config.port,
            config.peers.len()
        );
        Ok(Self {
            socket: Arc::new(socket),
            config,
            vmac,
            fdt: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DataLinkError> {
        self.socket.local_addr().map_err(DataLinkError::Io)
    }

    pub fn vmac(&self) -> Vmac {
        self.vmac
    }

    /// Endpoints currently registered, after dropping expired entries.
    pub fn active_foreign_devices(&self) -> Vec<SocketAddrV6> {
        let now = Instant::now();
        let mut fdt = self.fdt.lock().unwrap_or_else(|e| e.into_inner());
        fdt.retain(|entry| entry.expires_at > now);
        fdt.iter().map(|entry| entry.endpoint).collect()
    }

    /// Receive and dispatch datagrams forever.
    pub async fn run(&self) -> Result<(), DataLinkError> {
        let mut frame = [0u8; MAX_BIP6_FRAME_LEN];
        loop {
            let (n, src) = self.socket.recv_from(&mut frame).await?;
            let src_v6 = match src {
                SocketAddr::V6(v6) => v6,
                SocketAddr::V4(_) => continue,
            };
            self.handle_datagram(&frame[..n], src_v6);
        }
    }

    fn handle_datagram(&self, datagram: &[u8], src: SocketAddrV6) {
        let mut r = Reader::new(datagram);
        let hdr = match Bvlc6Header::decode(&mut r) {
            Ok(hdr) => hdr,
            Err(err) => {
                warn!("dropping malformed BVLC6 datagram from {src}: {err}");
                return;
            }
        };
        let payload = match r.read_exact(hdr.payload_len()) {
            Ok(payload) => payload,
            Err(_) => {
                warn!("dropping truncated BVLC6 frame from {src}");
                return;
            }
        };

        match hdr.function {
            Bvlc6Function::RegisterForeignDevice => self.handle_register(src, payload),
            Bvlc6Function::DeleteForeignDeviceTableEntry => self.handle_delete(src, payload),
            Bvlc6Function::DistributeBroadcastToNetwork => {
                self.handle_distribute(src, hdr.source, payload)
            }
            Bvlc6Function::OriginalBroadcastNpdu => {
                // A broadcast seen on the multicast group: relay it to
                // everyone who cannot see that group.
                self.relay(src, hdr.source, payload, false);
            }
            Bvlc6Function::ForwardedNpdu => self.handle_forwarded(src, hdr.source, payload),
            Bvlc6Function::VirtualAddressResolution => {
                self.send_ack(Bvlc6Function::VirtualAddressResolutionAck, src, hdr.source);
            }
            other => {
                trace!("BBMD ignoring BVLC6 function 0x{:02x} from {src}", other.to_u8());
            }
        }
    }

    fn handle_register(&self, src: SocketAddrV6, payload: &[u8]) {
        if payload.len() < 2 {
            warn!("malformed foreign-device registration from {src}");
            self.send_result(src, RESULT_REGISTER_NAK);
            return;
        }
        let ttl = Duration::from_secs(u16::from_be_bytes([payload[0], payload[1]]) as u64);
        let expires_at = Instant::now() + ttl + FD_GRACE_PERIOD;
        {
            let mut fdt = self.fdt.lock().unwrap_or_else(|e| e.into_inner());
            match fdt.iter_mut().find(|entry| entry.endpoint == src) {
                Some(entry) => entry.expires_at = expires_at,
                None => fdt.push(FdEntry {
                    endpoint: src,
                    expires_at,
                }),
            }
        }
        debug!("foreign device {src} registered for {}s", ttl.as_secs());
        self.send_result(src, RESULT_SUCCESS);
    }

    fn handle_delete(&self, src: SocketAddrV6, payload: &[u8]) {
        let mut r = Reader::new(payload);
        let target = match ForwardedOrigin::decode(&mut r) {
            Ok(origin) => origin.endpoint(),
            Err(_) => {
                warn!("malformed foreign-device delete from {src}");
                self.send_result(src, RESULT_DELETE_NAK);
                return;
            }
        };
        let removed = {
            let mut fdt = self.fdt.lock().unwrap_or_else(|e| e.into_inner());
            let before = fdt.len();
            fdt.retain(|entry| entry.endpoint != target);
            fdt.len() != before
        };
        if removed {
            debug!("foreign device {target} deleted by {src}");
            self.send_result(src, RESULT_SUCCESS);
        } else {
            self.send_result(src, RESULT_DELETE_NAK);
        }
    }

    fn handle_distribute(&self, src: SocketAddrV6, src_vmac: Vmac, npdu: &[u8]) {
        let registered = {
            let now = Instant::now();
            let mut fdt = self.fdt.lock().unwrap_or_else(|e| e.into_inner());
            fdt.retain(|entry| entry.expires_at > now);
            fdt.iter().any(|entry| entry.endpoint == src)
        };
        if !registered {
            warn!("distribute-broadcast from unregistered {src}");
            self.send_result(src, RESULT_DISTRIBUTE_NAK);
            return;
        }
        self.relay(src, src_vmac, npdu, self.config.relay_to_multicast);
    }

    fn handle_forwarded(&self, src: SocketAddrV6, src_vmac: Vmac, payload: &[u8]) {
        // Already re-encapsulated by a peer BBMD: deliver to our foreign
        // devices (and optionally the local group), but never back to the
        // peers, or two BBMDs would bounce it forever.
        if payload.len() < BVLC6_ORIGIN_LEN {
            warn!("dropping short Forwarded-NPDU from {src}");
            return;
        }
        let mut r = Reader::new(payload);
        let origin = match ForwardedOrigin::decode(&mut r) {
            Ok(origin) => origin,
            Err(_) => return,
        };
        let npdu = &payload[BVLC6_ORIGIN_LEN..];
        let frame = match self.build_forwarded(src_vmac, origin, npdu) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Forwarded-NPDU re-encode failed: {err}");
                return;
            }
        };

        let origin_ep = origin.endpoint();
        for fd in self.active_foreign_devices() {
            if fd != origin_ep && fd != src {
                self.spawn_send(frame.clone(), fd);
            }
        }
        if self.config.relay_to_multicast {
            self.spawn_send(frame, self.multicast_endpoint());
        }
    }

    /// Relay a broadcast as Forwarded-NPDU to everyone except its origin.
    fn relay(&self, origin: SocketAddrV6, origin_vmac: Vmac, npdu: &[u8], to_multicast: bool) {
        let frame = match self.build_forwarded(
            origin_vmac,
            ForwardedOrigin::from_endpoint(origin),
            npdu,
        ) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Forwarded-NPDU encode failed: {err}");
                return;
            }
        };

        for fd in self.active_foreign_devices() {
            if fd != origin {
                self.spawn_send(frame.clone(), fd);
            }
        }
        for peer in &self.config.peers {
            if *peer != origin {
                self.spawn_send(frame.clone(), *peer);
            }
        }
        if to_multicast {
            self.spawn_send(frame, self.multicast_endpoint());
        }
    }

    fn build_forwarded(
        &self,
        origin_vmac: Vmac,
        origin: ForwardedOrigin,
        npdu: &[u8],
    ) -> Result<Vec<u8>, DataLinkError> {
        let total_len = BVLC6_HEADER_LEN + BVLC6_ORIGIN_LEN + npdu.len();
        if total_len > MAX_BIP6_FRAME_LEN {
            return Err(DataLinkError::FrameTooLarge);
        }
        let mut frame = vec![0u8; total_len];
        let mut w = Writer::new(&mut frame);
        Bvlc6Header {
            function: Bvlc6Function::ForwardedNpdu,
            length: total_len as u16,
            source: origin_vmac,
            destination: None,
        }
        .encode(&mut w)
        .map_err(|_| DataLinkError::InvalidFrame)?;
        origin
            .encode(&mut w)
            .map_err(|_| DataLinkError::InvalidFrame)?;
        w.write_all(npdu).map_err(|_| DataLinkError::FrameTooLarge)?;
        Ok(frame)
    }

    fn multicast_endpoint(&self) -> SocketAddrV6 {
        SocketAddrV6::new(
            BIP6_MULTICAST_GROUP,
            self.config.port,
            0,
            self.config.interface,
        )
    }

    fn send_result(&self, to: SocketAddrV6, code: u16) {
        let mut frame = vec![0u8; BVLC6_HEADER_LEN + 2];
        let mut w = Writer::new(&mut frame);
        let encoded = Bvlc6Header {
            function: Bvlc6Function::Result,
            length: (BVLC6_HEADER_LEN + 2) as u16,
            source: self.vmac,
            destination: None,
        }
        .encode(&mut w)
        .and_then(|_| w.write_be_u16(code));
        if encoded.is_ok() {
            self.spawn_send(frame, to);
        }
    }

    fn send_ack(&self, function: Bvlc6Function, to: SocketAddrV6, dest: Vmac) {
        let mut frame = vec![0u8; BVLC6_HEADER_LEN + 3];
        let mut w = Writer::new(&mut frame);
        let encoded = Bvlc6Header {
            function,
            length: (BVLC6_HEADER_LEN + 3) as u16,
            source: self.vmac,
            destination: Some(dest),
        }
        .encode(&mut w);
        if encoded.is_ok() {
            self.spawn_send(frame, to);
        }
    }

    // Relay fan-out must not block the receive loop on socket latency.
    fn spawn_send(&self, frame: Vec<u8>, to: SocketAddrV6) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&frame, SocketAddr::V6(to)).await {
                warn!("BBMD relay to {to} failed: {err}");
            }
        });
    }
}
