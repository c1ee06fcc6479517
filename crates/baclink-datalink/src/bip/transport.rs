//! BACnet/IP transport over UDP.
//!
//! Plain devices exchange Original-Unicast-NPDU / Original-Broadcast-NPDU
//! frames. A device behind a router without broadcast reach can instead
//! register as a foreign device with a BBMD and send
//! Distribute-Broadcast-To-Network; the foreign-device admin surface
//! (register, FDT/BDT read, FDT delete) is exposed here as client calls.

use crate::bip::bvlc::{BvlcFunction, BvlcHeader, BVLC_HEADER_LEN};
use crate::{DataLink, DataLinkAddress, DataLinkError, LinkAddress};
use baclink_core::encoding::{Reader, Writer};
use log::warn;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};

/// Largest BVLC frame we will send or accept (header + NPDU).
const MAX_BIP_FRAME_LEN: usize = 1600;

const BBMD_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Construction-time configuration; not reloaded at runtime.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BipConfig {
    /// UDP port to bind (0xBAC0 by convention).
    pub port: u16,
    /// Share the port with other processes (SO_REUSEADDR/SO_REUSEPORT)
    /// instead of claiming it exclusively.
    pub shared_socket: bool,
    /// Largest NPDU accepted from callers.
    pub max_payload: usize,
}

impl Default for BipConfig {
    fn default() -> Self {
        Self {
            port: crate::address::BACNET_DEFAULT_PORT,
            shared_socket: false,
            max_payload: MAX_BIP_FRAME_LEN - BVLC_HEADER_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastDistributionEntry {
    pub address: SocketAddrV4,
    pub mask: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignDeviceTableEntry {
    pub address: SocketAddrV4,
    pub ttl_seconds: u16,
    pub remaining_seconds: u16,
}

#[derive(Debug, Clone)]
pub struct BacnetIpTransport {
    socket: Arc<UdpSocket>,
    config: BipConfig,
    bbmd: Option<SocketAddrV4>,
    // Serializes foreign-device admin request/reply exchanges so two
    // concurrent commands cannot interleave their replies.
    bbmd_command_lock: Arc<Mutex<()>>,
}

fn bind_udp(config: &BipConfig) -> Result<UdpSocket, DataLinkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if config.shared_socket {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into();
    socket.bind(&bind_addr.into())?;
    let socket = UdpSocket::from_std(socket.into())?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

impl BacnetIpTransport {
    pub fn bind(config: BipConfig) -> Result<Self, DataLinkError> {
        Ok(Self {
            socket: Arc::new(bind_udp(&config)?),
            config,
            bbmd: None,
            bbmd_command_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Bind as a foreign device that reaches broadcasts through `bbmd`.
    pub fn bind_foreign(config: BipConfig, bbmd: SocketAddrV4) -> Result<Self, DataLinkError> {
        Ok(Self {
            socket: Arc::new(bind_udp(&config)?),
            config,
            bbmd: Some(bbmd),
            bbmd_command_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DataLinkError> {
        self.socket.local_addr().map_err(DataLinkError::Io)
    }

    pub fn bbmd_addr(&self) -> Option<SocketAddrV4> {
        self.bbmd
    }

    fn build_frame(&self, function: BvlcFunction, payload: &[u8]) -> Result<Vec<u8>, DataLinkError> {
        if payload.len() > self.config.max_payload {
            return Err(DataLinkError::FrameTooLarge);
        }
        let total_len = BVLC_HEADER_LEN + payload.len();
        let mut frame = vec![0u8; total_len];
        let mut w = Writer::new(&mut frame);
        BvlcHeader {
            function,
            length: total_len as u16,
        }
        .encode(&mut w)
        .map_err(|_| DataLinkError::InvalidFrame)?;
        w.write_all(payload)
            .map_err(|_| DataLinkError::FrameTooLarge)?;
        Ok(frame)
    }

    fn parse_bvlc_result(payload: &[u8]) -> Result<(), DataLinkError> {
        if payload.len() < 2 {
            return Err(DataLinkError::InvalidFrame);
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        if code == 0 {
            Ok(())
        } else {
            Err(DataLinkError::BvlcResult(code))
        }
    }

    async fn send_bvlc_to_bbmd(
        &self,
        function: BvlcFunction,
        payload: &[u8],
    ) -> Result<(), DataLinkError> {
        let bbmd = self.bbmd.ok_or(DataLinkError::BbmdNotConfigured)?;
        let frame = self.build_frame(function, payload)?;
        self.socket.send_to(&frame, SocketAddr::V4(bbmd)).await?;
        Ok(())
    }

    async fn recv_bvlc_reply(&self, expected: BvlcFunction) -> Result<Vec<u8>, DataLinkError> {
        let bbmd = self.bbmd.ok_or(DataLinkError::BbmdNotConfigured)?;
        let deadline = Instant::now() + BBMD_REPLY_TIMEOUT;
        let mut rx = [0u8; MAX_BIP_FRAME_LEN];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DataLinkError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "bbmd response timeout",
                )));
            }

            let (n, src) = timeout(remaining, self.socket.recv_from(&mut rx))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "bbmd response timeout"))?
                .map_err(DataLinkError::Io)?;
            if src != SocketAddr::V4(bbmd) {
                continue;
            }

            let mut r = Reader::new(&rx[..n]);
            let hdr = BvlcHeader::decode(&mut r).map_err(|_| DataLinkError::InvalidFrame)?;
            let payload = r
                .read_exact(hdr.payload_len())
                .map_err(|_| DataLinkError::InvalidFrame)?;

            if hdr.function == expected {
                return Ok(payload.to_vec());
            }
            if hdr.function == BvlcFunction::Result {
                Self::parse_bvlc_result(payload)?;
                if expected == BvlcFunction::Result {
                    return Ok(payload.to_vec());
                }
                return Err(DataLinkError::InvalidFrame);
            }
        }
    }

    /// Register with the configured BBMD without waiting for its Result.
    pub async fn register_foreign_device_no_wait(
        &self,
        ttl_seconds: u16,
    ) -> Result<(), DataLinkError> {
        let _guard = self.bbmd_command_lock.lock().await;
        self.send_bvlc_to_bbmd(BvlcFunction::RegisterForeignDevice, &ttl_seconds.to_be_bytes())
            .await
    }

    /// Register with the configured BBMD and wait for a positive Result.
    pub async fn register_foreign_device(&self, ttl_seconds: u16) -> Result<(), DataLinkError> {
        let _guard = self.bbmd_command_lock.lock().await;
        self.send_bvlc_to_bbmd(BvlcFunction::RegisterForeignDevice, &ttl_seconds.to_be_bytes())
            .await?;
        let payload = self.recv_bvlc_reply(BvlcFunction::Result).await?;
        Self::parse_bvlc_result(&payload)
    }

    pub async fn read_broadcast_distribution_table(
        &self,
    ) -> Result<Vec<BroadcastDistributionEntry>, DataLinkError> {
        let _guard = self.bbmd_command_lock.lock().await;
        self.send_bvlc_to_bbmd(BvlcFunction::ReadBroadcastDistributionTable, &[])
            .await?;
        let payload = self
            .recv_bvlc_reply(BvlcFunction::ReadBroadcastDistributionTableAck)
            .await?;
        if payload.len() % 10 != 0 {
            return Err(DataLinkError::InvalidFrame);
        }
        Ok(payload
            .chunks_exact(10)
            .map(|chunk| BroadcastDistributionEntry {
                address: SocketAddrV4::new(
                    Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                    u16::from_be_bytes([chunk[4], chunk[5]]),
                ),
                mask: Ipv4Addr::new(chunk[6], chunk[7], chunk[8], chunk[9]),
            })
            .collect())
    }

    pub async fn write_broadcast_distribution_table(
        &self,
        entries: &[BroadcastDistributionEntry],
    ) -> Result<(), DataLinkError> {
        let _guard = self.bbmd_command_lock.lock().await;
        let mut payload = Vec::with_capacity(entries.len() * 10);
        for entry in entries {
            payload.extend_from_slice(&entry.address.ip().octets());
            payload.extend_from_slice(&entry.address.port().to_be_bytes());
            payload.extend_from_slice(&entry.mask.octets());
        }
        self.send_bvlc_to_bbmd(BvlcFunction::WriteBroadcastDistributionTable, &payload)
            .await?;
        let payload = self.recv_bvlc_reply(BvlcFunction::Result).await?;
        Self::parse_bvlc_result(&payload)
    }

    pub async fn read_foreign_device_table(
        &self,
    ) -> Result<Vec<ForeignDeviceTableEntry>, DataLinkError> {
        let _guard = self.bbmd_command_lock.lock().await;
        self.send_bvlc_to_bbmd(BvlcFunction::ReadForeignDeviceTable, &[])
            .await?;
        let payload = self
            .recv_bvlc_reply(BvlcFunction::ReadForeignDeviceTableAck)
            .await?;
        if payload.len() % 10 != 0 {
            return Err(DataLinkError::InvalidFrame);
        }
        Ok(payload
            .chunks_exact(10)
            .map(|chunk| ForeignDeviceTableEntry {
                address: SocketAddrV4::new(
                    Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                    u16::from_be_bytes([chunk[4], chunk[5]]),
                ),
                ttl_seconds: u16::from_be_bytes([chunk[6], chunk[7]]),
                remaining_seconds: u16::from_be_bytes([chunk[8], chunk[9]]),
            })
            .collect())
    }

    pub async fn delete_foreign_device_table_entry(
        &self,
        address: SocketAddrV4,
    ) -> Result<(), DataLinkError> {
        let _guard = self.bbmd_command_lock.lock().await;
        let mut payload = [0u8; 6];
        payload[..4].copy_from_slice(&address.ip().octets());
        payload[4..].copy_from_slice(&address.port().to_be_bytes());
        self.send_bvlc_to_bbmd(BvlcFunction::DeleteForeignDeviceTableEntry, &payload)
            .await?;
        let payload = self.recv_bvlc_reply(BvlcFunction::Result).await?;
        Self::parse_bvlc_result(&payload)
    }

    fn target_v4(address: &DataLinkAddress) -> Result<SocketAddrV4, DataLinkError> {
        match address.link {
            LinkAddress::Ipv4(addr) => Ok(addr),
            _ => Err(DataLinkError::AddressFamily(*address)),
        }
    }
}

impl DataLink for BacnetIpTransport {
    async fn send(&self, address: DataLinkAddress, payload: &[u8]) -> Result<(), DataLinkError> {
        let addr = Self::target_v4(&address)?;
        let (function, target) = if addr.ip().is_broadcast() {
            match self.bbmd {
                // Foreign devices reach broadcasts through their BBMD.
                Some(bbmd) => (BvlcFunction::DistributeBroadcastToNetwork, bbmd),
                None => (BvlcFunction::OriginalBroadcastNpdu, addr),
            }
        } else {
            (BvlcFunction::OriginalUnicastNpdu, addr)
        };

        let frame = self.build_frame(function, payload)?;
        self.socket.send_to(&frame, SocketAddr::V4(target)).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, DataLinkAddress), DataLinkError> {
        let mut frame = [0u8; MAX_BIP_FRAME_LEN];
        loop {
            let (n, src) = self.socket.recv_from(&mut frame).await?;
            let src_v4 = match src {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => continue,
            };

            let mut r = Reader::new(&frame[..n]);
            let hdr = match BvlcHeader::decode(&mut r) {
                Ok(hdr) => hdr,
                Err(err) => {
                    warn!("dropping malformed BVLC datagram from {src_v4}: {err}");
                    continue;
                }
            };

            let payload = match r.read_exact(hdr.payload_len()) {
                Ok(payload) => payload,
                Err(_) => {
                    warn!("dropping truncated BVLC frame from {src_v4}");
                    continue;
                }
            };

            match hdr.function {
                BvlcFunction::OriginalUnicastNpdu
                | BvlcFunction::OriginalBroadcastNpdu
                | BvlcFunction::DistributeBroadcastToNetwork => {
                    if payload.len() > buf.len() {
                        return Err(DataLinkError::FrameTooLarge);
                    }
                    buf[..payload.len()].copy_from_slice(payload);
                    return Ok((payload.len(), DataLinkAddress::ipv4(src_v4)));
                }
                BvlcFunction::ForwardedNpdu => {
                    // 6-byte original-source block, then the NPDU.
                    if payload.len() < 6 {
                        warn!("dropping short Forwarded-NPDU from {src_v4}");
                        continue;
                    }
                    let origin = SocketAddrV4::new(
                        Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]),
                        u16::from_be_bytes([payload[4], payload[5]]),
                    );
                    let npdu = &payload[6..];
                    if npdu.len() > buf.len() {
                        return Err(DataLinkError::FrameTooLarge);
                    }
                    buf[..npdu.len()].copy_from_slice(npdu);
                    return Ok((npdu.len(), DataLinkAddress::ipv4(origin)));
                }
                other => {
                    log::trace!(
                        "ignoring BVLC function 0x{:02x} from {src_v4}",
                        other.to_u8()
                    );
                }
            }
        }
    }

    fn broadcast_address(&self) -> DataLinkAddress {
        DataLinkAddress::ipv4_broadcast(self.config.port)
    }
}

#[cfg(test)]
mod tests {
    use super::{BacnetIpTransport, BipConfig, BroadcastDistributionEntry, ForeignDeviceTableEntry};
    use crate::bip::bvlc::{BvlcFunction, BvlcHeader, BVLC_TYPE_BIP};
    use crate::{DataLink, DataLinkAddress};
    use baclink_core::encoding::{Reader, Writer};
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use tokio::net::UdpSocket;
    use tokio::time::{timeout, Duration};

    fn test_config() -> BipConfig {
        BipConfig {
            port: 0,
            ..BipConfig::default()
        }
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => panic!("expected v4"),
        }
    }

    async fn loopback_peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn unicast_send_wraps_original_unicast() {
        let transport = BacnetIpTransport::bind(test_config()).unwrap();
        let peer = loopback_peer().await;
        let dest = v4(peer.local_addr().unwrap());

        transport
            .send(DataLinkAddress::ipv4(dest), &[0x01, 0x02, 0x03])
            .await
            .unwrap();

        let mut rx = [0u8; 64];
        let (n, _) = peer.recv_from(&mut rx).await.unwrap();
        assert_eq!(&rx[..n], &[0x81, 0x0A, 0x00, 0x07, 0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn recv_unwraps_forwarded_npdu_origin() {
        let transport = BacnetIpTransport::bind(test_config()).unwrap();
        let target = transport.local_addr().unwrap();
        let sender = loopback_peer().await;

        let mut frame = [0u8; 64];
        let mut w = Writer::new(&mut frame);
        BvlcHeader {
            function: BvlcFunction::ForwardedNpdu,
            length: 4 + 6 + 3,
        }
        .encode(&mut w)
        .unwrap();
        w.write_all(&[10, 1, 2, 3]).unwrap();
        w.write_be_u16(0xBAC0).unwrap();
        w.write_all(&[1, 2, 3]).unwrap();
        sender.send_to(w.as_written(), target).await.unwrap();

        let mut out = [0u8; 16];
        let (n, src) = transport.recv(&mut out).await.unwrap();
        assert_eq!(&out[..n], &[1, 2, 3]);
        assert_eq!(
            src,
            DataLinkAddress::ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 0xBAC0))
        );
    }

    #[tokio::test]
    async fn recv_skips_garbage_and_unknown_functions() {
        let transport = BacnetIpTransport::bind(test_config()).unwrap();
        let target = transport.local_addr().unwrap();
        let sender = loopback_peer().await;

        // Garbage, then an unknown function, then a real frame.
        sender.send_to(&[0xDE, 0xAD], target).await.unwrap();
        sender
            .send_to(&[BVLC_TYPE_BIP, 0x99, 0x00, 0x04], target)
            .await
            .unwrap();
        sender
            .send_to(&[BVLC_TYPE_BIP, 0x0A, 0x00, 0x05, 0x42], target)
            .await
            .unwrap();

        let mut out = [0u8; 16];
        let (n, _) = timeout(Duration::from_secs(2), transport.recv(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&out[..n], &[0x42]);
    }

    #[tokio::test]
    async fn broadcast_uses_distribute_when_foreign() {
        let bbmd = loopback_peer().await;
        let bbmd_addr = v4(bbmd.local_addr().unwrap());
        let transport = BacnetIpTransport::bind_foreign(test_config(), bbmd_addr).unwrap();

        transport
            .send(DataLinkAddress::ipv4_broadcast(0xBAC0), &[9, 9])
            .await
            .unwrap();

        let mut rx = [0u8; 64];
        let (n, _) = bbmd.recv_from(&mut rx).await.unwrap();
        let mut r = Reader::new(&rx[..n]);
        let hdr = BvlcHeader::decode(&mut r).unwrap();
        assert_eq!(hdr.function, BvlcFunction::DistributeBroadcastToNetwork);
    }

    #[tokio::test]
    async fn register_foreign_device_roundtrip() {
        let bbmd = loopback_peer().await;
        let bbmd_addr = v4(bbmd.local_addr().unwrap());
        let transport = BacnetIpTransport::bind_foreign(test_config(), bbmd_addr).unwrap();

        let responder = tokio::spawn(async move {
            let mut rx = [0u8; 64];
            let (n, src) = bbmd.recv_from(&mut rx).await.unwrap();
            let mut r = Reader::new(&rx[..n]);
            let hdr = BvlcHeader::decode(&mut r).unwrap();
            assert_eq!(hdr.function, BvlcFunction::RegisterForeignDevice);
            assert_eq!(r.read_be_u16().unwrap(), 120);
            let reply = [BVLC_TYPE_BIP, 0x00, 0x00, 0x06, 0x00, 0x00];
            bbmd.send_to(&reply, src).await.unwrap();
        });

        transport.register_foreign_device(120).await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn read_foreign_device_table_parses_entries() {
        let bbmd = loopback_peer().await;
        let bbmd_addr = v4(bbmd.local_addr().unwrap());
        let transport = BacnetIpTransport::bind_foreign(test_config(), bbmd_addr).unwrap();

        let responder = tokio::spawn(async move {
            let mut rx = [0u8; 64];
            let (n, src) = bbmd.recv_from(&mut rx).await.unwrap();
            let mut r = Reader::new(&rx[..n]);
            let hdr = BvlcHeader::decode(&mut r).unwrap();
            assert_eq!(hdr.function, BvlcFunction::ReadForeignDeviceTable);

            let mut reply = [0u8; 32];
            let mut w = Writer::new(&mut reply);
            BvlcHeader {
                function: BvlcFunction::ReadForeignDeviceTableAck,
                length: 14,
            }
            .encode(&mut w)
            .unwrap();
            w.write_all(&[172, 16, 0, 42]).unwrap();
            w.write_be_u16(0xBAC0).unwrap();
            w.write_be_u16(120).unwrap();
            w.write_be_u16(90).unwrap();
            bbmd.send_to(w.as_written(), src).await.unwrap();
        });

        let entries = transport.read_foreign_device_table().await.unwrap();
        assert_eq!(
            entries,
            vec![ForeignDeviceTableEntry {
                address: SocketAddrV4::new(Ipv4Addr::new(172, 16, 0, 42), 0xBAC0),
                ttl_seconds: 120,
                remaining_seconds: 90,
            }]
        );
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn write_bdt_sends_entries() {
        let bbmd = loopback_peer().await;
        let bbmd_addr = v4(bbmd.local_addr().unwrap());
        let transport = BacnetIpTransport::bind_foreign(test_config(), bbmd_addr).unwrap();

        let responder = tokio::spawn(async move {
            let mut rx = [0u8; 64];
            let (n, src) = bbmd.recv_from(&mut rx).await.unwrap();
            let mut r = Reader::new(&rx[..n]);
            let hdr = BvlcHeader::decode(&mut r).unwrap();
            assert_eq!(hdr.function, BvlcFunction::WriteBroadcastDistributionTable);
            let payload = r.read_exact(hdr.payload_len()).unwrap();
            assert_eq!(payload, &[10, 1, 2, 3, 0xBA, 0xC0, 255, 255, 255, 0][..]);
            let reply = [BVLC_TYPE_BIP, 0x00, 0x00, 0x06, 0x00, 0x00];
            bbmd.send_to(&reply, src).await.unwrap();
        });

        let entries = [BroadcastDistributionEntry {
            address: SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 0xBAC0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        }];
        transport
            .write_broadcast_distribution_table(&entries)
            .await
            .unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn admin_commands_are_serialized() {
        let bbmd = loopback_peer().await;
        let bbmd_addr = v4(bbmd.local_addr().unwrap());
        let transport = BacnetIpTransport::bind_foreign(test_config(), bbmd_addr).unwrap();

        let t1 = transport.clone();
        let t2 = transport.clone();
        let first = tokio::spawn(async move { t1.read_foreign_device_table().await });
        let second = tokio::spawn(async move { t2.register_foreign_device(60).await });

        let mut rx = [0u8; 64];
        let (n1, src1) = bbmd.recv_from(&mut rx).await.unwrap();
        let mut r1 = Reader::new(&rx[..n1]);
        let hdr1 = BvlcHeader::decode(&mut r1).unwrap();
        let first_function = hdr1.function;

        // The second command must not hit the wire until the first exchange
        // completes.
        let premature = timeout(Duration::from_millis(100), bbmd.recv_from(&mut rx)).await;
        assert!(premature.is_err());

        let reply1: Vec<u8> = if first_function == BvlcFunction::ReadForeignDeviceTable {
            vec![BVLC_TYPE_BIP, 0x07, 0x00, 0x04]
        } else {
            vec![BVLC_TYPE_BIP, 0x00, 0x00, 0x06, 0x00, 0x00]
        };
        bbmd.send_to(&reply1, src1).await.unwrap();

        let (n2, src2) = bbmd.recv_from(&mut rx).await.unwrap();
        let mut r2 = Reader::new(&rx[..n2]);
        let hdr2 = BvlcHeader::decode(&mut r2).unwrap();
        let reply2: Vec<u8> = if hdr2.function == BvlcFunction::ReadForeignDeviceTable {
            vec![BVLC_TYPE_BIP, 0x07, 0x00, 0x04]
        } else {
            vec![BVLC_TYPE_BIP, 0x00, 0x00, 0x06, 0x00, 0x00]
        };
        bbmd.send_to(&reply2, src2).await.unwrap();

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }
}
