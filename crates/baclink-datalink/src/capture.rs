//! PCAP capture via a [`DataLink`] wrapper.
//!
//! [`CapturingDataLink`] wraps any transport and appends every sent and
//! received payload to a PCAP stream, so interop problems with third-party
//! gear can be picked apart in Wireshark after the fact.

use crate::{DataLink, DataLinkAddress, DataLinkError};
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// PCAP link type `USER0` (147); there is no registered link type for bare
/// BACnet NPDU payloads.
const PCAP_LINK_TYPE_USER0: u32 = 147;
const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_MAX_SNAPLEN: u32 = 65535;

/// Writes the PCAP global header once, then appends one record per packet.
struct PcapWriter<W: Write + Send> {
    inner: W,
}

impl<W: Write + Send> PcapWriter<W> {
    fn new(mut writer: W) -> io::Result<Self> {
        writer.write_all(&PCAP_MAGIC.to_le_bytes())?;
        writer.write_all(&PCAP_VERSION_MAJOR.to_le_bytes())?;
        writer.write_all(&PCAP_VERSION_MINOR.to_le_bytes())?;
        writer.write_all(&0i32.to_le_bytes())?; // thiszone
        writer.write_all(&0u32.to_le_bytes())?; // sigfigs
        writer.write_all(&PCAP_MAX_SNAPLEN.to_le_bytes())?;
        writer.write_all(&PCAP_LINK_TYPE_USER0.to_le_bytes())?;
        writer.flush()?;
        Ok(Self { inner: writer })
    }

    fn write_packet(&mut self, data: &[u8]) -> io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let len = data.len() as u32;

        self.inner.write_all(&(now.as_secs() as u32).to_le_bytes())?;
        self.inner.write_all(&now.subsec_micros().to_le_bytes())?;
        self.inner.write_all(&len.to_le_bytes())?; // incl_len
        self.inner.write_all(&len.to_le_bytes())?; // orig_len
        self.inner.write_all(data)?;
        self.inner.flush()
    }
}

/// A [`DataLink`] wrapper that records all traffic to a PCAP stream.
///
/// Capture failures never fail the wrapped transport; a full disk costs the
/// trace, not the link.
pub struct CapturingDataLink<D: DataLink, W: Write + Send = io::BufWriter<std::fs::File>> {
    inner: D,
    writer: Mutex<PcapWriter<W>>,
}

impl<D: DataLink> CapturingDataLink<D> {
    /// Wrap `inner`, recording frames to a fresh PCAP file at `path`.
    pub fn to_file(inner: D, path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Self::to_writer(inner, io::BufWriter::new(file))
    }
}

impl<D: DataLink, W: Write + Send> CapturingDataLink<D, W> {
    /// Wrap `inner`, recording frames to an arbitrary writer.
    pub fn to_writer(inner: D, writer: W) -> io::Result<Self> {
        Ok(Self {
            inner,
            writer: Mutex::new(PcapWriter::new(writer)?),
        })
    }
}

impl<D: DataLink, W: Write + Send> DataLink for CapturingDataLink<D, W> {
    async fn send(&self, address: DataLinkAddress, payload: &[u8]) -> Result<(), DataLinkError> {
        {
            let mut w = self.writer.lock().await;
            let _ = w.write_packet(payload);
        }
        self.inner.send(address, payload).await
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, DataLinkAddress), DataLinkError> {
        let (n, src) = self.inner.recv(buf).await?;
        {
            let mut w = self.writer.lock().await;
            let _ = w.write_packet(&buf[..n]);
        }
        Ok((n, src))
    }

    fn broadcast_address(&self) -> DataLinkAddress {
        self.inner.broadcast_address()
    }
}
