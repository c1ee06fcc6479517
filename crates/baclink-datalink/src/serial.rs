//! Byte-level serial channel abstraction for the MS/TP and PTP link layers.
//!
//! A [`SerialLink`] is a half-duplex byte pipe with timeout-carrying reads.
//! Three implementations are provided: a physical serial port, a unix-socket
//! "virtual serial" channel for same-host testing without hardware, and an
//! in-memory duplex for unit tests.
//!
//! Writes are fire-and-forget: write failures are logged and surface to the
//! protocol engines as a closed channel on the next read, which is where all
//! link-layer recovery lives.

use log::warn;
use std::future::Future;
use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// How long a virtual-serial connect may take before it fails.
pub const PIPE_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Error)]
pub enum SerialError {
    /// No bytes arrived within the caller's timeout. A normal signal for the
    /// protocol engines, not a failure.
    #[error("read timed out")]
    TimedOut,
    #[error("channel cannot be reopened")]
    ReopenUnsupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A byte channel with timeout semantics, owned by one protocol engine.
///
/// `read` returns `Ok(0)` on graceful close, [`SerialError::TimedOut`] when
/// the deadline passes with no data, and [`SerialError::Io`] on hard errors.
/// `close` is idempotent. `reopen` re-establishes the channel after an
/// error, for engines (PTP) that reconnect unconditionally.
///
/// The methods return `Send` futures so a protocol engine owning the
/// channel can itself be driven from a spawned task; implementations can
/// still be written as plain `async fn`.
pub trait SerialLink: Send {
    fn read(
        &mut self,
        buf: &mut [u8],
        limit: Duration,
    ) -> impl Future<Output = Result<usize, SerialError>> + Send;
    fn write(&mut self, data: &[u8]) -> impl Future<Output = ()> + Send;
    fn reopen(&mut self) -> impl Future<Output = Result<(), SerialError>> + Send;
    fn close(&mut self);
}

async fn read_with_timeout<R>(
    stream: &mut R,
    buf: &mut [u8],
    limit: Duration,
) -> Result<usize, SerialError>
where
    R: AsyncReadExt + Unpin,
{
    match timeout(limit, stream.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(err)) => Err(SerialError::Io(err)),
        Err(_) => Err(SerialError::TimedOut),
    }
}

/// A physical serial port (RS-485 adapter or RS-232 line).
pub struct PhysicalSerial {
    path: String,
    baud: u32,
    port: Option<SerialStream>,
}

impl PhysicalSerial {
    pub fn open(path: impl Into<String>, baud: u32) -> Result<Self, SerialError> {
        let path = path.into();
        let port = tokio_serial::new(&path, baud)
            .open_native_async()
            .map_err(io::Error::from)?;
        Ok(Self {
            path,
            baud,
            port: Some(port),
        })
    }
}

impl SerialLink for PhysicalSerial {
    async fn read(&mut self, buf: &mut [u8], limit: Duration) -> Result<usize, SerialError> {
        match self.port.as_mut() {
            Some(port) => read_with_timeout(port, buf, limit).await,
            None => Ok(0),
        }
    }

    async fn write(&mut self, data: &[u8]) {
        if let Some(port) = self.port.as_mut() {
            if let Err(err) = port.write_all(data).await {
                warn!("serial write failed on {}: {err}", self.path);
                self.port = None;
            }
        }
    }

    async fn reopen(&mut self) -> Result<(), SerialError> {
        self.port = None;
        let port = tokio_serial::new(&self.path, self.baud)
            .open_native_async()
            .map_err(io::Error::from)?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }
}

/// A duplex unix-socket channel standing in for a serial line, so two
/// processes on one host can run MS/TP or PTP against each other without
/// hardware.
#[cfg(unix)]
pub struct PipeSerial {
    path: PathBuf,
    stream: Option<UnixStream>,
}

#[cfg(unix)]
impl PipeSerial {
    /// Connect to a listening peer, failing after [`PIPE_CONNECT_TIMEOUT`].
    pub async fn connect(path: impl Into<PathBuf>) -> Result<Self, SerialError> {
        let path = path.into();
        let stream = timeout(PIPE_CONNECT_TIMEOUT, UnixStream::connect(&path))
            .await
            .map_err(|_| {
                SerialError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "virtual serial connect timed out",
                ))
            })??;
        Ok(Self {
            path,
            stream: Some(stream),
        })
    }

    /// Listen for a single peer and accept it.
    pub async fn accept(path: impl Into<PathBuf>) -> Result<Self, SerialError> {
        let path = path.into();
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)?;
        let (stream, _) = listener.accept().await?;
        Ok(Self {
            path,
            stream: Some(stream),
        })
    }
}

#[cfg(unix)]
impl SerialLink for PipeSerial {
    async fn read(&mut self, buf: &mut [u8], limit: Duration) -> Result<usize, SerialError> {
        match self.stream.as_mut() {
            Some(stream) => match read_with_timeout(stream, buf, limit).await {
                Err(SerialError::Io(err)) => {
                    // Broken pipe: drop the stream so the engine sees a
                    // closed channel and drives its reconnect path.
                    self.stream = None;
                    Err(SerialError::Io(err))
                }
                other => other,
            },
            None => Ok(0),
        }
    }

    async fn write(&mut self, data: &[u8]) {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(err) = stream.write_all(data).await {
                warn!("virtual serial write failed on {:?}: {err}", self.path);
                self.stream = None;
            }
        }
    }

    async fn reopen(&mut self) -> Result<(), SerialError> {
        self.stream = None;
        let stream = timeout(PIPE_CONNECT_TIMEOUT, UnixStream::connect(&self.path))
            .await
            .map_err(|_| {
                SerialError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "virtual serial reconnect timed out",
                ))
            })??;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// In-memory duplex channel for tests.
pub struct MemorySerial {
    stream: Option<DuplexStream>,
}

impl MemorySerial {
    /// A connected pair of in-memory serial ends.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(4096);
        (Self { stream: Some(a) }, Self { stream: Some(b) })
    }
}

impl SerialLink for MemorySerial {
    async fn read(&mut self, buf: &mut [u8], limit: Duration) -> Result<usize, SerialError> {
        match self.stream.as_mut() {
            Some(stream) => read_with_timeout(stream, buf, limit).await,
            None => Ok(0),
        }
    }

    async fn write(&mut self, data: &[u8]) {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(err) = stream.write_all(data).await {
                warn!("memory serial write failed: {err}");
                self.stream = None;
            }
        }
    }

    async fn reopen(&mut self) -> Result<(), SerialError> {
        Err(SerialError::ReopenUnsupported)
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{MemorySerial, SerialError, SerialLink};
    use std::time::Duration;

    // The MS/TP and PTP engines run inside `tokio::spawn`, which needs the
    // whole driver future, serial reads included, to be `Send`.
    #[test]
    fn link_futures_are_send() {
        fn assert_send<T: Send>(_: T) {}
        let (mut a, _b) = MemorySerial::pair();
        let mut buf = [0u8; 8];
        assert_send(a.read(&mut buf, Duration::from_millis(1)));
        assert_send(a.write(&[0x55]));
        assert_send(a.reopen());
    }

    #[tokio::test]
    async fn memory_pair_passes_bytes() {
        let (mut a, mut b) = MemorySerial::pair();
        a.write(&[1, 2, 3]).await;
        let mut buf = [0u8; 8];
        let n = b.read(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_times_out_distinctly() {
        let (mut a, _b) = MemorySerial::pair();
        let mut buf = [0u8; 8];
        let err = a
            .read(&mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SerialError::TimedOut));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reads_zero() {
        let (mut a, _b) = MemorySerial::pair();
        a.close();
        a.close();
        let mut buf = [0u8; 8];
        let n = a.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn peer_drop_reads_zero() {
        let (mut a, b) = MemorySerial::pair();
        drop(b);
        let mut buf = [0u8; 8];
        let n = a.read(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(n, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_connect_and_exchange() {
        use super::PipeSerial;
        let dir = std::env::temp_dir().join(format!("baclink-pipe-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);

        let path = dir.clone();
        let server = tokio::spawn(async move {
            let mut server = PipeSerial::accept(path).await.unwrap();
            let mut buf = [0u8; 8];
            let n = server
                .read(&mut buf, Duration::from_secs(2))
                .await
                .unwrap();
            server.write(&buf[..n]).await;
        });

        // Give the listener a moment to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut client = PipeSerial::connect(dir.clone()).await.unwrap();
        client.write(&[0xAA, 0xBB]).await;
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf, Duration::from_secs(2)).await.unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0xBB]);
        server.await.unwrap();
        let _ = std::fs::remove_file(&dir);
    }
}
