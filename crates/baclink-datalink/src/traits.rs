use crate::DataLinkAddress;
use thiserror::Error;

/// Errors that can occur at the data-link layer.
#[derive(Debug, Error)]
pub enum DataLinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("invalid frame")]
    InvalidFrame,
    #[error("address {0} is not valid for this transport")]
    AddressFamily(DataLinkAddress),
    #[error("unsupported BVLC function 0x{0:02x}")]
    UnsupportedBvlcFunction(u8),
    #[error("BVLC result code 0x{0:04x}")]
    BvlcResult(u16),
    #[error("bbmd not configured")]
    BbmdNotConfigured,
    #[error("station address not configured")]
    StationNotConfigured,
    #[error("transmit not confirmed within timeout")]
    TransmitTimeout,
    #[error("transport is shut down")]
    Disposed,
}

/// Async trait for sending and receiving raw NPDU bytes over one medium.
///
/// Implementors include [`BacnetIpTransport`](crate::BacnetIpTransport),
/// [`BacnetIp6Transport`](crate::BacnetIp6Transport), and the MS/TP and PTP
/// transports in their own crates. Each implementor runs its own receive
/// loop; `recv` completes from that loop's context, so callers must not
/// assume any particular execution context.
pub trait DataLink: Send + Sync {
    /// Sends `payload` to the given data-link `address`.
    async fn send(&self, address: DataLinkAddress, payload: &[u8]) -> Result<(), DataLinkError>;

    /// Receives a payload into `buf`, returning `(bytes_read, source_address)`.
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, DataLinkAddress), DataLinkError>;

    /// The address that reaches every station on this medium.
    fn broadcast_address(&self) -> DataLinkAddress;
}
