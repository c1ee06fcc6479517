//! [`DataLink`] front end over the PTP link engine.

use crate::codec::MAX_DATA_LEN;
use crate::link::{Link, PendingTx, PtpConfig, PtpStats, SendQueue};
use baclink_datalink::{DataLink, DataLinkAddress, DataLinkError, LinkAddress, SerialLink};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// A point-to-point serial BACnet link.
///
/// The medium is addressless: the single peer is both the unicast and the
/// broadcast destination.
pub struct PtpTransport {
    queue: SendQueue,
    wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    delivered: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    stats: Arc<StdMutex<PtpStats>>,
    driver: JoinHandle<()>,
}

impl PtpTransport {
    /// Start the engine task on `serial` and return the caller-side handle.
    pub fn start<S>(serial: S, config: PtpConfig) -> Self
    where
        S: SerialLink + 'static,
    {
        let queue: SendQueue = Arc::new(StdMutex::new(VecDeque::new()));
        let wake = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StdMutex::new(PtpStats::default()));

        let link = Link::new(
            serial,
            &config,
            Arc::clone(&queue),
            Arc::clone(&wake),
            Arc::clone(&shutdown),
            deliver_tx,
            Arc::clone(&stats),
        );
        let driver = tokio::spawn(link.run());

        Self {
            queue,
            wake,
            shutdown,
            delivered: Mutex::new(deliver_rx),
            stats,
            driver,
        }
    }

    pub fn stats(&self) -> PtpStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.stats().connected
    }

    fn enqueue(&self, payload: &[u8]) -> Result<oneshot::Receiver<()>, DataLinkError> {
        if payload.len() > MAX_DATA_LEN {
            return Err(DataLinkError::FrameTooLarge);
        }
        if self.driver.is_finished() {
            return Err(DataLinkError::Disposed);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(PendingTx {
                data: payload.to_vec(),
                done: Some(done_tx),
            });
        self.wake.notify_one();
        Ok(done_rx)
    }

    /// Enqueue and block until the peer acknowledges the frame, or `limit`
    /// elapses.
    pub async fn send_and_wait(
        &self,
        address: DataLinkAddress,
        payload: &[u8],
        limit: Duration,
    ) -> Result<(), DataLinkError> {
        check_address(&address)?;
        let done = self.enqueue(payload)?;
        match timeout(limit, done).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DataLinkError::Disposed),
            Err(_) => Err(DataLinkError::TransmitTimeout),
        }
    }

    /// Ask the engine to send a disconnect and stop. Idempotent.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }
}

fn check_address(address: &DataLinkAddress) -> Result<(), DataLinkError> {
    match address.link {
        LinkAddress::Ptp => Ok(()),
        _ => Err(DataLinkError::AddressFamily(*address)),
    }
}

impl Drop for PtpTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl DataLink for PtpTransport {
    async fn send(&self, address: DataLinkAddress, payload: &[u8]) -> Result<(), DataLinkError> {
        check_address(&address)?;
        // Fire-and-forget: completion is observable via send_and_wait only.
        let _ = self.enqueue(payload)?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, DataLinkAddress), DataLinkError> {
        let mut delivered = self.delivered.lock().await;
        let data = delivered.recv().await.ok_or(DataLinkError::Disposed)?;
        if data.len() > buf.len() {
            return Err(DataLinkError::FrameTooLarge);
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), DataLinkAddress::ptp()))
    }

    fn broadcast_address(&self) -> DataLinkAddress {
        DataLinkAddress::ptp()
    }
}
