//! [`DataLink`] front end over the MS/TP node.
//!
//! `start` hands the serial channel to the node task and keeps the shared
//! send queue, the upward delivery channel, and the statistics handle.
//! Outbound frames are strictly FIFO per station; each carries a oneshot
//! completion signal that fires when the frame actually leaves on a token
//! hold.

use crate::frame::{FrameType, ObservedFrame, MAX_DATA_LEN};
use crate::node::{MstpConfig, MstpStats, Node, PendingTx, SendQueue, BROADCAST};
use baclink_datalink::{DataLink, DataLinkAddress, DataLinkError, LinkAddress, SerialLink};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// NPDU control octet bit marking a message that expects a reply.
const NPDU_EXPECTING_REPLY: u8 = 0x04;

pub struct MstpTransport {
    station: Option<u8>,
    queue: SendQueue,
    delivered: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, u8)>>,
    observer: StdMutex<Option<mpsc::UnboundedReceiver<ObservedFrame>>>,
    completions: StdMutex<VecDeque<oneshot::Receiver<()>>>,
    stats: Arc<StdMutex<MstpStats>>,
    driver: JoinHandle<()>,
}

impl MstpTransport {
    /// Start the node task on `serial` and return the caller-side handle.
    pub fn start<S>(serial: S, config: MstpConfig) -> Self
    where
        S: SerialLink + 'static,
    {
        let queue: SendQueue = Arc::new(StdMutex::new(VecDeque::new()));
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (observe_tx, observe_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StdMutex::new(MstpStats::default()));

        let node = Node::new(
            serial,
            &config,
            Arc::clone(&queue),
            deliver_tx,
            observe_tx,
            Arc::clone(&stats),
        );
        let driver = tokio::spawn(node.run());

        Self {
            station: config.station,
            queue,
            delivered: Mutex::new(deliver_rx),
            observer: StdMutex::new(Some(observe_rx)),
            completions: StdMutex::new(VecDeque::new()),
            stats,
            driver,
        }
    }

    pub fn station(&self) -> Option<u8> {
        self.station
    }

    /// Take the raw-frame observer channel. Every validly decoded frame
    /// header on the line is delivered here, independent of payload
    /// delivery; used for passive station discovery. Single consumer.
    pub fn take_observer(&self) -> Option<mpsc::UnboundedReceiver<ObservedFrame>> {
        self.observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn stats(&self) -> MstpStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn destination_station(&self, address: &DataLinkAddress) -> Result<u8, DataLinkError> {
        match address.link {
            LinkAddress::Mstp(station) => Ok(station),
            _ => Err(DataLinkError::AddressFamily(*address)),
        }
    }

    fn enqueue(
        &self,
        destination: u8,
        payload: &[u8],
    ) -> Result<oneshot::Receiver<()>, DataLinkError> {
        if self.station.is_none() {
            return Err(DataLinkError::StationNotConfigured);
        }
        if payload.len() > MAX_DATA_LEN {
            return Err(DataLinkError::FrameTooLarge);
        }
        if self.driver.is_finished() {
            return Err(DataLinkError::Disposed);
        }

        // The NPDU's expecting-reply bit picks the confirmed frame type;
        // broadcasts are never confirmed.
        let confirmed = destination != BROADCAST
            && payload.len() >= 2
            && payload[1] & NPDU_EXPECTING_REPLY != 0;
        let frame_type = if confirmed {
            FrameType::DataExpectingReply
        } else {
            FrameType::DataNotExpectingReply
        };

        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(PendingTx {
                frame_type,
                destination,
                data: payload.to_vec(),
                done: Some(done_tx),
            });
        Ok(done_rx)
    }

    /// Enqueue and block until the frame has been transmitted on a token
    /// hold, or `limit` elapses.
    pub async fn send_and_wait(
        &self,
        address: DataLinkAddress,
        payload: &[u8],
        limit: Duration,
    ) -> Result<(), DataLinkError> {
        let destination = self.destination_station(&address)?;
        let done = self.enqueue(destination, payload)?;
        match timeout(limit, done).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DataLinkError::Disposed),
            Err(_) => Err(DataLinkError::TransmitTimeout),
        }
    }

    /// Drain the completion signals of every previously enqueued frame in
    /// order, bounded by `limit` overall.
    pub async fn wait_for_all_transmits(&self, limit: Duration) -> Result<(), DataLinkError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let next = self
                .completions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(done) = next else { return Ok(()) };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, done).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(DataLinkError::Disposed),
                Err(_) => return Err(DataLinkError::TransmitTimeout),
            }
        }
    }

    /// Stop the node task. Idempotent.
    pub fn close(&self) {
        self.driver.abort();
    }
}

impl Drop for MstpTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl DataLink for MstpTransport {
    async fn send(&self, address: DataLinkAddress, payload: &[u8]) -> Result<(), DataLinkError> {
        let destination = self.destination_station(&address)?;
        let done = self.enqueue(destination, payload)?;
        self.completions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(done);
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, DataLinkAddress), DataLinkError> {
        let mut delivered = self.delivered.lock().await;
        let (data, source) = delivered.recv().await.ok_or(DataLinkError::Disposed)?;
        if data.len() > buf.len() {
            return Err(DataLinkError::FrameTooLarge);
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), DataLinkAddress::mstp(source)))
    }

    fn broadcast_address(&self) -> DataLinkAddress {
        DataLinkAddress::mstp_broadcast()
    }
}
