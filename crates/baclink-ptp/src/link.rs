//! PTP link engine (Clause 10 connection management).
//!
//! One engine task owns the serial channel and drives the whole link:
//! connect handshake (greeting exchange plus optional ASCII password),
//! DATA0/DATA1 sequenced transfer gated by the ack/nak flow-control
//! flip-flop, heartbeats, and unconditional reconnect after any channel
//! error. Callers talk to it through the shared send queue and the
//! delivery channel held by [`PtpTransport`](crate::transport::PtpTransport).

use crate::codec::{PtpDecoder, PtpEvent, PtpFrame, PtpFrameType, PTP_GREETING};
use baclink_datalink::{SerialError, SerialLink};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

/// Idle time after which a heartbeat-XON is sent to prove liveness.
pub const T_HEARTBEAT: Duration = Duration::from_millis(15000);
/// Mid-frame silence after which a partially received frame is abandoned.
pub const T_FRAME_ABORT: Duration = Duration::from_millis(2000);
/// Pause between reconnect attempts after a connection error.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(1000);
/// How long one handshake step may wait for the peer's answer.
pub const T_HANDSHAKE: Duration = Duration::from_millis(5000);
/// How long an unacknowledged data frame waits before retransmission.
pub const T_ACK_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PtpRole {
    /// Initiates the connection: sends the greeting and the connect request.
    Client,
    /// Waits for a greeting, then answers it.
    Server,
}

/// Reason codes carried in a disconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    NoMoreData = 0,
    Preempted = 1,
    InvalidPassword = 2,
    Other = 3,
}

impl DisconnectReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NoMoreData,
            1 => Self::Preempted,
            2 => Self::InvalidPassword,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PtpConfig {
    pub role: PtpRole,
    /// Optional ASCII password exchanged during the handshake. `None`
    /// accepts any peer.
    pub password: Option<String>,
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self {
            role: PtpRole::Client,
            password: None,
        }
    }
}

/// Counters mutated by the engine, snapshotted by the transport.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PtpStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub decode_errors: u64,
    pub naks: u64,
    pub heartbeats_sent: u64,
    pub reconnects: u64,
    pub connected: bool,
}

pub(crate) struct PendingTx {
    pub data: Vec<u8>,
    pub done: Option<oneshot::Sender<()>>,
}

pub(crate) type SendQueue = Arc<StdMutex<VecDeque<PendingTx>>>;

enum LinkFault {
    /// The serial channel closed or errored; reopen before retrying.
    Closed,
    /// The peer did not answer in time, or asked to disconnect.
    Retry,
    /// Shutdown requested by the transport.
    Shutdown,
}

pub(crate) struct Link<S: SerialLink> {
    serial: S,
    role: PtpRole,
    password: Option<String>,
    decoder: PtpDecoder,
    queue: SendQueue,
    wake: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    deliver: mpsc::UnboundedSender<Vec<u8>>,
    stats: Arc<StdMutex<PtpStats>>,
    // 1-bit sequence numbers: ours for transmit, the next one we expect.
    tx_seq: bool,
    rx_expected: bool,
    may_send: bool,
    in_flight: Option<PendingTx>,
    in_flight_sent_at: Instant,
    last_activity: Instant,
    last_byte: Instant,
}

impl<S: SerialLink> Link<S> {
    pub(crate) fn new(
        serial: S,
        config: &PtpConfig,
        queue: SendQueue,
        wake: Arc<Notify>,
        shutdown: Arc<AtomicBool>,
        deliver: mpsc::UnboundedSender<Vec<u8>>,
        stats: Arc<StdMutex<PtpStats>>,
    ) -> Self {
        Self {
            serial,
            role: config.role,
            password: config.password.clone(),
            decoder: PtpDecoder::new(),
            queue,
            wake,
            shutdown,
            deliver,
            stats,
            tx_seq: false,
            rx_expected: false,
            may_send: true,
            in_flight: None,
            in_flight_sent_at: Instant::now(),
            last_activity: Instant::now(),
            last_byte: Instant::now(),
        }
    }

    /// Drive the link until shutdown. Reconnects unconditionally after any
    /// channel error or disconnect, with a fixed backoff.
    pub(crate) async fn run(mut self) {
        loop {
            match self.connect().await {
                Ok(()) => {}
                Err(LinkFault::Shutdown) => break,
                Err(fault) => {
                    self.backoff(fault).await;
                    continue;
                }
            }

            info!("ptp: connected as {:?}", self.role);
            self.with_stats(|s| s.connected = true);
            let fault = self.run_connected().await;
            self.with_stats(|s| {
                s.connected = false;
                s.reconnects += 1;
            });
            match fault {
                LinkFault::Shutdown => break,
                fault => self.backoff(fault).await,
            }
        }
        debug!("ptp: engine stopped");
    }

    async fn backoff(&mut self, fault: LinkFault) {
        tokio::time::sleep(RECONNECT_BACKOFF).await;
        if matches!(fault, LinkFault::Closed) {
            match self.serial.reopen().await {
                Ok(()) => debug!("ptp: channel reopened"),
                Err(SerialError::ReopenUnsupported) => {}
                Err(err) => warn!("ptp: reopen failed: {err}"),
            }
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut PtpStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn password_ok(&self, offered: &[u8]) -> bool {
        match &self.password {
            Some(expected) => expected.as_bytes() == offered,
            None => true,
        }
    }

    fn password_bytes(&self) -> Vec<u8> {
        self.password
            .as_deref()
            .map(|p| p.as_bytes().to_vec())
            .unwrap_or_default()
    }

    async fn write_frame(&mut self, frame: PtpFrame) {
        trace!("ptp: -> {:?} ({} bytes)", frame.frame_type, frame.data.len());
        self.serial.write(&frame.encode()).await;
        self.with_stats(|s| s.frames_out += 1);
    }

    async fn send_disconnect(&mut self, reason: DisconnectReason) {
        self.write_frame(PtpFrame::with_data(
            PtpFrameType::DisconnectRequest,
            vec![reason as u8],
        ))
        .await;
    }

    /// Run the role-appropriate handshake to the connected state.
    async fn connect(&mut self) -> Result<(), LinkFault> {
        self.decoder.clear();
        self.tx_seq = false;
        self.rx_expected = false;
        self.may_send = true;
        // An unacked frame from the previous connection goes back to the
        // head of the queue; it retransmits once the link is up again.
        if let Some(tx) = self.in_flight.take() {
            self.queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_front(tx);
        }

        match self.role {
            PtpRole::Client => self.connect_as_client().await,
            PtpRole::Server => self.connect_as_server().await,
        }
    }

    async fn connect_as_client(&mut self) -> Result<(), LinkFault> {
        self.serial.write(PTP_GREETING).await;
        self.write_frame(PtpFrame::with_data(
            PtpFrameType::ConnectRequest,
            self.password_bytes(),
        ))
        .await;

        let deadline = Instant::now() + T_HANDSHAKE;
        loop {
            match self.read_event(deadline).await? {
                PtpEvent::Greeting => {}
                PtpEvent::Frame(frame) => match frame.frame_type {
                    PtpFrameType::ConnectResponse => {
                        if !self.password_ok(&frame.data) {
                            warn!("ptp: peer password mismatch, disconnecting");
                            self.send_disconnect(DisconnectReason::InvalidPassword).await;
                            return Err(LinkFault::Retry);
                        }
                        return Ok(());
                    }
                    PtpFrameType::DisconnectRequest => {
                        let reason = frame
                            .data
                            .first()
                            .copied()
                            .map(DisconnectReason::from_u8);
                        warn!("ptp: connect refused: {reason:?}");
                        self.write_frame(PtpFrame::control(PtpFrameType::DisconnectResponse))
                            .await;
                        return Err(LinkFault::Retry);
                    }
                    other => trace!("ptp: ignoring {other:?} during handshake"),
                },
            }
        }
    }

    async fn connect_as_server(&mut self) -> Result<(), LinkFault> {
        // Wait as long as it takes for a client to greet us.
        loop {
            let deadline = Instant::now() + T_HANDSHAKE;
            match self.read_event(deadline).await {
                Ok(PtpEvent::Greeting) => break,
                Ok(PtpEvent::Frame(frame)) => {
                    trace!("ptp: ignoring {:?} before greeting", frame.frame_type)
                }
                Err(LinkFault::Retry) => {}
                Err(fault) => return Err(fault),
            }
        }
        self.serial.write(PTP_GREETING).await;

        let deadline = Instant::now() + T_HANDSHAKE;
        loop {
            match self.read_event(deadline).await? {
                PtpEvent::Greeting => {}
                PtpEvent::Frame(frame) => match frame.frame_type {
                    PtpFrameType::ConnectRequest => {
                        if !self.password_ok(&frame.data) {
                            warn!("ptp: client offered a wrong password");
                            self.send_disconnect(DisconnectReason::InvalidPassword).await;
                            return Err(LinkFault::Retry);
                        }
                        self.write_frame(PtpFrame::with_data(
                            PtpFrameType::ConnectResponse,
                            self.password_bytes(),
                        ))
                        .await;
                        return Ok(());
                    }
                    other => trace!("ptp: ignoring {other:?} during handshake"),
                },
            }
        }
    }

    /// Read until one decoded event arrives or `deadline` passes. Decode
    /// errors are logged and skipped; they never abort a handshake.
    async fn read_event(&mut self, deadline: Instant) -> Result<PtpEvent, LinkFault> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(LinkFault::Shutdown);
            }
            match self.decoder.next_event() {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => {}
                Err(err) => {
                    warn!("ptp: {err}");
                    self.with_stats(|s| s.decode_errors += 1);
                    continue;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkFault::Retry);
            }
            let mut buf = [0u8; 512];
            match self.serial.read(&mut buf, remaining).await {
                Ok(0) => return Err(LinkFault::Closed),
                Ok(n) => self.decoder.push_bytes(&buf[..n]),
                Err(SerialError::TimedOut) => return Err(LinkFault::Retry),
                Err(_) => return Err(LinkFault::Closed),
            }
        }
    }

    /// The connected-state loop. Returns the fault that broke the link.
    async fn run_connected(&mut self) -> LinkFault {
        self.last_activity = Instant::now();
        self.last_byte = Instant::now();

        loop {
            // Drain everything already decoded before touching the wire.
            loop {
                match self.decoder.next_event() {
                    Ok(Some(event)) => {
                        if let Err(fault) = self.handle_event(event).await {
                            return fault;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("ptp: {err}");
                        self.with_stats(|s| s.decode_errors += 1);
                    }
                }
            }

            if self.shutdown.load(Ordering::Relaxed) {
                self.send_disconnect(DisconnectReason::NoMoreData).await;
                return LinkFault::Shutdown;
            }

            self.try_transmit().await;

            let now = Instant::now();
            let heartbeat_at = self.last_activity + T_HEARTBEAT;
            if now >= heartbeat_at {
                self.write_frame(PtpFrame::control(PtpFrameType::HeartbeatXon)).await;
                self.with_stats(|s| s.heartbeats_sent += 1);
                self.last_activity = Instant::now();
                continue;
            }
            let mut limit = heartbeat_at - now;
            if self.in_flight.is_some() {
                // A lost ack stalls the gate forever without this.
                let retry_at = self.in_flight_sent_at + T_ACK_TIMEOUT;
                if now >= retry_at {
                    debug!("ptp: ack timeout, retransmitting");
                    self.retransmit_in_flight().await;
                    continue;
                }
                limit = limit.min(retry_at - now);
            }
            if self.decoder.has_partial() {
                let abort_at = self.last_byte + T_FRAME_ABORT;
                if now >= abort_at {
                    warn!("ptp: mid-frame silence, abandoning partial frame");
                    self.decoder.clear();
                    continue;
                }
                limit = limit.min(abort_at - now);
            }

            let mut buf = [0u8; 512];
            tokio::select! {
                result = self.serial.read(&mut buf, limit) => match result {
                    Ok(0) => return LinkFault::Closed,
                    Ok(n) => {
                        self.last_byte = Instant::now();
                        self.last_activity = self.last_byte;
                        self.decoder.push_bytes(&buf[..n]);
                    }
                    Err(SerialError::TimedOut) => {}
                    Err(err) => {
                        warn!("ptp: read failed: {err}");
                        return LinkFault::Closed;
                    }
                },
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Put the next queued payload on the wire if the gate allows it.
    async fn try_transmit(&mut self) {
        if !self.may_send || self.in_flight.is_some() {
            return;
        }
        let next = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let Some(tx) = next else { return };
        self.write_frame(PtpFrame::with_data(
            PtpFrameType::data(self.tx_seq),
            tx.data.clone(),
        ))
        .await;
        // Gate closes until the peer acks this sequence number.
        self.may_send = false;
        self.in_flight = Some(tx);
        self.in_flight_sent_at = Instant::now();
    }

    async fn retransmit_in_flight(&mut self) {
        let Some(frame) = self
            .in_flight
            .as_ref()
            .map(|tx| PtpFrame::with_data(PtpFrameType::data(self.tx_seq), tx.data.clone()))
        else {
            return;
        };
        self.write_frame(frame).await;
        self.may_send = false;
        self.in_flight_sent_at = Instant::now();
    }

    async fn handle_event(&mut self, event: PtpEvent) -> Result<(), LinkFault> {
        let frame = match event {
            PtpEvent::Greeting => {
                // Peer is restarting its handshake on a live line.
                if self.role == PtpRole::Server {
                    self.serial.write(PTP_GREETING).await;
                }
                return Ok(());
            }
            PtpEvent::Frame(frame) => frame,
        };
        self.with_stats(|s| s.frames_in += 1);
        trace!("ptp: <- {:?} ({} bytes)", frame.frame_type, frame.data.len());

        if let Some(sequence) = frame.frame_type.data_sequence() {
            self.write_frame(PtpFrame::control(PtpFrameType::ack(sequence, true)))
                .await;
            if sequence == self.rx_expected {
                self.rx_expected = !self.rx_expected;
                if self.deliver.send(frame.data).is_err() {
                    return Err(LinkFault::Shutdown);
                }
            } else {
                debug!("ptp: duplicate data frame, re-acked");
            }
            return Ok(());
        }

        if let Some((sequence, xon)) = frame.frame_type.ack_bits() {
            self.may_send = xon;
            if sequence == self.tx_seq {
                if let Some(mut tx) = self.in_flight.take() {
                    self.tx_seq = !self.tx_seq;
                    if let Some(done) = tx.done.take() {
                        let _ = done.send(());
                    }
                }
            }
            return Ok(());
        }

        if let Some((sequence, xon)) = frame.frame_type.nak_bits() {
            self.with_stats(|s| s.naks += 1);
            self.may_send = xon;
            if sequence == self.tx_seq && xon && self.in_flight.is_some() {
                debug!("ptp: nak, retransmitting");
                self.retransmit_in_flight().await;
            }
            return Ok(());
        }

        if let Some(xon) = frame.frame_type.heartbeat_xon() {
            self.may_send = xon;
            return Ok(());
        }

        match frame.frame_type {
            PtpFrameType::TestRequest => {
                // Echoed back verbatim for liveness probing.
                self.write_frame(PtpFrame::with_data(PtpFrameType::TestResponse, frame.data))
                    .await;
            }
            PtpFrameType::TestResponse => {}
            PtpFrameType::ConnectRequest => {
                if self.password_ok(&frame.data) {
                    self.write_frame(PtpFrame::with_data(
                        PtpFrameType::ConnectResponse,
                        self.password_bytes(),
                    ))
                    .await;
                } else {
                    self.send_disconnect(DisconnectReason::InvalidPassword).await;
                    return Err(LinkFault::Retry);
                }
            }
            PtpFrameType::ConnectResponse => {}
            PtpFrameType::DisconnectRequest => {
                let reason = frame.data.first().copied().map(DisconnectReason::from_u8);
                info!("ptp: peer disconnected: {reason:?}");
                self.write_frame(PtpFrame::control(PtpFrameType::DisconnectResponse))
                    .await;
                return Err(LinkFault::Retry);
            }
            PtpFrameType::DisconnectResponse => return Err(LinkFault::Retry),
            _ => {}
        }
        Ok(())
    }
}
