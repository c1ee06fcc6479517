//! MS/TP token-passing master state machine (Clause 9).
//!
//! The node owns the serial channel and runs as one autonomous task. The
//! only blocking primitive inside the loop is the timed serial read; every
//! timeout is a protocol signal that drives a state transition, never a
//! failure. Callers talk to the running node through the shared send queue
//! and the delivery channel owned by the transport.

use crate::frame::{Frame, FrameExtractor, FrameType, ObservedFrame, MAX_DATA_LEN};
use baclink_datalink::{SerialError, SerialLink};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Broadcast station address.
pub const BROADCAST: u8 = 0xFF;

/// Silence after which a station assumes the token is lost.
pub const T_NO_TOKEN: Duration = Duration::from_millis(500);
/// How long a token pass or poll waits for proof of life.
pub const T_USAGE_TIMEOUT: Duration = Duration::from_millis(100);
/// How long a confirmed-frame sender waits for the reply.
pub const T_REPLY_TIMEOUT: Duration = Duration::from_millis(295);
/// How long a station may sit on a received request before postponing.
pub const T_REPLY_DELAY: Duration = Duration::from_millis(250);

/// Tokens between maintenance polls for new masters.
pub const MAX_POLL: u8 = 50;
/// Additional attempts after the first failed token pass.
pub const RETRY_TOKEN: u8 = 1;

/// Per-station idle stagger: each station adds 10 ms per address unit to
/// its no-token timeout so simultaneous token regeneration cannot collide.
const T_NO_TOKEN_STAGGER_PER_STATION: Duration = Duration::from_millis(10);

/// How often AnswerDataRequest re-checks the queue for the upper layer's
/// reply.
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MstpConfig {
    /// This station's address (0-127). `None` runs the node passively:
    /// it observes the line but never transmits, and sends fail fast.
    pub station: Option<u8>,
    /// Highest master address polled for (default 127).
    pub max_master: u8,
    /// Data frames this station may send per token hold.
    pub max_info_frames: u8,
    /// Tokens between maintenance polls.
    pub max_poll: u8,
    /// Extra token-pass attempts before declaring the successor dead.
    pub retry_token: u8,
}

impl Default for MstpConfig {
    fn default() -> Self {
        Self {
            station: None,
            max_master: 127,
            max_info_frames: 1,
            max_poll: MAX_POLL,
            retry_token: RETRY_TOKEN,
        }
    }
}

/// An outbound frame waiting for the token, with its completion signal.
#[derive(Debug)]
pub(crate) struct PendingTx {
    pub frame_type: FrameType,
    pub destination: u8,
    pub data: Vec<u8>,
    pub done: Option<oneshot::Sender<()>>,
}

pub(crate) type SendQueue = Arc<Mutex<VecDeque<PendingTx>>>;

/// Counters and ring observations exposed by the transport.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MstpStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub crc_errors: u64,
    pub frame_errors: u64,
    pub reply_timeouts: u64,
    pub tokens_received: u64,
    pub token_pass_failures: u64,
    pub token_loop_last_ms: u64,
    pub token_loop_min_ms: u64,
    pub token_loop_max_ms: u64,
    pub sole_master: bool,
    /// Bitmap of station addresses seen sourcing valid frames.
    pub discovered: u128,
}

impl MstpStats {
    /// Station addresses observed on the line, ascending.
    pub fn stations(&self) -> Vec<u8> {
        (0u8..128)
            .filter(|s| self.discovered & (1u128 << s) != 0)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    UseToken,
    WaitForReply,
    DoneWithToken,
    PassToken,
    PollForMaster,
    AnswerDataRequest,
}

/// The serial channel closed; the node's run loop exits.
struct Closed;

pub(crate) struct Node<S: SerialLink> {
    serial: S,
    station: u8,
    passive: bool,
    max_master: u8,
    max_info_frames: u8,
    max_poll: u8,
    retry_token: u8,

    state: State,
    /// Next station: the token successor.
    ns: u8,
    /// Poll station: the next address probed for new masters.
    ps: u8,
    token_count: u8,
    frame_count: u8,
    sole_master: bool,
    maintenance_poll: bool,
    reply_source: Option<u8>,
    last_token_at: Option<Instant>,

    extractor: FrameExtractor,
    queue: SendQueue,
    delivered: mpsc::UnboundedSender<(Vec<u8>, u8)>,
    observer: mpsc::UnboundedSender<ObservedFrame>,
    stats: Arc<Mutex<MstpStats>>,
}

impl<S: SerialLink> Node<S> {
    pub(crate) fn new(
        serial: S,
        config: &MstpConfig,
        queue: SendQueue,
        delivered: mpsc::UnboundedSender<(Vec<u8>, u8)>,
        observer: mpsc::UnboundedSender<ObservedFrame>,
        stats: Arc<Mutex<MstpStats>>,
    ) -> Self {
        let station = config.station.unwrap_or(0);
        Self {
            serial,
            station,
            passive: config.station.is_none(),
            max_master: config.max_master,
            max_info_frames: config.max_info_frames.max(1),
            max_poll: config.max_poll,
            retry_token: config.retry_token,
            state: State::Idle,
            ns: station,
            ps: station,
            token_count: 0,
            frame_count: 0,
            sole_master: false,
            maintenance_poll: false,
            reply_source: None,
            last_token_at: None,
            extractor: FrameExtractor::new(),
            queue,
            delivered,
            observer,
            stats,
        }
    }

    pub(crate) async fn run(mut self) {
        if self.passive {
            self.run_passive().await;
            return;
        }

        // Initialize: NS = PS = TS; token_count = max_poll so the first
        // token hold polls for masters immediately.
        self.ns = self.station;
        self.ps = self.station;
        self.token_count = self.max_poll;
        self.frame_count = 0;
        self.sole_master = false;
        self.state = State::Idle;
        debug!("mstp station {} entering ring", self.station);

        loop {
            let step = match self.state {
                State::Idle => self.idle().await,
                State::UseToken => self.use_token().await,
                State::WaitForReply => self.wait_for_reply().await,
                State::DoneWithToken => self.done_with_token(),
                State::PassToken => self.pass_token().await,
                State::PollForMaster => self.poll_for_master().await,
                State::AnswerDataRequest => self.answer_data_request().await,
            };
            if step.is_err() {
                debug!("mstp station {} channel closed, stopping", self.station);
                return;
            }
        }
    }

    /// Observe-only mode: decode everything, transmit nothing.
    async fn run_passive(&mut self) {
        loop {
            match self.read_frame(T_NO_TOKEN).await {
                Ok(_) => {}
                Err(Closed) => {
                    debug!("mstp sniffer channel closed, stopping");
                    return;
                }
            }
        }
    }

    // -------------------------------------------------------------- states

    async fn idle(&mut self) -> Result<(), Closed> {
        let limit = T_NO_TOKEN + T_NO_TOKEN_STAGGER_PER_STATION * u32::from(self.station);
        match self.read_frame(limit).await? {
            Some(frame) => self.handle_idle_frame(frame).await,
            None => {
                // Token lost: regenerate by polling for the ring.
                debug!("station {}: no token for {limit:?}, regenerating", self.station);
                self.ps = self.next_address(self.station);
                self.ns = self.station;
                self.sole_master = false;
                self.maintenance_poll = false;
                self.state = State::PollForMaster;
            }
        }
        Ok(())
    }

    async fn handle_idle_frame(&mut self, frame: Frame) {
        let for_us = frame.destination == self.station;
        let broadcast = frame.destination == BROADCAST;
        if !for_us && !broadcast {
            return;
        }

        match frame.frame_type {
            FrameType::Token if for_us => {
                self.note_token_received();
                self.frame_count = 0;
                self.state = State::UseToken;
            }
            FrameType::PollForMaster => {
                if for_us {
                    // Answer within the slot window; no detour through the
                    // queue.
                    self.write_frame(&Frame::control(
                        FrameType::ReplyToPollForMaster,
                        frame.source,
                        self.station,
                    ))
                    .await;
                } else {
                    // Broadcast poll: reply when we next hold the token.
                    self.enqueue_control(FrameType::ReplyToPollForMaster, frame.source);
                }
            }
            FrameType::TestRequest => {
                let echo = Frame {
                    frame_type: FrameType::TestResponse,
                    destination: frame.source,
                    source: self.station,
                    data: frame.data,
                };
                self.write_frame(&echo).await;
            }
            FrameType::DataNotExpectingReply => {
                self.deliver(frame.data, frame.source);
            }
            FrameType::DataExpectingReply => {
                if for_us {
                    self.deliver(frame.data, frame.source);
                    self.reply_source = Some(frame.source);
                    self.state = State::AnswerDataRequest;
                } else {
                    // Broadcast requests cannot be answered on the wire;
                    // deliver and stay put.
                    self.deliver(frame.data, frame.source);
                }
            }
            _ => {}
        }
    }

    async fn use_token(&mut self) -> Result<(), Closed> {
        let pending = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match pending {
            None => {
                // Nothing to send: release the token.
                self.state = State::DoneWithToken;
            }
            Some(mut tx) => {
                let frame = Frame {
                    frame_type: tx.frame_type,
                    destination: tx.destination,
                    source: self.station,
                    data: std::mem::take(&mut tx.data),
                };
                self.write_frame(&frame).await;
                if let Some(done) = tx.done.take() {
                    let _ = done.send(());
                }
                self.frame_count = self.frame_count.saturating_add(1);
                self.state = if frame.frame_type.expects_reply() {
                    State::WaitForReply
                } else {
                    State::DoneWithToken
                };
            }
        }
        Ok(())
    }

    async fn wait_for_reply(&mut self) -> Result<(), Closed> {
        let deadline = Instant::now() + T_REPLY_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match self.read_frame(remaining).await? {
                Some(frame) => frame,
                None => {
                    // Reply never came: end this station's turn.
                    self.stat(|s| s.reply_timeouts += 1);
                    self.frame_count = self.max_info_frames;
                    self.state = State::DoneWithToken;
                    return Ok(());
                }
            };

            let for_us = frame.destination == self.station;
            match frame.frame_type {
                FrameType::PollForMaster if for_us => {
                    // Polls are answered in every state.
                    self.write_frame(&Frame::control(
                        FrameType::ReplyToPollForMaster,
                        frame.source,
                        self.station,
                    ))
                    .await;
                }
                FrameType::TestResponse if for_us => {
                    self.deliver(frame.data, frame.source);
                    self.state = State::DoneWithToken;
                    return Ok(());
                }
                FrameType::DataNotExpectingReply if for_us => {
                    self.deliver(frame.data, frame.source);
                    self.state = State::DoneWithToken;
                    return Ok(());
                }
                FrameType::ReplyPostponed if for_us => {
                    // The reply arrives on the peer's own token turn.
                    self.state = State::DoneWithToken;
                    return Ok(());
                }
                FrameType::Token | FrameType::ReplyToPollForMaster | FrameType::TestRequest => {
                    warn!(
                        "station {}: unexpected {:?} while waiting for reply",
                        self.station, frame.frame_type
                    );
                    self.state = State::Idle;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn done_with_token(&mut self) -> Result<(), Closed> {
        self.token_count = self.token_count.saturating_add(1);
        let queue_nonempty = !self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();

        if self.frame_count < self.max_info_frames && queue_nonempty {
            self.state = State::UseToken;
        } else if self.ns == self.station && !self.sole_master {
            // No successor known yet: search the whole address space for
            // one before this token can go anywhere.
            self.ps = self.next_address(self.station);
            self.maintenance_poll = false;
            self.state = State::PollForMaster;
        } else if self.token_count >= self.max_poll {
            // Maintenance poll: probe one candidate between us and NS for
            // stations that joined since the ring formed.
            self.token_count = 0;
            if self.ps == self.station {
                self.ps = self.next_address(self.ps);
            }
            self.maintenance_poll = true;
            self.state = State::PollForMaster;
        } else {
            self.state = State::PassToken;
        }
        Ok(())
    }

    async fn pass_token(&mut self) -> Result<(), Closed> {
        if self.sole_master {
            // No one to pass to; keep the token.
            self.frame_count = 0;
            self.state = State::UseToken;
            return Ok(());
        }

        for _attempt in 0..=self.retry_token {
            self.write_frame(&Frame::control(FrameType::Token, self.ns, self.station))
                .await;
            // Any traffic within the usage window proves the token was
            // taken.
            if let Some(frame) = self.read_frame(T_USAGE_TIMEOUT).await? {
                self.state = State::Idle;
                self.handle_idle_frame(frame).await;
                return Ok(());
            }
            trace!(
                "station {}: no activity after token pass to {}",
                self.station,
                self.ns
            );
        }

        // Successor is gone: drop it and rebuild from here.
        warn!(
            "station {}: token pass to {} failed, searching for a new successor",
            self.station, self.ns
        );
        self.stat(|s| s.token_pass_failures += 1);
        self.ps = self.next_address(self.ns);
        self.ns = self.station;
        self.maintenance_poll = false;
        self.state = State::PollForMaster;
        Ok(())
    }

    async fn poll_for_master(&mut self) -> Result<(), Closed> {
        self.write_frame(&Frame::control(
            FrameType::PollForMaster,
            self.ps,
            self.station,
        ))
        .await;

        let deadline = Instant::now() + T_USAGE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match self.read_frame(remaining).await? {
                Some(frame) => frame,
                None => break,
            };
            let for_us = frame.destination == self.station;
            match frame.frame_type {
                FrameType::ReplyToPollForMaster if for_us => {
                    // Found our successor.
                    self.ns = frame.source;
                    self.token_count = 0;
                    self.sole_master = false;
                    self.maintenance_poll = false;
                    self.ps = self.next_address(frame.source);
                    debug!(
                        "station {}: successor is {}",
                        self.station, self.ns
                    );
                    self.state = State::PassToken;
                    return Ok(());
                }
                FrameType::PollForMaster if for_us => {
                    // Another master is building the ring; defer to it.
                    self.write_frame(&Frame::control(
                        FrameType::ReplyToPollForMaster,
                        frame.source,
                        self.station,
                    ))
                    .await;
                    self.state = State::Idle;
                    return Ok(());
                }
                FrameType::Token if for_us => {
                    self.note_token_received();
                    self.frame_count = 0;
                    self.maintenance_poll = false;
                    self.state = State::UseToken;
                    return Ok(());
                }
                _ => {}
            }
        }

        // No reply from PS.
        if self.maintenance_poll {
            self.maintenance_poll = false;
            self.ps = self.next_address(self.ps);
            self.state = State::PassToken;
        } else {
            self.ps = self.next_address(self.ps);
            if self.ps == self.station {
                // Polled the whole address space with no answer.
                if !self.sole_master {
                    debug!("station {}: sole master on this segment", self.station);
                }
                self.sole_master = true;
                self.stat(|s| s.sole_master = true);
                self.frame_count = 0;
                self.state = State::UseToken;
            }
            // Otherwise stay in PollForMaster and probe the next address.
        }
        Ok(())
    }

    async fn answer_data_request(&mut self) -> Result<(), Closed> {
        let source = match self.reply_source.take() {
            Some(source) => source,
            None => {
                self.state = State::Idle;
                return Ok(());
            }
        };

        let deadline = Instant::now() + T_REPLY_DELAY;
        loop {
            // The upper layer replies by enqueueing a frame for the
            // requester.
            let reply = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue
                    .iter()
                    .position(|tx| tx.destination == source)
                    .and_then(|idx| queue.remove(idx))
            };
            if let Some(mut tx) = reply {
                let frame = Frame {
                    frame_type: tx.frame_type,
                    destination: source,
                    source: self.station,
                    data: std::mem::take(&mut tx.data),
                };
                self.write_frame(&frame).await;
                if let Some(done) = tx.done.take() {
                    let _ = done.send(());
                }
                self.state = State::Idle;
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Out of time: the reply goes out on our own token turn.
                self.write_frame(&Frame::control(
                    FrameType::ReplyPostponed,
                    source,
                    self.station,
                ))
                .await;
                self.state = State::Idle;
                return Ok(());
            }
            tokio::time::sleep(remaining.min(REPLY_POLL_INTERVAL)).await;
        }
    }

    // ------------------------------------------------------------- helpers

    /// Next address in the cyclic master address space.
    fn next_address(&self, from: u8) -> u8 {
        (from.wrapping_add(1)) % (self.max_master.wrapping_add(1).max(1))
    }

    fn note_token_received(&mut self) {
        let now = Instant::now();
        let loop_ms = self
            .last_token_at
            .map(|at| now.duration_since(at).as_millis() as u64);
        self.last_token_at = Some(now);
        self.stat(|s| {
            s.tokens_received += 1;
            s.sole_master = false;
            if let Some(ms) = loop_ms {
                s.token_loop_last_ms = ms;
                s.token_loop_max_ms = s.token_loop_max_ms.max(ms);
                s.token_loop_min_ms = if s.token_loop_min_ms == 0 {
                    ms
                } else {
                    s.token_loop_min_ms.min(ms)
                };
            }
        });
        self.sole_master = false;
    }

    fn enqueue_control(&self, frame_type: FrameType, destination: u8) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(PendingTx {
                frame_type,
                destination,
                data: Vec::new(),
                done: None,
            });
    }

    fn deliver(&self, data: Vec<u8>, source: u8) {
        if data.is_empty() {
            return;
        }
        let _ = self.delivered.send((data, source));
    }

    async fn write_frame(&mut self, frame: &Frame) {
        debug_assert!(frame.data.len() <= MAX_DATA_LEN);
        trace!(
            "station {}: tx {:?} -> {}",
            self.station,
            frame.frame_type,
            frame.destination
        );
        self.serial.write(&frame.encode()).await;
        self.stat(|s| s.frames_out += 1);
    }

    /// Read until one valid frame arrives or `limit` elapses.
    ///
    /// Every valid frame updates statistics and the observer channel;
    /// malformed input is logged and skipped. Returns `Err(Closed)` when
    /// the serial channel is gone.
    async fn read_frame(&mut self, limit: Duration) -> Result<Option<Frame>, Closed> {
        let deadline = Instant::now() + limit;
        loop {
            loop {
                match self.extractor.next_frame() {
                    Ok(Some(frame)) => {
                        self.note_frame_seen(&frame);
                        return Ok(Some(frame));
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("station {}: {err}", self.station);
                        self.stat(|s| match err {
                            crate::frame::ExtractError::BadHeaderCrc
                            | crate::frame::ExtractError::BadDataCrc => s.crc_errors += 1,
                            _ => s.frame_errors += 1,
                        });
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let mut buf = [0u8; 512];
            match self.serial.read(&mut buf, remaining).await {
                Ok(0) => return Err(Closed),
                Ok(n) => self.extractor.push_bytes(&buf[..n]),
                Err(SerialError::TimedOut) => return Ok(None),
                Err(err) => {
                    warn!("station {}: serial error: {err}", self.station);
                    return Err(Closed);
                }
            }
        }
    }

    fn note_frame_seen(&mut self, frame: &Frame) {
        let _ = self.observer.send(ObservedFrame {
            frame_type: frame.frame_type,
            destination: frame.destination,
            source: frame.source,
            data_len: frame.data.len() as u16,
        });
        let source = frame.source;
        self.stat(|s| {
            s.frames_in += 1;
            if source < 128 {
                s.discovered |= 1u128 << source;
            }
        });
    }

    fn stat(&self, f: impl FnOnce(&mut MstpStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}
