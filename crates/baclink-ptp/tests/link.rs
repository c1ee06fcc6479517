//! PTP link-engine tests over in-memory serial pairs.
//!
//! One side is usually a real transport; the other is a scripted peer
//! speaking raw frames so handshake and flow-control behavior can be
//! asserted byte by byte. All tests run with a paused clock.

use baclink_datalink::{DataLink, DataLinkAddress, MemorySerial, SerialLink};
use baclink_ptp::codec::{PtpDecoder, PtpEvent, PtpFrame, PtpFrameType, PTP_GREETING};
use baclink_ptp::{DisconnectReason, PtpConfig, PtpRole, PtpTransport};
use std::time::Duration;
use tokio::time::timeout;

/// Scripted raw-frame peer on the far end of a serial pair.
struct Peer {
    line: MemorySerial,
    decoder: PtpDecoder,
}

impl Peer {
    fn new(line: MemorySerial) -> Self {
        Self {
            line,
            decoder: PtpDecoder::new(),
        }
    }

    async fn next_event(&mut self, limit: Duration) -> PtpEvent {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match self.decoder.next_event() {
                Ok(Some(event)) => return event,
                Ok(None) => {}
                Err(err) => panic!("peer decode error: {err}"),
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            assert!(!remaining.is_zero(), "peer timed out waiting for an event");
            let mut buf = [0u8; 512];
            match self.line.read(&mut buf, remaining).await {
                Ok(n) if n > 0 => self.decoder.push_bytes(&buf[..n]),
                other => panic!("peer read failed: {other:?}"),
            }
        }
    }

    /// Next frame, skipping greetings.
    async fn next_frame(&mut self, limit: Duration) -> PtpFrame {
        loop {
            match self.next_event(limit).await {
                PtpEvent::Greeting => {}
                PtpEvent::Frame(frame) => return frame,
            }
        }
    }

    async fn expect_silence(&mut self, limit: Duration) {
        assert_eq!(self.decoder.next_event(), Ok(None), "peer had buffered data");
        let mut buf = [0u8; 512];
        match self.line.read(&mut buf, limit).await {
            Err(baclink_datalink::SerialError::TimedOut) => {}
            other => panic!("expected silence, got {other:?}"),
        }
    }

    async fn write(&mut self, frame: PtpFrame) {
        self.line.write(&frame.encode()).await;
    }

    /// Play the server side of the handshake against a client transport.
    async fn accept_client(&mut self) {
        assert_eq!(
            self.next_event(Duration::from_secs(5)).await,
            PtpEvent::Greeting
        );
        self.line.write(PTP_GREETING).await;
        let request = self.next_frame(Duration::from_secs(5)).await;
        assert_eq!(request.frame_type, PtpFrameType::ConnectRequest);
        self.write(PtpFrame::control(PtpFrameType::ConnectResponse))
            .await;
    }
}

/// The engine flips its connected flag from its own task; poll for it
/// instead of asserting right after the handshake bytes land.
async fn wait_connected(link: &PtpTransport) {
    for _ in 0..100 {
        if link.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("link never reported connected");
}

fn client() -> PtpConfig {
    PtpConfig {
        role: PtpRole::Client,
        password: None,
    }
}

fn server() -> PtpConfig {
    PtpConfig {
        role: PtpRole::Server,
        password: None,
    }
}

#[tokio::test(start_paused = true)]
async fn client_and_server_connect_and_exchange_data() {
    let (serial_c, serial_s) = MemorySerial::pair();
    let c = PtpTransport::start(serial_c, client());
    let s = PtpTransport::start(serial_s, server());

    c.send_and_wait(
        DataLinkAddress::ptp(),
        &[0x01, 0x02, 0x03],
        Duration::from_secs(30),
    )
    .await
    .unwrap();

    let mut buf = [0u8; 64];
    let (n, src) = timeout(Duration::from_secs(30), s.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);
    assert_eq!(src, DataLinkAddress::ptp());

    // And the other way.
    s.send_and_wait(DataLinkAddress::ptp(), &[0xAA], Duration::from_secs(30))
        .await
        .unwrap();
    let (n, _) = timeout(Duration::from_secs(30), c.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &[0xAA]);

    assert!(c.is_connected());
    assert!(s.is_connected());
}

#[tokio::test(start_paused = true)]
async fn wrong_client_password_gets_invalid_password_disconnect() {
    let (serial_s, line) = MemorySerial::pair();
    let _s = PtpTransport::start(
        serial_s,
        PtpConfig {
            role: PtpRole::Server,
            password: Some("secret".into()),
        },
    );
    let mut peer = Peer::new(line);

    peer.line.write(PTP_GREETING).await;
    assert_eq!(
        peer.next_event(Duration::from_secs(5)).await,
        PtpEvent::Greeting
    );
    peer.write(PtpFrame::with_data(
        PtpFrameType::ConnectRequest,
        b"wrong".to_vec(),
    ))
    .await;

    let frame = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(frame.frame_type, PtpFrameType::DisconnectRequest);
    assert_eq!(frame.data, vec![DisconnectReason::InvalidPassword as u8]);
}

#[tokio::test(start_paused = true)]
async fn wrong_password_in_connect_response_is_never_a_silent_connect() {
    let (serial_c, line) = MemorySerial::pair();
    let c = PtpTransport::start(
        serial_c,
        PtpConfig {
            role: PtpRole::Client,
            password: Some("secret".into()),
        },
    );
    let mut peer = Peer::new(line);

    assert_eq!(
        peer.next_event(Duration::from_secs(5)).await,
        PtpEvent::Greeting
    );
    let request = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(request.frame_type, PtpFrameType::ConnectRequest);
    assert_eq!(request.data, b"secret".to_vec());

    peer.write(PtpFrame::with_data(
        PtpFrameType::ConnectResponse,
        b"impostor".to_vec(),
    ))
    .await;

    let frame = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(frame.frame_type, PtpFrameType::DisconnectRequest);
    assert_eq!(frame.data, vec![DisconnectReason::InvalidPassword as u8]);
    assert!(!c.is_connected());
}

#[tokio::test(start_paused = true)]
async fn data_frames_alternate_and_wait_for_the_ack_gate() {
    let (serial_c, line) = MemorySerial::pair();
    let c = PtpTransport::start(serial_c, client());
    let mut peer = Peer::new(line);
    peer.accept_client().await;

    c.send(DataLinkAddress::ptp(), &[0x11u8 /* stuffed on the wire */])
        .await
        .unwrap();
    c.send(DataLinkAddress::ptp(), &[0x22]).await.unwrap();

    let first = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(first.frame_type, PtpFrameType::Data0);
    assert_eq!(first.data, vec![0x11]);

    // Unacked: the second frame must stay queued.
    peer.expect_silence(Duration::from_secs(2)).await;

    // An XOFF ack completes the first transfer but keeps the gate shut.
    peer.write(PtpFrame::control(PtpFrameType::Ack0Xoff)).await;
    peer.expect_silence(Duration::from_secs(2)).await;

    // XON heartbeat reopens the gate; the next frame flips the sequence.
    peer.write(PtpFrame::control(PtpFrameType::HeartbeatXon))
        .await;
    let second = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(second.frame_type, PtpFrameType::Data1);
    assert_eq!(second.data, vec![0x22]);
}

#[tokio::test(start_paused = true)]
async fn duplicate_data_is_reacked_but_delivered_once() {
    let (serial_c, line) = MemorySerial::pair();
    let c = PtpTransport::start(serial_c, client());
    let mut peer = Peer::new(line);
    peer.accept_client().await;

    peer.write(PtpFrame::with_data(PtpFrameType::Data0, vec![0x42]))
        .await;
    let ack = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(ack.frame_type, PtpFrameType::Ack0Xon);

    // Retransmission of the same sequence number.
    peer.write(PtpFrame::with_data(PtpFrameType::Data0, vec![0x42]))
        .await;
    let ack = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(ack.frame_type, PtpFrameType::Ack0Xon);

    let mut buf = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(5), c.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &[0x42]);
    // Only one delivery may be pending.
    assert!(timeout(Duration::from_secs(2), c.recv(&mut buf))
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_request_is_echoed_verbatim() {
    let (serial_c, line) = MemorySerial::pair();
    let _c = PtpTransport::start(serial_c, client());
    let mut peer = Peer::new(line);
    peer.accept_client().await;

    let payload = vec![0xDE, 0x10, 0x13, 0xAD];
    peer.write(PtpFrame::with_data(
        PtpFrameType::TestRequest,
        payload.clone(),
    ))
    .await;
    let echo = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(echo.frame_type, PtpFrameType::TestResponse);
    assert_eq!(echo.data, payload);
}

#[tokio::test(start_paused = true)]
async fn idle_link_sends_heartbeat_xon() {
    let (serial_c, line) = MemorySerial::pair();
    let c = PtpTransport::start(serial_c, client());
    let mut peer = Peer::new(line);
    peer.accept_client().await;

    let frame = peer.next_frame(Duration::from_secs(20)).await;
    assert_eq!(frame.frame_type, PtpFrameType::HeartbeatXon);
    assert!(c.stats().heartbeats_sent >= 1);
}

#[tokio::test(start_paused = true)]
async fn peer_disconnect_triggers_reconnect_handshake() {
    let (serial_c, line) = MemorySerial::pair();
    let c = PtpTransport::start(serial_c, client());
    let mut peer = Peer::new(line);
    peer.accept_client().await;
    wait_connected(&c).await;

    peer.write(PtpFrame::with_data(
        PtpFrameType::DisconnectRequest,
        vec![DisconnectReason::NoMoreData as u8],
    ))
    .await;
    let reply = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(reply.frame_type, PtpFrameType::DisconnectResponse);

    // After the fixed backoff the client greets again on its own.
    peer.accept_client().await;
    wait_connected(&c).await;
}

#[tokio::test(start_paused = true)]
async fn unacked_frame_is_retransmitted_after_reconnect() {
    let (serial_c, line) = MemorySerial::pair();
    let c = PtpTransport::start(serial_c, client());
    let mut peer = Peer::new(line);
    peer.accept_client().await;

    c.send(DataLinkAddress::ptp(), &[0x7E, 0x7F]).await.unwrap();
    let first = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(first.frame_type, PtpFrameType::Data0);
    assert_eq!(first.data, vec![0x7E, 0x7F]);

    // Drop the connection instead of acking.
    peer.write(PtpFrame::with_data(
        PtpFrameType::DisconnectRequest,
        vec![DisconnectReason::Other as u8],
    ))
    .await;
    let reply = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(reply.frame_type, PtpFrameType::DisconnectResponse);

    // The same payload must come back on the fresh connection.
    peer.accept_client().await;
    let retry = peer.next_frame(Duration::from_secs(10)).await;
    assert_eq!(retry.frame_type, PtpFrameType::Data0);
    assert_eq!(retry.data, vec![0x7E, 0x7F]);
    peer.write(PtpFrame::control(PtpFrameType::Ack0Xon)).await;

    // And the gate is open again for new traffic.
    c.send(DataLinkAddress::ptp(), &[0x01]).await.unwrap();
    let next = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(next.frame_type, PtpFrameType::Data1);
    assert_eq!(next.data, vec![0x01]);
}

#[tokio::test(start_paused = true)]
async fn lost_ack_is_covered_by_retransmission() {
    let (serial_c, line) = MemorySerial::pair();
    let c = PtpTransport::start(serial_c, client());
    let mut peer = Peer::new(line);
    peer.accept_client().await;

    c.send(DataLinkAddress::ptp(), &[0x55]).await.unwrap();
    let first = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(first.frame_type, PtpFrameType::Data0);

    // Say nothing: the ack timeout must put the same frame back on
    // the wire with the same sequence number.
    let retry = peer.next_frame(Duration::from_secs(10)).await;
    assert_eq!(retry.frame_type, PtpFrameType::Data0);
    assert_eq!(retry.data, vec![0x55]);

    peer.write(PtpFrame::control(PtpFrameType::Ack0Xon)).await;
    c.send(DataLinkAddress::ptp(), &[0x56]).await.unwrap();
    let next = peer.next_frame(Duration::from_secs(5)).await;
    assert_eq!(next.frame_type, PtpFrameType::Data1);
    assert_eq!(next.data, vec![0x56]);
}
