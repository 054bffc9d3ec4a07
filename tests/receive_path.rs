//! End-to-end tests for the receive path over loopback UDP.
//!
//! These drive a full driver (receiver + conductor threads) from the outside:
//! 1. The application subscribes to a channel on a destination.
//! 2. A fake source sends a setup data frame; the driver provisions a term
//!    buffer and answers with the initial Status Message.
//! 3. Payload frames rebuild into the term buffer; progress is advertised in
//!    SMs and gaps come back as NAKs.
//!
//! Run with tracing output:
//! ```bash
//! RUST_LOG=gale=trace cargo test --features tracing -- --nocapture
//! ```

use std::net::UdpSocket;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use gale::driver::{Driver, DriverConfig};
use gale::protocol::frame::{CURRENT_VERSION, align_frame_length, flags, frame_type};
use gale::protocol::headers::{
    DATA_HEADER_LENGTH, DataHeader, FrameHeader, Nak, SM_HEADER_LENGTH, StatusMessage,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(gale::init_tracing);
}

/// Reserves a port by binding and dropping a socket. A tiny race window,
/// acceptable in tests.
fn reserve_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    let port = socket.local_addr().expect("local addr").port();
    drop(socket);
    port
}

fn bind_source() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind source");
    socket.set_nonblocking(true).expect("set nonblocking");
    socket
}

fn data_frame(
    channel_id: u64,
    session_id: u64,
    term_id: u64,
    term_offset: u32,
    payload: &[u8],
) -> Vec<u8> {
    let frame_length = DATA_HEADER_LENGTH + payload.len();
    let mut frame = vec![0u8; align_frame_length(frame_length)];
    let mut header = DataHeader::wrap(&mut frame[..], 0).expect("frame fits header");
    header
        .set_version(CURRENT_VERSION)
        .set_flags(flags::UNFRAGMENTED)
        .set_frame_type(frame_type::DATA)
        .set_frame_length(frame_length as u32)
        .set_term_offset(term_offset)
        .set_session_id(session_id)
        .set_channel_id(channel_id)
        .set_term_id(term_id);
    frame[DATA_HEADER_LENGTH..frame_length].copy_from_slice(payload);
    frame
}

/// Receives control frames until `accept` returns a value or the timeout
/// elapses.
fn recv_control_frame<T>(
    source: &UdpSocket,
    timeout: Duration,
    mut accept: impl FnMut(&[u8]) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 256];
    loop {
        match source.recv_from(&mut buf) {
            Ok((len, _)) => {
                if let Some(value) = accept(&buf[..len]) {
                    return Some(value);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("source recv failed: {e}"),
        }
    }
}

#[test]
fn subscribe_rebuild_and_recover() {
    init_test_tracing();

    let config = DriverConfig {
        nak_delay: Duration::from_millis(10),
        ..DriverConfig::default()
    };
    let driver = Driver::spawn(config).expect("spawn driver");

    let port = reserve_port();
    let uri = format!("udp://127.0.0.1:{port}");
    driver.add_subscription(&uri, &[17]).expect("subscribe");

    let source = bind_source();
    let driver_addr = format!("127.0.0.1:{port}");

    // Announce session 42 on channel 17 until the driver has bound the
    // transport, provisioned a term buffer, and answered with the initial
    // SM. The header-only frame is idempotent on the driver side.
    let setup = data_frame(17, 42, 7, 0, b"");
    let deadline = Instant::now() + Duration::from_secs(5);
    let initial_sm = loop {
        source.send_to(&setup, &driver_addr).expect("send setup frame");
        let sm = recv_control_frame(&source, Duration::from_millis(50), |frame| {
            let header = FrameHeader::wrap(frame, 0).ok()?;
            (header.frame_type() == frame_type::SM).then(|| frame.to_vec())
        });
        if let Some(sm) = sm {
            break sm;
        }
        assert!(Instant::now() < deadline, "initial SM never arrived");
    };

    let sm = StatusMessage::wrap(&initial_sm[..], 0).expect("SM parses");
    assert_eq!(sm.version(), CURRENT_VERSION);
    assert_eq!(sm.flags(), 0);
    assert_eq!(sm.frame_length() as usize, SM_HEADER_LENGTH);
    assert_eq!(sm.session_id(), 42);
    assert_eq!(sm.channel_id(), 17);
    assert_eq!(sm.term_id(), 7);
    assert_eq!(sm.highest_contiguous_term_offset(), 0);
    assert_eq!(sm.receiver_window(), 1000);

    // In-order payload advances the contiguous position, which comes back
    // as a progress SM.
    source
        .send_to(&data_frame(17, 42, 7, 0, b"hello"), &driver_addr)
        .expect("send payload");
    let progress = recv_control_frame(&source, Duration::from_secs(2), |frame| {
        let header = FrameHeader::wrap(frame, 0).ok()?;
        if header.frame_type() != frame_type::SM {
            return None;
        }
        let sm = StatusMessage::wrap(frame, 0).ok()?;
        (sm.highest_contiguous_term_offset() == 5).then_some(())
    });
    assert!(progress.is_some(), "progress SM never arrived");

    // A frame landing past the contiguous position opens the gap 5..128,
    // which is NAKed after the loss delay.
    source
        .send_to(&data_frame(17, 42, 7, 128, b"world"), &driver_addr)
        .expect("send out-of-order payload");
    let nak = recv_control_frame(&source, Duration::from_secs(2), |frame| {
        let header = FrameHeader::wrap(frame, 0).ok()?;
        if header.frame_type() != frame_type::NAK {
            return None;
        }
        let nak = Nak::wrap(frame, 0).ok()?;
        Some((
            nak.session_id(),
            nak.channel_id(),
            nak.term_id(),
            nak.gap_term_offset(),
            nak.gap_length(),
        ))
    })
    .expect("NAK never arrived");
    assert_eq!(nak, (42, 17, 7, 5, 123));

    // Retransmission closes the gap; the contiguous position jumps over the
    // out-of-order island and a matching SM is advertised.
    source
        .send_to(&data_frame(17, 42, 7, 5, &[7u8; 123]), &driver_addr)
        .expect("send retransmission");
    let recovered = recv_control_frame(&source, Duration::from_secs(2), |frame| {
        let header = FrameHeader::wrap(frame, 0).ok()?;
        if header.frame_type() != frame_type::SM {
            return None;
        }
        let sm = StatusMessage::wrap(frame, 0).ok()?;
        (sm.highest_contiguous_term_offset() == 133).then_some(())
    });
    assert!(recovered.is_some(), "recovery SM never arrived");

    driver.shutdown();
}

#[test]
fn removed_subscription_goes_silent() {
    init_test_tracing();

    let driver = Driver::spawn(DriverConfig::default()).expect("spawn driver");
    let port = reserve_port();
    let uri = format!("udp://127.0.0.1:{port}");
    driver.add_subscription(&uri, &[17]).expect("subscribe");

    let source = bind_source();
    let driver_addr = format!("127.0.0.1:{port}");

    // Wait for the subscription to become live.
    let setup = data_frame(17, 42, 7, 0, b"");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        source.send_to(&setup, &driver_addr).expect("send setup frame");
        let sm = recv_control_frame(&source, Duration::from_millis(50), |frame| {
            let header = FrameHeader::wrap(frame, 0).ok()?;
            (header.frame_type() == frame_type::SM).then_some(())
        });
        if sm.is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "subscription never became live");
    }

    driver.remove_subscription(&uri, &[17]).expect("unsubscribe");
    // Give the command time to drain through conductor and receiver.
    thread::sleep(Duration::from_millis(200));

    // A new session on the closed channel gets no answer.
    source
        .send_to(&data_frame(17, 43, 9, 0, b""), &driver_addr)
        .expect("send frame after removal");
    let answer = recv_control_frame(&source, Duration::from_millis(300), |frame| {
        let header = FrameHeader::wrap(frame, 0).ok()?;
        let sm = StatusMessage::wrap(frame, 0).ok()?;
        (header.frame_type() == frame_type::SM && sm.session_id() == 43).then_some(())
    });
    assert!(answer.is_none(), "closed channel still answered");

    driver.shutdown();
}
