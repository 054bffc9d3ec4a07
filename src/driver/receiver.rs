//! Receiver thread: command drain, transport polling, loss scanning.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use minstant::Instant;
use mio::{Events, Poll, Token};

use crate::driver::commands::{
    BUFFER_EVENT_QUEUE_CAPACITY, NewReceiveBufferEvent, ReceiverCommand, decode_receiver_command,
};
use crate::driver::handler::DataFrameHandler;
use crate::driver::loss::GapTracker;
use crate::driver::proxy::ConductorProxy;
use crate::driver::{DriverConfig, DriverError};
use crate::net::Destination;
use crate::sync::ring::RingConsumer;
use crate::sync::spsc::Consumer;
use crate::trace::{error, info, warn};

/// Largest datagram the receive buffer accommodates.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// The receiver actor: a non-blocking event loop owning every UDP transport,
/// the subscription registries, and SM/NAK emission.
///
/// All state is single-threaded; the only suspension point is the bounded
/// selector poll.
pub struct Receiver {
    poll: Poll,
    events: Events,
    /// Command ring written by the conductor.
    commands: RingConsumer,
    /// Term buffers handed over by the conductor.
    buffer_events: Consumer<NewReceiveBufferEvent, BUFFER_EVENT_QUEUE_CAPACITY>,
    /// Producer side of the conductor's command ring.
    conductor: ConductorProxy,
    /// Frame handlers keyed by canonical destination URI.
    handlers: HashMap<String, DataFrameHandler>,
    /// Poll token to destination key.
    tokens: HashMap<Token, String>,
    next_token: usize,
    recv_buf: Box<[u8]>,
    config: DriverConfig,
    shutdown: Arc<AtomicBool>,
}

impl Receiver {
    /// Creates the receiver over its command channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller cannot be created.
    pub fn new(
        config: DriverConfig,
        commands: RingConsumer,
        buffer_events: Consumer<NewReceiveBufferEvent, BUFFER_EVENT_QUEUE_CAPACITY>,
        conductor: ConductorProxy,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            commands,
            buffer_events,
            conductor,
            handlers: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
            config,
            shutdown,
        })
    }

    /// Runs the event loop until shutdown is flagged.
    ///
    /// # Errors
    ///
    /// Returns on unrecoverable failures: a broken poller or a buffer
    /// notification that does not match registry state (a logic error).
    pub fn run(&mut self) -> Result<(), DriverError> {
        info!("receiver loop started");
        while !self.shutdown.load(Ordering::Relaxed) {
            self.process_commands()?;
            self.poll_transports()?;
            self.scan_loss();
        }
        self.close();
        info!("receiver loop stopped");
        Ok(())
    }

    /// Drains the command ring and applies each command in FIFO order.
    ///
    /// # Errors
    ///
    /// Propagates logic errors from buffer notifications.
    pub fn process_commands(&mut self) -> Result<(), DriverError> {
        let mut pending = Vec::new();
        self.commands.read(|msg_type, payload| {
            pending.push(decode_receiver_command(msg_type, payload));
        });

        for decoded in pending {
            match decoded {
                Ok(command) => self.apply_command(command)?,
                Err(_e) => warn!(error = %_e, "dropping malformed command record"),
            }
        }
        Ok(())
    }

    fn apply_command(&mut self, command: ReceiverCommand) -> Result<(), DriverError> {
        match command {
            ReceiverCommand::AddSubscriber {
                destination,
                channel_ids,
            } => {
                self.add_subscriber(&destination, &channel_ids);
                Ok(())
            }
            ReceiverCommand::RemoveSubscriber {
                destination,
                channel_ids,
            } => {
                self.remove_subscriber(&destination, &channel_ids);
                Ok(())
            }
            ReceiverCommand::NewReceiveBuffer {
                destination,
                session_id,
                channel_id,
                term_id,
            } => self.on_new_receive_buffer(&destination, session_id, channel_id, term_id),
        }
    }

    fn add_subscriber(&mut self, destination: &str, channel_ids: &[u64]) {
        if !self.handlers.contains_key(destination) {
            let parsed = match Destination::parse(destination) {
                Ok(parsed) => parsed,
                Err(_e) => {
                    warn!(destination, error = %_e, "rejecting subscription with invalid destination");
                    return;
                }
            };

            let token = Token(self.next_token);
            let handler =
                match DataFrameHandler::new(parsed, self.poll.registry(), token, &self.config) {
                    Ok(handler) => handler,
                    Err(_e) => {
                        error!(destination, error = %_e, "failed to bind destination transport");
                        return;
                    }
                };
            info!(destination, local = %handler.local(), "destination transport bound");

            self.next_token += 1;
            self.tokens.insert(token, destination.to_owned());
            self.handlers.insert(destination.to_owned(), handler);
        }

        if let Some(handler) = self.handlers.get_mut(destination) {
            handler.add_channels(channel_ids);
        }
    }

    fn remove_subscriber(&mut self, destination: &str, channel_ids: &[u64]) {
        let Some(handler) = self.handlers.get_mut(destination) else {
            warn!(destination, "remove subscriber for unknown destination");
            return;
        };

        // Unknown channels are surfaced but do not poison the command loop.
        if let Err(_e) = handler.remove_channels(channel_ids) {
            warn!(destination, error = %_e, "remove subscriber failed");
        }

        if handler.channel_count() == 0 {
            if let Some(mut handler) = self.handlers.remove(destination) {
                handler.close(self.poll.registry());
            }
            self.tokens.retain(|_, d| d != destination);
            info!(destination, "destination transport closed");
        }
    }

    fn on_new_receive_buffer(
        &mut self,
        destination: &str,
        session_id: u64,
        channel_id: u64,
        term_id: u64,
    ) -> Result<(), DriverError> {
        // The conductor queues the event before writing the notification,
        // and both channels are FIFO, so the event must be here.
        let Some(event) = self.buffer_events.pop() else {
            error!(destination, session_id, "buffer notification without a queued event");
            return Err(DriverError::MissingBufferEvent);
        };
        debug_assert!(
            event.destination == destination
                && event.session_id == session_id
                && event.channel_id == channel_id
                && event.term_id == term_id,
            "buffer event out of step with its notification"
        );

        let Some(handler) = self.handlers.get_mut(&event.destination) else {
            return Err(DriverError::UnknownDestination(event.destination));
        };

        let tracker = GapTracker::new(event.term_id, self.config.nak_delay);
        handler.on_subscription_ready(event, Box::new(tracker))
    }

    /// Polls the selector and drains every readable transport.
    ///
    /// # Errors
    ///
    /// Returns an error only when the poller itself fails; per-transport
    /// receive errors are logged and the loop continues.
    pub fn poll_transports(&mut self) -> Result<(), DriverError> {
        let Self {
            poll,
            events,
            handlers,
            tokens,
            conductor,
            recv_buf,
            config,
            ..
        } = self;

        if let Err(e) = poll.poll(events, Some(config.poll_timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(DriverError::Io(e));
        }

        for event in events.iter() {
            let Some(destination) = tokens.get(&event.token()) else {
                continue;
            };
            let Some(handler) = handlers.get_mut(destination) else {
                continue;
            };
            if let Err(_e) = handler.process_inbound(recv_buf, conductor) {
                warn!(destination = %destination, error = %_e, "transport receive failed");
            }
        }
        Ok(())
    }

    /// Runs the loss handlers; send failures (short NAKs) surface here.
    pub fn scan_loss(&mut self) {
        let now = Instant::now();
        for (_destination, handler) in &mut self.handlers {
            if let Err(_e) = handler.poll_loss(now) {
                error!(destination = %_destination, error = %_e, "control frame send failed");
            }
        }
    }

    fn close(&mut self) {
        for (_, mut handler) in self.handlers.drain() {
            handler.close(self.poll.registry());
        }
        self.tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::proxy::ReceiverProxy;
    use crate::driver::subscription::TermBuffer;
    use crate::protocol::frame::{CURRENT_VERSION, align_frame_length, flags, frame_type};
    use crate::protocol::headers::{DATA_HEADER_LENGTH, DataHeader, StatusMessage};
    use crate::sync::ring::ring_buffer;
    use crate::sync::spsc;
    use std::time::Duration;

    struct Fixture {
        receiver: Receiver,
        receiver_proxy: ReceiverProxy,
        conductor_commands: RingConsumer,
        source: std::net::UdpSocket,
    }

    fn fixture() -> Fixture {
        let config = DriverConfig {
            nak_delay: Duration::ZERO,
            ..DriverConfig::default()
        };

        let (recv_cmd_tx, recv_cmd_rx) = ring_buffer(config.command_buffer_length);
        let (cond_cmd_tx, conductor_commands) = ring_buffer(config.command_buffer_length);
        let (event_tx, event_rx) = spsc::channel();

        let receiver = Receiver::new(
            config,
            recv_cmd_rx,
            event_rx,
            ConductorProxy::new(cond_cmd_tx),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let source = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        source.set_nonblocking(true).unwrap();

        Fixture {
            receiver,
            receiver_proxy: ReceiverProxy::new(recv_cmd_tx, event_tx),
            conductor_commands,
            source,
        }
    }

    fn data_frame(channel_id: u64, session_id: u64, term_id: u64, payload: &[u8]) -> Vec<u8> {
        let frame_length = DATA_HEADER_LENGTH + payload.len();
        let mut frame = vec![0u8; align_frame_length(frame_length)];
        let mut header = DataHeader::wrap(&mut frame[..], 0).unwrap();
        header
            .set_version(CURRENT_VERSION)
            .set_flags(flags::UNFRAGMENTED)
            .set_frame_type(frame_type::DATA)
            .set_frame_length(frame_length as u32)
            .set_session_id(session_id)
            .set_channel_id(channel_id)
            .set_term_id(term_id);
        frame[DATA_HEADER_LENGTH..frame_length].copy_from_slice(payload);
        frame
    }

    fn pump_until<F: FnMut(&mut Receiver) -> bool>(receiver: &mut Receiver, mut done: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            receiver.process_commands().unwrap();
            receiver.poll_transports().unwrap();
            receiver.scan_loss();
            if done(receiver) {
                return;
            }
            assert!(std::time::Instant::now() < deadline, "receiver never converged");
        }
    }

    #[test]
    fn add_and_remove_subscriber_commands() {
        let mut fixture = fixture();
        assert!(
            fixture
                .receiver_proxy
                .add_subscriber("udp://127.0.0.1:0", &[17, 42])
        );
        fixture.receiver.process_commands().unwrap();

        assert_eq!(fixture.receiver.handlers.len(), 1);
        let handler = fixture.receiver.handlers.values().next().unwrap();
        assert_eq!(handler.channel_count(), 2);

        assert!(
            fixture
                .receiver_proxy
                .remove_subscriber("udp://127.0.0.1:0", &[17, 42])
        );
        fixture.receiver.process_commands().unwrap();
        assert!(fixture.receiver.handlers.is_empty());
        assert!(fixture.receiver.tokens.is_empty());
    }

    #[test]
    fn invalid_destination_is_rejected_without_fatal_error() {
        let mut fixture = fixture();
        fixture.receiver_proxy.add_subscriber("tcp://nope", &[1]);
        fixture.receiver.process_commands().unwrap();
        assert!(fixture.receiver.handlers.is_empty());
    }

    #[test]
    fn notification_without_event_is_fatal() {
        let mut fixture = fixture();
        fixture
            .receiver_proxy
            .term_buffer_created("udp://127.0.0.1:0", 42, 17, 7);
        let err = fixture.receiver.process_commands().unwrap_err();
        assert!(matches!(err, DriverError::MissingBufferEvent));
    }

    #[test]
    fn inbound_frame_provisions_then_rebuilds_after_buffer_arrives() {
        let mut fixture = fixture();
        fixture
            .receiver_proxy
            .add_subscriber("udp://127.0.0.1:0", &[17]);
        fixture.receiver.process_commands().unwrap();

        let destination = fixture.receiver.handlers.keys().next().unwrap().clone();
        let local = fixture.receiver.handlers[&destination].local();

        // First frame: session is provisioned and the conductor is asked
        // for a buffer.
        fixture
            .source
            .send_to(&data_frame(17, 42, 7, b""), local.as_socket_addr())
            .unwrap();
        pump_until(&mut fixture.receiver, |receiver| {
            receiver.handlers[&destination]
                .subscription(17)
                .is_some_and(|s| s.session(42).is_some())
        });

        let mut requests = Vec::new();
        fixture.conductor_commands.read(|msg_type, payload| {
            requests.push(
                crate::driver::commands::decode_conductor_command(msg_type, payload).unwrap(),
            );
        });
        assert_eq!(requests.len(), 1);

        // Conductor answers: event on the queue, then the notification.
        fixture
            .receiver_proxy
            .new_receive_buffer(NewReceiveBufferEvent {
                destination: destination.clone(),
                session_id: 42,
                channel_id: 17,
                term_id: 7,
                buffer: TermBuffer::new(64 * 1024),
            })
            .ok()
            .unwrap();
        assert!(fixture.receiver_proxy.term_buffer_created(&destination, 42, 17, 7));
        fixture.receiver.process_commands().unwrap();

        // The initial SM reaches the source.
        let mut buf = [0u8; 256];
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        let sm_len = loop {
            match fixture.source.recv_from(&mut buf) {
                Ok((n, _)) => break n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    assert!(std::time::Instant::now() < deadline, "initial SM never arrived");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        };
        let sm = StatusMessage::wrap(&buf[..sm_len], 0).unwrap();
        assert_eq!(sm.frame_type(), frame_type::SM);
        assert_eq!(sm.session_id(), 42);

        // Payload now rebuilds into the bound buffer.
        fixture
            .source
            .send_to(&data_frame(17, 42, 7, b"hello"), local.as_socket_addr())
            .unwrap();
        pump_until(&mut fixture.receiver, |receiver| {
            receiver.handlers[&destination]
                .subscription(17)
                .and_then(|s| s.session(42))
                .and_then(|s| s.term_buffer(7))
                .is_some_and(|b| &b.as_slice()[..5] == b"hello")
        });
    }
}
