//! Conductor thread: subscription admission and term buffer provisioning.
//!
//! The conductor owns the resource side of the driver: it admits
//! application subscription commands into the receiver's command ring, and
//! answers the receiver's `CREATE_TERM_BUFFER` requests by allocating a term
//! buffer and handing it over (event queue first, wake-up notification
//! second, so the receiver always finds the buffer when the notification
//! lands).
//!
//! Every outbound channel is bounded, so undelivered work is parked in FIFO
//! retry queues instead of being dropped; a full ring or event queue only
//! delays the hand-off.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::driver::DriverConfig;
use crate::driver::commands::{
    CLIENT_COMMAND_QUEUE_CAPACITY, ClientCommand, ConductorCommand, NewReceiveBufferEvent,
    decode_conductor_command,
};
use crate::driver::proxy::ReceiverProxy;
use crate::driver::subscription::TermBuffer;
use crate::sync::ring::RingConsumer;
use crate::sync::spsc::Consumer;
use crate::trace::{debug, info, warn};

/// Sleep between loop iterations when no work was done.
const IDLE_BACKOFF: Duration = Duration::from_micros(100);

/// A buffer hand-off whose notification has not yet been written.
struct PendingNotification {
    destination: String,
    session_id: u64,
    channel_id: u64,
    term_id: u64,
}

/// The conductor actor.
pub struct Conductor {
    /// Commands from the embedding application.
    client_commands: Consumer<ClientCommand, CLIENT_COMMAND_QUEUE_CAPACITY>,
    /// Command ring written by the receiver.
    commands: RingConsumer,
    receiver_proxy: ReceiverProxy,
    term_buffer_length: usize,
    /// Terms already provisioned, so a replayed request allocates nothing.
    provisioned: HashSet<(String, u64, u64, u64)>,
    /// Admitted client commands waiting for ring space.
    pending_commands: VecDeque<ClientCommand>,
    /// Allocated buffers waiting for event-queue space.
    pending_events: VecDeque<NewReceiveBufferEvent>,
    /// Queued buffers waiting for their ring notification.
    pending_notifications: VecDeque<PendingNotification>,
    shutdown: Arc<AtomicBool>,
}

impl Conductor {
    /// Creates the conductor over its command channels.
    #[must_use]
    pub fn new(
        config: &DriverConfig,
        client_commands: Consumer<ClientCommand, CLIENT_COMMAND_QUEUE_CAPACITY>,
        commands: RingConsumer,
        receiver_proxy: ReceiverProxy,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client_commands,
            commands,
            receiver_proxy,
            term_buffer_length: config.term_buffer_length,
            provisioned: HashSet::new(),
            pending_commands: VecDeque::new(),
            pending_events: VecDeque::new(),
            pending_notifications: VecDeque::new(),
            shutdown,
        }
    }

    /// Runs the conductor loop until shutdown is flagged.
    pub fn run(&mut self) {
        info!("conductor loop started");
        while !self.shutdown.load(Ordering::Relaxed) {
            let worked = self.duty_cycle();
            if worked == 0 {
                thread::sleep(IDLE_BACKOFF);
            }
        }
        info!("conductor loop stopped");
    }

    /// One pass over every work source; returns the amount of work done.
    pub fn duty_cycle(&mut self) -> usize {
        let mut worked = 0;
        worked += self.admit_client_commands();
        worked += self.process_receiver_requests();
        worked += self.flush_buffer_handoffs();
        worked
    }

    /// Moves application commands into the receiver's command ring.
    fn admit_client_commands(&mut self) -> usize {
        while let Some(command) = self.client_commands.pop() {
            self.pending_commands.push_back(command);
        }

        let mut forwarded = 0;
        while let Some(command) = self.pending_commands.front() {
            let written = match command {
                ClientCommand::AddSubscription {
                    channel_uri,
                    channel_ids,
                } => self.receiver_proxy.add_subscriber(channel_uri, channel_ids),
                ClientCommand::RemoveSubscription {
                    channel_uri,
                    channel_ids,
                } => self
                    .receiver_proxy
                    .remove_subscriber(channel_uri, channel_ids),
            };
            if !written {
                break; // ring full, keep FIFO order and retry next cycle
            }
            self.pending_commands.pop_front();
            forwarded += 1;
        }
        forwarded
    }

    /// Answers `CREATE_TERM_BUFFER` requests with freshly allocated buffers.
    fn process_receiver_requests(&mut self) -> usize {
        let mut requests = Vec::new();
        self.commands.read(|msg_type, payload| {
            requests.push(decode_conductor_command(msg_type, payload));
        });

        let mut handled = 0;
        for decoded in requests {
            match decoded {
                Ok(ConductorCommand::CreateTermBuffer {
                    destination,
                    session_id,
                    channel_id,
                    term_id,
                }) => {
                    let key = (destination.clone(), session_id, channel_id, term_id);
                    if !self.provisioned.insert(key) {
                        debug!(session_id, term_id, "term already provisioned, ignoring");
                        continue;
                    }

                    debug!(
                        destination = %destination,
                        session_id,
                        channel_id,
                        term_id,
                        capacity = self.term_buffer_length,
                        "provisioning term buffer"
                    );
                    self.pending_events.push_back(NewReceiveBufferEvent {
                        destination,
                        session_id,
                        channel_id,
                        term_id,
                        buffer: TermBuffer::new(self.term_buffer_length),
                    });
                    handled += 1;
                }
                Err(_e) => warn!(error = %_e, "dropping malformed receiver request"),
            }
        }
        handled
    }

    /// Pushes queued buffers onto the event queue and writes their wake-up
    /// notifications, preserving FIFO order across both channels.
    fn flush_buffer_handoffs(&mut self) -> usize {
        let mut flushed = 0;

        // Notifications owed for buffers already on the event queue go first.
        while let Some(pending) = self.pending_notifications.front() {
            let written = self.receiver_proxy.term_buffer_created(
                &pending.destination,
                pending.session_id,
                pending.channel_id,
                pending.term_id,
            );
            if !written {
                return flushed;
            }
            self.pending_notifications.pop_front();
            flushed += 1;
        }

        while let Some(event) = self.pending_events.pop_front() {
            let notification = PendingNotification {
                destination: event.destination.clone(),
                session_id: event.session_id,
                channel_id: event.channel_id,
                term_id: event.term_id,
            };
            match self.receiver_proxy.new_receive_buffer(event) {
                Ok(()) => {
                    self.pending_notifications.push_back(notification);
                    flushed += 1;
                }
                Err(event) => {
                    // Event queue full: back off, retry next cycle.
                    self.pending_events.push_front(event);
                    break;
                }
            }
        }

        // Whatever notifications the new hand-offs produced.
        while let Some(pending) = self.pending_notifications.front() {
            let written = self.receiver_proxy.term_buffer_created(
                &pending.destination,
                pending.session_id,
                pending.channel_id,
                pending.term_id,
            );
            if !written {
                break;
            }
            self.pending_notifications.pop_front();
            flushed += 1;
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::commands::{ReceiverCommand, decode_receiver_command};
    use crate::driver::proxy::ConductorProxy;
    use crate::sync::ring::ring_buffer;
    use crate::sync::spsc;

    struct Fixture {
        conductor: Conductor,
        client_tx: spsc::Producer<ClientCommand, CLIENT_COMMAND_QUEUE_CAPACITY>,
        conductor_proxy: ConductorProxy,
        receiver_commands: RingConsumer,
        buffer_events: spsc::Consumer<
            NewReceiveBufferEvent,
            { crate::driver::commands::BUFFER_EVENT_QUEUE_CAPACITY },
        >,
    }

    fn fixture() -> Fixture {
        let config = DriverConfig::default();
        let (recv_cmd_tx, receiver_commands) = ring_buffer(config.command_buffer_length);
        let (cond_cmd_tx, cond_cmd_rx) = ring_buffer(config.command_buffer_length);
        let (event_tx, buffer_events) = spsc::channel();
        let (client_tx, client_rx) = spsc::channel();

        let conductor = Conductor::new(
            &config,
            client_rx,
            cond_cmd_rx,
            ReceiverProxy::new(recv_cmd_tx, event_tx),
            Arc::new(AtomicBool::new(false)),
        );

        Fixture {
            conductor,
            client_tx,
            conductor_proxy: ConductorProxy::new(cond_cmd_tx),
            receiver_commands,
            buffer_events,
        }
    }

    fn drain_receiver_ring(fixture: &Fixture) -> Vec<ReceiverCommand> {
        let mut commands = Vec::new();
        fixture.receiver_commands.read(|msg_type, payload| {
            commands.push(decode_receiver_command(msg_type, payload).unwrap());
        });
        commands
    }

    #[test]
    fn client_commands_are_forwarded() {
        let mut fixture = fixture();
        fixture
            .client_tx
            .push(ClientCommand::AddSubscription {
                channel_uri: "udp://127.0.0.1:40123".to_owned(),
                channel_ids: vec![17],
            })
            .unwrap();
        fixture
            .client_tx
            .push(ClientCommand::RemoveSubscription {
                channel_uri: "udp://127.0.0.1:40123".to_owned(),
                channel_ids: vec![17],
            })
            .unwrap();

        fixture.conductor.duty_cycle();

        let commands = drain_receiver_ring(&fixture);
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0], ReceiverCommand::AddSubscriber { .. }));
        assert!(matches!(commands[1], ReceiverCommand::RemoveSubscriber { .. }));
    }

    #[test]
    fn buffer_request_produces_event_then_notification() {
        let mut fixture = fixture();
        fixture
            .conductor_proxy
            .create_term_buffer("udp://127.0.0.1:40123", 42, 17, 7);

        fixture.conductor.duty_cycle();

        let event = fixture.buffer_events.pop().expect("event queued");
        assert_eq!(event.session_id, 42);
        assert_eq!(
            event.buffer.capacity(),
            DriverConfig::default().term_buffer_length
        );

        let commands = drain_receiver_ring(&fixture);
        assert_eq!(
            commands,
            vec![ReceiverCommand::NewReceiveBuffer {
                destination: "udp://127.0.0.1:40123".to_owned(),
                session_id: 42,
                channel_id: 17,
                term_id: 7,
            }]
        );
    }

    #[test]
    fn duplicate_buffer_request_is_ignored() {
        let mut fixture = fixture();
        fixture
            .conductor_proxy
            .create_term_buffer("udp://127.0.0.1:40123", 42, 17, 7);
        fixture
            .conductor_proxy
            .create_term_buffer("udp://127.0.0.1:40123", 42, 17, 7);

        fixture.conductor.duty_cycle();

        assert!(fixture.buffer_events.pop().is_some());
        assert!(fixture.buffer_events.pop().is_none());
    }

    #[test]
    fn handoff_retries_when_event_queue_is_full() {
        let mut fixture = fixture();

        // Saturate the event queue with unrelated hand-offs.
        for term_id in 0..crate::driver::commands::BUFFER_EVENT_QUEUE_CAPACITY as u64 {
            fixture
                .conductor_proxy
                .create_term_buffer("udp://127.0.0.1:40123", 1, 1, term_id);
        }
        fixture
            .conductor_proxy
            .create_term_buffer("udp://127.0.0.1:40123", 42, 17, 7);
        fixture.conductor.duty_cycle();

        // The overflow hand-off is parked, not dropped.
        assert_eq!(fixture.conductor.pending_events.len(), 1);

        // Draining the queue lets the retry succeed.
        while fixture.buffer_events.pop().is_some() {}
        fixture.conductor.duty_cycle();
        assert!(fixture.conductor.pending_events.is_empty());
        let event = fixture.buffer_events.pop().expect("retried hand-off");
        assert_eq!(event.session_id, 42);
    }
}
