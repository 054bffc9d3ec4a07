//! Single-writer proxies for the receiver/conductor command channels.
//!
//! Each proxy owns the producer end of the peer thread's command ring and
//! encodes commands into a reusable scratch buffer, so steady-state command
//! traffic allocates nothing. The term-buffer hand-off additionally goes
//! through a bounded typed queue: the buffer itself rides the queue, the
//! ring only carries the wake-up notification.

use crate::driver::commands::{BUFFER_EVENT_QUEUE_CAPACITY, NewReceiveBufferEvent};
use crate::protocol::command::{
    command_type, encode_qualified_message, encode_subscriber_message,
};
use crate::sync::ring::RingProducer;
use crate::sync::spsc::Producer;
use crate::trace::warn;

/// Conductor-side proxy for writing into the receiver's command channel.
pub struct ReceiverProxy {
    commands: RingProducer,
    buffer_events: Producer<NewReceiveBufferEvent, BUFFER_EVENT_QUEUE_CAPACITY>,
    scratch: Vec<u8>,
}

impl ReceiverProxy {
    /// Creates the proxy over the receiver's command ring and event queue.
    #[must_use]
    pub fn new(
        commands: RingProducer,
        buffer_events: Producer<NewReceiveBufferEvent, BUFFER_EVENT_QUEUE_CAPACITY>,
    ) -> Self {
        Self {
            commands,
            buffer_events,
            scratch: Vec::with_capacity(256),
        }
    }

    /// Asks the receiver to register channels on a destination.
    ///
    /// Returns `false` when the command ring is full.
    pub fn add_subscriber(&mut self, destination: &str, channel_ids: &[u64]) -> bool {
        encode_subscriber_message(&mut self.scratch, destination, channel_ids);
        self.commands
            .write(command_type::ADD_SUBSCRIBER, &self.scratch)
    }

    /// Asks the receiver to release channels on a destination.
    ///
    /// Returns `false` when the command ring is full.
    pub fn remove_subscriber(&mut self, destination: &str, channel_ids: &[u64]) -> bool {
        encode_subscriber_message(&mut self.scratch, destination, channel_ids);
        self.commands
            .write(command_type::REMOVE_SUBSCRIBER, &self.scratch)
    }

    /// Notifies the receiver that a term buffer it asked for is waiting on
    /// the event queue.
    ///
    /// Returns `false` when the command ring is full.
    pub fn term_buffer_created(
        &mut self,
        destination: &str,
        session_id: u64,
        channel_id: u64,
        term_id: u64,
    ) -> bool {
        encode_qualified_message(&mut self.scratch, destination, session_id, channel_id, term_id);
        self.commands
            .write(command_type::NEW_RECEIVE_BUFFER_NOTIFICATION, &self.scratch)
    }

    /// Offers a provisioned buffer onto the bounded event queue.
    ///
    /// # Errors
    ///
    /// Returns the event back when the queue is full; the caller must back
    /// off and retry rather than drop the buffer.
    pub fn new_receive_buffer(
        &mut self,
        event: NewReceiveBufferEvent,
    ) -> Result<(), NewReceiveBufferEvent> {
        self.buffer_events.push(event)
    }
}

/// Receiver-side proxy for writing into the conductor's command channel.
pub struct ConductorProxy {
    commands: RingProducer,
    scratch: Vec<u8>,
}

impl ConductorProxy {
    /// Creates the proxy over the conductor's command ring.
    #[must_use]
    pub fn new(commands: RingProducer) -> Self {
        Self {
            commands,
            scratch: Vec::with_capacity(256),
        }
    }

    /// Fire-and-forget request for a term buffer for a freshly seen session.
    ///
    /// Returns `false` when the command ring is full.
    pub fn create_term_buffer(
        &mut self,
        destination: &str,
        session_id: u64,
        channel_id: u64,
        term_id: u64,
    ) -> bool {
        encode_qualified_message(&mut self.scratch, destination, session_id, channel_id, term_id);
        let ok = self
            .commands
            .write(command_type::CREATE_TERM_BUFFER, &self.scratch);
        if !ok {
            warn!(destination, session_id, "conductor command ring full");
        }
        ok
    }
}
