//! Inter-thread command and event types for the receiver/conductor pair.
//!
//! Command flows:
//! - Application → conductor: [`ClientCommand`] over a typed SPSC queue.
//! - Conductor → receiver: encoded [`ReceiverCommand`] records in the
//!   receiver command ring; a [`NewReceiveBufferEvent`] rides the bounded
//!   event queue so the ring itself only carries the wake-up.
//! - Receiver → conductor: encoded [`ConductorCommand`] records.

use crate::driver::subscription::TermBuffer;
use crate::protocol::command::{
    CommandError, command_type, decode_qualified_message, decode_subscriber_message,
};

/// Capacity of the term-buffer event queue (conductor → receiver).
pub const BUFFER_EVENT_QUEUE_CAPACITY: usize = 256;

/// Capacity of the application command queue (application → conductor).
pub const CLIENT_COMMAND_QUEUE_CAPACITY: usize = 64;

/// A provisioned term buffer crossing from the conductor to the receiver.
///
/// Carries the buffer by value: the conductor allocates, the receiver owns
/// it for the lifetime of the (session, term).
pub struct NewReceiveBufferEvent {
    /// Canonical destination URI the buffer belongs to.
    pub destination: String,
    /// Session the term was provisioned for.
    pub session_id: u64,
    /// Channel the session publishes on.
    pub channel_id: u64,
    /// Term the buffer backs.
    pub term_id: u64,
    /// The buffer itself.
    pub buffer: TermBuffer,
}

/// Commands issued by the embedding application, admitted by the conductor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Subscribe to channels on a destination.
    AddSubscription {
        channel_uri: String,
        channel_ids: Vec<u64>,
    },
    /// Release a previous subscription.
    RemoveSubscription {
        channel_uri: String,
        channel_ids: Vec<u64>,
    },
}

/// Decoded form of a record from the receiver command ring.
#[derive(Debug, PartialEq, Eq)]
pub enum ReceiverCommand {
    /// Register channels on a destination, binding its transport on first use.
    AddSubscriber {
        destination: String,
        channel_ids: Vec<u64>,
    },
    /// Release channels on a destination.
    RemoveSubscriber {
        destination: String,
        channel_ids: Vec<u64>,
    },
    /// A term buffer for this (destination, session, channel, term) is
    /// waiting on the event queue.
    NewReceiveBuffer {
        destination: String,
        session_id: u64,
        channel_id: u64,
        term_id: u64,
    },
}

/// Decoded form of a record from the conductor command ring.
#[derive(Debug, PartialEq, Eq)]
pub enum ConductorCommand {
    /// Provision a term buffer for a freshly seen session.
    CreateTermBuffer {
        destination: String,
        session_id: u64,
        channel_id: u64,
        term_id: u64,
    },
}

/// Decodes one receiver command ring record.
///
/// # Errors
///
/// Returns [`CommandError`] on malformed payloads or a type id that does not
/// belong on the receiver ring.
pub fn decode_receiver_command(
    msg_type: u32,
    payload: &[u8],
) -> Result<ReceiverCommand, CommandError> {
    match msg_type {
        command_type::ADD_SUBSCRIBER => {
            let msg = decode_subscriber_message(payload)?;
            Ok(ReceiverCommand::AddSubscriber {
                destination: msg.destination.to_owned(),
                channel_ids: msg.channel_ids,
            })
        }
        command_type::REMOVE_SUBSCRIBER => {
            let msg = decode_subscriber_message(payload)?;
            Ok(ReceiverCommand::RemoveSubscriber {
                destination: msg.destination.to_owned(),
                channel_ids: msg.channel_ids,
            })
        }
        command_type::NEW_RECEIVE_BUFFER_NOTIFICATION => {
            let msg = decode_qualified_message(payload)?;
            Ok(ReceiverCommand::NewReceiveBuffer {
                destination: msg.destination.to_owned(),
                session_id: msg.session_id,
                channel_id: msg.channel_id,
                term_id: msg.term_id,
            })
        }
        other => Err(CommandError::UnknownCommandType(other)),
    }
}

/// Decodes one conductor command ring record.
///
/// # Errors
///
/// Returns [`CommandError`] on malformed payloads or a type id that does not
/// belong on the conductor ring.
pub fn decode_conductor_command(
    msg_type: u32,
    payload: &[u8],
) -> Result<ConductorCommand, CommandError> {
    match msg_type {
        command_type::CREATE_TERM_BUFFER => {
            let msg = decode_qualified_message(payload)?;
            Ok(ConductorCommand::CreateTermBuffer {
                destination: msg.destination.to_owned(),
                session_id: msg.session_id,
                channel_id: msg.channel_id,
                term_id: msg.term_id,
            })
        }
        other => Err(CommandError::UnknownCommandType(other)),
    }
}
