//! Control-plane command encoding for the receiver/conductor ring buffers.
//!
//! Commands cross the thread boundary as length-prefixed records whose
//! payload is encoded here. Two shapes cover the whole message set:
//!
//! | Message | Layout |
//! |---------|--------|
//! | subscriber message (`ADD_SUBSCRIBER`, `REMOVE_SUBSCRIBER`) | `[channel_count:4][channel_id:8 x n][destination]` |
//! | qualified message (`NEW_RECEIVE_BUFFER_NOTIFICATION`, `CREATE_TERM_BUFFER`) | `[session_id:8][channel_id:8][term_id:8][destination]` |
//!
//! All integers are little-endian. `destination` is a UTF-8 channel URI with
//! a `u32` length prefix.

use thiserror::Error;

/// Command type identifiers carried in the ring buffer record header.
pub mod command_type {
    /// Conductor → receiver: register channels on a destination.
    pub const ADD_SUBSCRIBER: u32 = 0x01;

    /// Conductor → receiver: release channels on a destination.
    pub const REMOVE_SUBSCRIBER: u32 = 0x02;

    /// Conductor → receiver: a term buffer is waiting on the event queue.
    pub const NEW_RECEIVE_BUFFER_NOTIFICATION: u32 = 0x03;

    /// Receiver → conductor: provision a term buffer.
    pub const CREATE_TERM_BUFFER: u32 = 0x04;
}

/// Errors decoding a command payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Payload too short for the message shape.
    #[error("command payload too small: need {need} more bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// Destination bytes are not valid UTF-8.
    #[error("destination is not valid UTF-8")]
    Utf8,
    /// Record carried a type id outside the command set.
    #[error("unknown command type: 0x{0:02x}")]
    UnknownCommandType(u32),
}

/// Writer for encoding command payloads into a reusable scratch buffer.
///
/// The buffer is cleared on construction and grows only on the cold path;
/// steady-state encoding reuses its capacity.
struct CommandWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> CommandWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Appends a length-prefixed UTF-8 string, returning the total number of
    /// bytes consumed including the 4-byte prefix.
    fn put_string(&mut self, s: &str) -> usize {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        4 + s.len()
    }
}

struct CommandReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> CommandReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CommandError> {
        if self.remaining() < len {
            return Err(CommandError::BufferTooSmall {
                need: len,
                have: self.remaining(),
            });
        }
        let slice = &self.buf[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32, CommandError> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(arr))
    }

    fn take_u64(&mut self) -> Result<u64, CommandError> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(arr))
    }

    fn take_string(&mut self) -> Result<&'a str, CommandError> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| CommandError::Utf8)
    }
}

/// A decoded subscriber message (borrowing the destination from the record).
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriberMessage<'a> {
    pub destination: &'a str,
    pub channel_ids: Vec<u64>,
}

/// A decoded qualified message.
#[derive(Debug, PartialEq, Eq)]
pub struct QualifiedMessage<'a> {
    pub destination: &'a str,
    pub session_id: u64,
    pub channel_id: u64,
    pub term_id: u64,
}

/// Encodes a subscriber message into `buf`, replacing its contents.
pub fn encode_subscriber_message(buf: &mut Vec<u8>, destination: &str, channel_ids: &[u64]) {
    let mut w = CommandWriter::new(buf);
    w.put_u32(channel_ids.len() as u32);
    for &id in channel_ids {
        w.put_u64(id);
    }
    w.put_string(destination);
}

/// Decodes a subscriber message.
///
/// # Errors
///
/// Returns [`CommandError`] on a truncated or malformed payload.
pub fn decode_subscriber_message(bytes: &[u8]) -> Result<SubscriberMessage<'_>, CommandError> {
    let mut r = CommandReader::new(bytes);
    let count = r.take_u32()? as usize;
    let mut channel_ids = Vec::with_capacity(count);
    for _ in 0..count {
        channel_ids.push(r.take_u64()?);
    }
    let destination = r.take_string()?;
    Ok(SubscriberMessage {
        destination,
        channel_ids,
    })
}

/// Encodes a qualified message into `buf`, replacing its contents.
pub fn encode_qualified_message(
    buf: &mut Vec<u8>,
    destination: &str,
    session_id: u64,
    channel_id: u64,
    term_id: u64,
) {
    let mut w = CommandWriter::new(buf);
    w.put_u64(session_id);
    w.put_u64(channel_id);
    w.put_u64(term_id);
    w.put_string(destination);
}

/// Decodes a qualified message.
///
/// # Errors
///
/// Returns [`CommandError`] on a truncated or malformed payload.
pub fn decode_qualified_message(bytes: &[u8]) -> Result<QualifiedMessage<'_>, CommandError> {
    let mut r = CommandReader::new(bytes);
    let session_id = r.take_u64()?;
    let channel_id = r.take_u64()?;
    let term_id = r.take_u64()?;
    let destination = r.take_string()?;
    Ok(QualifiedMessage {
        destination,
        session_id,
        channel_id,
        term_id,
    })
}
