//! Per-destination subscription registry entries and per-session reassembly
//! state.

use std::collections::HashMap;

use thiserror::Error;

use crate::driver::loss::{LossHandler, NakEmitter};
use crate::net::Endpoint;
use crate::protocol::headers::{DATA_HEADER_LENGTH, DataHeader};
use crate::trace::{debug, trace, warn};
use minstant::Instant;

/// `remove_channels` named a channel with no live subscription.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no subscription registered on channel {channel_id}")]
pub struct SubscriptionNotRegistered {
    /// The unknown channel.
    pub channel_id: u64,
}

/// A contiguous byte region backing one (session, term).
///
/// Allocated by the conductor, owned by the receiver from the moment the
/// buffer event is consumed until the session closes.
pub struct TermBuffer {
    data: Box<[u8]>,
}

impl TermBuffer {
    /// Allocates a zeroed term buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Read access for the consumer above the driver.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// Lifecycle of a [`SubscribedSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Seen on the wire; term buffer requested but not yet bound.
    Provisioned,
    /// Term buffer bound; frames rebuild into it.
    Active,
    /// Torn down; retained state is gone.
    Closed,
}

/// Per-(channel, session) state: the source address, the term buffers, and
/// the loss handler bound once the first buffer arrives.
pub struct SubscribedSession {
    session_id: u64,
    channel_id: u64,
    source_address: Endpoint,
    state: SessionState,
    term_buffers: HashMap<u64, TermBuffer>,
    active_term: Option<u64>,
    loss: Option<Box<dyn LossHandler>>,
    /// Highest contiguous offset most recently advertised in an SM.
    advertised: u32,
}

impl SubscribedSession {
    fn new(session_id: u64, channel_id: u64, source_address: Endpoint) -> Self {
        Self {
            session_id,
            channel_id,
            source_address,
            state: SessionState::Provisioned,
            term_buffers: HashMap::new(),
            active_term: None,
            loss: None,
            advertised: 0,
        }
    }

    /// The session identifier.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The channel this session publishes on.
    #[must_use]
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Source address SMs and NAKs are sent back to.
    #[must_use]
    pub fn source_address(&self) -> Endpoint {
        self.source_address
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a term buffer is bound.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// The buffer backing `term_id`, if bound.
    #[must_use]
    pub fn term_buffer(&self, term_id: u64) -> Option<&TermBuffer> {
        self.term_buffers.get(&term_id)
    }

    /// Binds a term buffer and the loss handler, activating the session.
    pub fn bind_term_buffer(
        &mut self,
        term_id: u64,
        buffer: TermBuffer,
        loss: Box<dyn LossHandler>,
    ) {
        debug!(
            session_id = self.session_id,
            channel_id = self.channel_id,
            term_id,
            capacity = buffer.capacity(),
            "binding term buffer"
        );
        self.term_buffers.insert(term_id, buffer);
        self.active_term = Some(term_id);
        self.loss = Some(loss);
        self.state = SessionState::Active;
    }

    /// The term the loss handler currently tracks, if any.
    #[must_use]
    pub fn active_term_id(&self) -> Option<u64> {
        self.active_term
    }

    /// Copies the frame's payload into the term buffer at the frame's term
    /// offset and records the range with the loss handler.
    ///
    /// Only legal while Active. Writes past the buffer capacity and frames
    /// for unbound terms are dropped; replaying a frame is idempotent and
    /// never regresses the contiguous position.
    pub fn rebuild_buffer(&mut self, header: &DataHeader<&[u8]>, frame: &[u8], length: usize) {
        if self.state != SessionState::Active {
            debug!(
                session_id = self.session_id,
                state = ?self.state,
                "dropping frame for session without a term buffer"
            );
            return;
        }

        let term_id = header.term_id();
        let frame_length = header.frame_length() as usize;
        let term_offset = header.term_offset() as usize;
        debug_assert!(frame_length <= length);

        let Some(buffer) = self.term_buffers.get_mut(&term_id) else {
            warn!(
                session_id = self.session_id,
                term_id, "dropping frame for unbound term"
            );
            return;
        };

        let payload = &frame[DATA_HEADER_LENGTH..frame_length];
        let Some(end) = term_offset.checked_add(payload.len()) else {
            warn!(session_id = self.session_id, term_offset, "term offset overflow");
            return;
        };
        if end > buffer.capacity() {
            warn!(
                session_id = self.session_id,
                term_id,
                term_offset,
                payload_len = payload.len(),
                capacity = buffer.capacity(),
                "dropping frame past end of term buffer"
            );
            return;
        }

        buffer.write_at(term_offset, payload);
        trace!(
            session_id = self.session_id,
            term_id,
            term_offset,
            payload_len = payload.len(),
            "rebuilt payload into term buffer"
        );

        if let Some(loss) = &mut self.loss {
            loss.on_frame(term_id, term_offset as u32, payload.len() as u32);
        }
    }

    /// Runs the loss handler's gap scan.
    pub fn poll_loss(&mut self, now: Instant, emitter: &mut dyn NakEmitter) {
        if let Some(loss) = &mut self.loss {
            loss.scan(now, emitter);
        }
    }

    /// Returns the new highest contiguous offset when it has advanced past
    /// the last advertised position, marking it advertised.
    pub fn take_status_update(&mut self) -> Option<u32> {
        let loss = self.loss.as_ref()?;
        let contiguous = loss.highest_contiguous();
        if contiguous > self.advertised {
            self.advertised = contiguous;
            Some(contiguous)
        } else {
            None
        }
    }

    fn close(&mut self) {
        self.term_buffers.clear();
        self.active_term = None;
        self.loss = None;
        self.state = SessionState::Closed;
    }
}

/// One live subscription: the reference-counted binding of a channel to a
/// destination, owning the sessions observed on it.
///
/// The reference count equals the number of logical add calls minus the
/// remove calls for this channel. It is driven solely from the receiver
/// thread's command loop, so a plain integer suffices.
pub struct Subscription {
    channel_id: u64,
    ref_count: u32,
    sessions: HashMap<u64, SubscribedSession>,
    closed: bool,
}

impl Subscription {
    /// Creates a subscription with an initial reference.
    #[must_use]
    pub fn new(channel_id: u64) -> Self {
        Self {
            channel_id,
            ref_count: 1,
            sessions: HashMap::new(),
            closed: false,
        }
    }

    /// The channel this subscription covers.
    #[must_use]
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Takes another reference.
    pub fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Releases one reference, returning the remaining count.
    pub fn dec_ref(&mut self) -> u32 {
        self.ref_count -= 1;
        self.ref_count
    }

    /// Looks up a session.
    #[must_use]
    pub fn session(&self, session_id: u64) -> Option<&SubscribedSession> {
        self.sessions.get(&session_id)
    }

    /// Looks up a session for mutation.
    pub fn session_mut(&mut self, session_id: u64) -> Option<&mut SubscribedSession> {
        self.sessions.get_mut(&session_id)
    }

    /// Creates a Provisioned session recording the source address.
    pub fn create_session(
        &mut self,
        session_id: u64,
        source_address: Endpoint,
    ) -> &mut SubscribedSession {
        self.sessions
            .entry(session_id)
            .or_insert_with(|| SubscribedSession::new(session_id, self.channel_id, source_address))
    }

    /// Number of sessions observed on this channel.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Iterates the sessions for mutation.
    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut SubscribedSession> {
        self.sessions.values_mut()
    }

    /// Whether the close hook has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Releases all contained sessions. Runs at most once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for session in self.sessions.values_mut() {
            session.close();
        }
        self.sessions.clear();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
