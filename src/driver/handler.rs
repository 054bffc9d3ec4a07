//! Data frame handling for one destination.
//!
//! The [`DataFrameHandler`] is where the receive path comes together: it
//! owns the destination's UDP transport and subscription map, routes inbound
//! data frames into session term buffers, asks the conductor for buffers
//! when a new session appears, and emits SMs and NAKs back to the source.

use std::collections::HashMap;
use std::io;

use minstant::Instant;
use mio::{Registry, Token};

use crate::driver::DriverConfig;
use crate::driver::DriverError;
use crate::driver::commands::NewReceiveBufferEvent;
use crate::driver::loss::{LossHandler, NakEmitter};
use crate::driver::proxy::ConductorProxy;
use crate::driver::subscription::{Subscription, SubscriptionNotRegistered};
use crate::driver::transport::{FrameHandler, SendError, UdpTransport, dispatch_frame};
use crate::net::{Destination, Endpoint};
use crate::protocol::frame::{CURRENT_VERSION, align_frame_length, frame_type};
use crate::protocol::headers::{
    DATA_HEADER_LENGTH, DataHeader, NAK_HEADER_LENGTH, Nak, SM_HEADER_LENGTH, StatusMessage,
};
use crate::trace::{debug, trace, warn};

/// On-wire length of an SM datagram after padding.
const SM_FRAME_LENGTH: usize = align_frame_length(SM_HEADER_LENGTH);

/// On-wire length of a NAK datagram after padding.
const NAK_FRAME_LENGTH: usize = align_frame_length(NAK_HEADER_LENGTH);

/// Receive-side frame processing for one destination.
pub struct DataFrameHandler {
    destination: Destination,
    /// Canonical URI, pre-rendered for command encoding.
    destination_key: String,
    transport: UdpTransport,
    subscriptions: HashMap<u64, Subscription>,
    sm_buf: [u8; SM_FRAME_LENGTH],
    nak_buf: [u8; NAK_FRAME_LENGTH],
    initial_window: u32,
    max_frame_length: usize,
}

impl DataFrameHandler {
    /// Binds the destination's transport and registers it with the poller.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be set up.
    pub fn new(
        destination: Destination,
        registry: &Registry,
        token: Token,
        config: &DriverConfig,
    ) -> io::Result<Self> {
        let transport = UdpTransport::new(
            &destination,
            registry,
            token,
            config.socket_rcvbuf,
            config.socket_sndbuf,
        )?;
        let destination_key = destination.canonical();
        Ok(Self {
            destination,
            destination_key,
            transport,
            subscriptions: HashMap::new(),
            sm_buf: [0u8; SM_FRAME_LENGTH],
            nak_buf: [0u8; NAK_FRAME_LENGTH],
            initial_window: config.initial_window,
            max_frame_length: config.max_frame_length,
        })
    }

    /// The destination this handler terminates.
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Endpoint the transport is actually bound to.
    #[must_use]
    pub fn local(&self) -> Endpoint {
        self.transport.local()
    }

    /// Registers channels, creating or referencing subscriptions.
    pub fn add_channels(&mut self, channel_ids: &[u64]) {
        for &channel_id in channel_ids {
            match self.subscriptions.get_mut(&channel_id) {
                Some(subscription) => subscription.inc_ref(),
                None => {
                    debug!(destination = %self.destination_key, channel_id, "subscribing");
                    self.subscriptions
                        .insert(channel_id, Subscription::new(channel_id));
                }
            }
        }
    }

    /// Releases channel references, closing subscriptions that reach zero.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionNotRegistered`] on the first unknown channel;
    /// references released before that point stay released.
    pub fn remove_channels(&mut self, channel_ids: &[u64]) -> Result<(), SubscriptionNotRegistered> {
        for &channel_id in channel_ids {
            let Some(subscription) = self.subscriptions.get_mut(&channel_id) else {
                return Err(SubscriptionNotRegistered { channel_id });
            };
            if subscription.dec_ref() == 0 {
                debug!(destination = %self.destination_key, channel_id, "unsubscribing");
                if let Some(mut subscription) = self.subscriptions.remove(&channel_id) {
                    subscription.close();
                }
            }
        }
        Ok(())
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Looks up a subscription.
    #[must_use]
    pub fn subscription(&self, channel_id: u64) -> Option<&Subscription> {
        self.subscriptions.get(&channel_id)
    }

    /// Drains all readable datagrams, dispatching each to the typed frame
    /// handlers below.
    ///
    /// # Errors
    ///
    /// Returns an error on transport I/O failure.
    pub fn process_inbound(
        &mut self,
        buf: &mut [u8],
        conductor: &mut ConductorProxy,
    ) -> io::Result<usize> {
        let mut count = 0;
        loop {
            let Some((len, src)) = self.transport.try_recv_from(buf)? else {
                return Ok(count);
            };
            let frame = &buf[..len];
            let mut inbound = Inbound {
                handler: &mut *self,
                conductor: &mut *conductor,
            };
            dispatch_frame(frame, src, &mut inbound);
            count += 1;
        }
    }

    /// Routes one data frame: rebuild into an active session, or provision
    /// a new one.
    fn on_data_frame(
        &mut self,
        header: &DataHeader<&[u8]>,
        frame: &[u8],
        length: usize,
        src: Endpoint,
        conductor: &mut ConductorProxy,
    ) {
        if header.frame_length() as usize > self.max_frame_length {
            warn!(
                frame_length = header.frame_length(),
                max_frame_length = self.max_frame_length,
                %src,
                "dropping over-length data frame"
            );
            return;
        }

        let channel_id = header.channel_id();
        let Some(subscription) = self.subscriptions.get_mut(&channel_id) else {
            // Not subscribed on this channel; a shared unicast socket makes
            // this normal traffic, not an error.
            trace!(channel_id, %src, "ignoring data frame for unknown channel");
            return;
        };

        let session_id = header.session_id();
        if let Some(session) = subscription.session_mut(session_id) {
            if header.frame_length() as usize > DATA_HEADER_LENGTH {
                session.rebuild_buffer(header, frame, length);
            }
        } else {
            let term_id = header.term_id();
            subscription.create_session(session_id, src);
            debug!(
                channel_id,
                session_id,
                term_id,
                %src,
                "new session, requesting term buffer"
            );
            // Only needed once: rollovers are driven by status, not setup.
            if !conductor.create_term_buffer(&self.destination_key, session_id, channel_id, term_id)
            {
                warn!(session_id, "conductor command ring full, term buffer request dropped");
            }
        }
    }

    /// Binds a provisioned term buffer and loss handler, then emits the
    /// initial SM that lets the source start transmitting.
    ///
    /// # Errors
    ///
    /// An unknown channel or session is a logic error: the conductor only
    /// provisions what the receiver asked for.
    pub fn on_subscription_ready(
        &mut self,
        event: NewReceiveBufferEvent,
        loss: Box<dyn LossHandler>,
    ) -> Result<(), DriverError> {
        let NewReceiveBufferEvent {
            session_id,
            channel_id,
            term_id,
            buffer,
            ..
        } = event;

        let subscription = self
            .subscriptions
            .get_mut(&channel_id)
            .ok_or(DriverError::UnknownChannel(channel_id))?;
        let session = subscription
            .session_mut(session_id)
            .ok_or(DriverError::UnknownSession(session_id))?;

        session.bind_term_buffer(term_id, buffer, loss);
        let to = session.source_address();

        send_status_message(
            &self.transport,
            &mut self.sm_buf,
            session_id,
            channel_id,
            term_id,
            0,
            self.initial_window,
            to,
        )?;
        Ok(())
    }

    /// Emits a NAK for a missing range of a session's term.
    ///
    /// # Errors
    ///
    /// A short send is fatal to the operation ([`SendError::Short`]).
    pub fn send_nak(
        &mut self,
        session_id: u64,
        channel_id: u64,
        to: Endpoint,
        term_id: u64,
        term_offset: u32,
        length: u32,
    ) -> Result<(), SendError> {
        send_nak(
            &self.transport,
            &mut self.nak_buf,
            session_id,
            channel_id,
            to,
            term_id,
            term_offset,
            length,
        )
    }

    /// Scans every active session for gaps, emitting NAKs per policy, and
    /// advertises rebuild progress with SMs.
    ///
    /// # Errors
    ///
    /// Returns the first send failure; remaining sessions are still scanned.
    pub fn poll_loss(&mut self, now: Instant) -> Result<(), SendError> {
        let Self {
            transport,
            nak_buf,
            sm_buf,
            subscriptions,
            initial_window,
            ..
        } = self;

        let mut first_failure: Result<(), SendError> = Ok(());
        for subscription in subscriptions.values_mut() {
            let channel_id = subscription.channel_id();
            for session in subscription.sessions_mut() {
                let Some(term_id) = session.active_term_id() else {
                    continue;
                };
                let session_id = session.session_id();
                let to = session.source_address();

                let mut sender = NakSender {
                    transport: &*transport,
                    buf: &mut *nak_buf,
                    session_id,
                    channel_id,
                    to,
                    result: Ok(()),
                };
                session.poll_loss(now, &mut sender);
                if let Err(e) = sender.result
                    && first_failure.is_ok()
                {
                    first_failure = Err(e);
                }

                if let Some(contiguous) = session.take_status_update() {
                    let sent = send_status_message(
                        transport,
                        &mut *sm_buf,
                        session_id,
                        channel_id,
                        term_id,
                        contiguous,
                        *initial_window,
                        to,
                    );
                    if let Err(e) = sent
                        && first_failure.is_ok()
                    {
                        first_failure = Err(SendError::Io(e));
                    }
                }
            }
        }
        first_failure
    }

    /// Closes the transport and every subscription.
    pub fn close(&mut self, registry: &Registry) {
        self.transport.close(registry);
        for (_, mut subscription) in self.subscriptions.drain() {
            subscription.close();
        }
    }
}

/// Context binding a handler to the conductor proxy for one dispatch, so
/// data frames can request term buffers while SM/NAK frames on the data
/// endpoint are ignored.
struct Inbound<'a> {
    handler: &'a mut DataFrameHandler,
    conductor: &'a mut ConductorProxy,
}

impl FrameHandler for Inbound<'_> {
    fn on_data_frame(&mut self, header: DataHeader<&[u8]>, frame: &[u8], length: usize, src: Endpoint) {
        self.handler
            .on_data_frame(&header, frame, length, src, self.conductor);
    }

    fn on_status_message_frame(
        &mut self,
        _header: StatusMessage<&[u8]>,
        _frame: &[u8],
        _length: usize,
        _src: Endpoint,
    ) {
        // The data endpoint should not carry SMs.
        trace!(src = %_src, "ignoring status message on data endpoint");
    }

    fn on_nak_frame(&mut self, _header: Nak<&[u8]>, _frame: &[u8], _length: usize, _src: Endpoint) {
        // The data endpoint should not carry NAKs.
        trace!(src = %_src, "ignoring NAK on data endpoint");
    }
}

/// Fills the SM flyweight and transmits it, returning bytes sent.
///
/// A short send here is tolerated: the periodic status cadence will repair
/// it, unlike a lost NAK.
#[allow(clippy::too_many_arguments)]
fn send_status_message(
    transport: &UdpTransport,
    buf: &mut [u8; SM_FRAME_LENGTH],
    session_id: u64,
    channel_id: u64,
    term_id: u64,
    highest_contiguous_term_offset: u32,
    receiver_window: u32,
    to: Endpoint,
) -> io::Result<usize> {
    buf.fill(0);
    let mut sm = StatusMessage::wrap(&mut buf[..], 0).expect("scratch fits the SM header");
    sm.set_version(CURRENT_VERSION)
        .set_flags(0)
        .set_frame_type(frame_type::SM)
        .set_frame_length(SM_HEADER_LENGTH as u32)
        .set_session_id(session_id)
        .set_channel_id(channel_id)
        .set_term_id(term_id)
        .set_highest_contiguous_term_offset(highest_contiguous_term_offset)
        .set_receiver_window(receiver_window);

    let sent = transport.send_to(&buf[..], to)?;
    trace!(
        session_id,
        channel_id,
        term_id,
        highest_contiguous_term_offset,
        receiver_window,
        sent,
        "sent status message"
    );
    if sent < SM_FRAME_LENGTH {
        debug!(sent, required = SM_FRAME_LENGTH, "short status message send");
    }
    Ok(sent)
}

/// Fills the NAK flyweight and transmits it; the whole frame must go out.
#[allow(clippy::too_many_arguments)]
fn send_nak(
    transport: &UdpTransport,
    buf: &mut [u8; NAK_FRAME_LENGTH],
    session_id: u64,
    channel_id: u64,
    to: Endpoint,
    term_id: u64,
    term_offset: u32,
    length: u32,
) -> Result<(), SendError> {
    buf.fill(0);
    let mut nak = Nak::wrap(&mut buf[..], 0).expect("scratch fits the NAK header");
    nak.set_version(CURRENT_VERSION)
        .set_flags(0)
        .set_frame_type(frame_type::NAK)
        .set_frame_length(NAK_HEADER_LENGTH as u32)
        .set_session_id(session_id)
        .set_channel_id(channel_id)
        .set_term_id(term_id)
        .set_gap_term_offset(term_offset)
        .set_gap_length(length);

    let sent = transport.send_to(&buf[..], to)?;
    debug!(session_id, channel_id, term_id, term_offset, length, "sent NAK");
    if sent < NAK_FRAME_LENGTH {
        return Err(SendError::Short {
            sent,
            required: NAK_FRAME_LENGTH,
        });
    }
    Ok(())
}

/// [`NakEmitter`] bound to one session's addressing; the loss handler sees
/// only this capability, never the receiver.
struct NakSender<'a> {
    transport: &'a UdpTransport,
    buf: &'a mut [u8; NAK_FRAME_LENGTH],
    session_id: u64,
    channel_id: u64,
    to: Endpoint,
    result: Result<(), SendError>,
}

impl NakEmitter for NakSender<'_> {
    fn nak(&mut self, term_id: u64, term_offset: u32, length: u32) {
        if self.result.is_err() {
            return;
        }
        self.result = send_nak(
            self.transport,
            self.buf,
            self.session_id,
            self.channel_id,
            self.to,
            term_id,
            term_offset,
            length,
        );
    }
}
