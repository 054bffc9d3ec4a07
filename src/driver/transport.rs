//! UDP transport for one destination plus inbound frame dispatch.

use std::io;
use std::net::IpAddr;

use mio::{Interest, Registry, Token};
use thiserror::Error;

use crate::net::{Destination, Endpoint, UdpSocket};
use crate::protocol::frame::{BASE_HEADER_LENGTH, CURRENT_VERSION, frame_type};
use crate::protocol::headers::{DataHeader, FrameHeader, Nak, StatusMessage};
use crate::trace::{debug, trace, warn};

/// Top bit of `frame_length` and `term_offset`; reserved, must be zero.
const RESERVED_BIT: u32 = 0x8000_0000;

/// Failure sending a control frame.
#[derive(Debug, Error)]
pub enum SendError {
    /// Fewer bytes than the frame length left the socket.
    #[error("short send: {sent} of {required} bytes transmitted")]
    Short { sent: usize, required: usize },
    /// Transport-level I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handler for frames arriving on a transport, one method per frame type.
///
/// The typed header view and the raw frame share the same backing bytes;
/// `length` is the datagram length, which may exceed the logical
/// `frame_length` by wire padding.
pub trait FrameHandler {
    /// A data frame carrying (possibly zero) payload for a term buffer.
    fn on_data_frame(&mut self, header: DataHeader<&[u8]>, frame: &[u8], length: usize, src: Endpoint);

    /// A Status Message frame.
    fn on_status_message_frame(
        &mut self,
        header: StatusMessage<&[u8]>,
        frame: &[u8],
        length: usize,
        src: Endpoint,
    );

    /// A NAK frame.
    fn on_nak_frame(&mut self, header: Nak<&[u8]>, frame: &[u8], length: usize, src: Endpoint);
}

/// One bound, non-blocking UDP endpoint registered with the receiver's
/// poller.
pub struct UdpTransport {
    socket: UdpSocket,
    local: Endpoint,
    closed: bool,
}

impl UdpTransport {
    /// Binds the destination's local endpoint and registers it for
    /// readability. Joins the group first when the destination is multicast.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound, configured, or
    /// registered.
    pub fn new(
        destination: &Destination,
        registry: &Registry,
        token: Token,
        recv_buffer_size: Option<usize>,
        send_buffer_size: Option<usize>,
    ) -> io::Result<Self> {
        let mut socket = UdpSocket::bind(destination.local_data())?;

        if destination.is_multicast()
            && let IpAddr::V4(group) = destination.remote_data().ip()
        {
            socket.join_multicast_v4(group)?;
        }
        if let Some(size) = recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }

        use mio::event::Source;
        socket.register(registry, token, Interest::READABLE)?;

        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            local,
            closed: false,
        })
    }

    /// The locally bound endpoint.
    #[must_use]
    pub fn local(&self) -> Endpoint {
        self.local
    }

    /// Sends one frame, returning the bytes transmitted (possibly short;
    /// the caller decides whether that is fatal).
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn send_to(&self, frame: &[u8], to: Endpoint) -> io::Result<usize> {
        self.socket.send_to(frame, to)
    }

    /// Receives one datagram if available.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        self.socket.try_recv_from(buf)
    }

    /// Deregisters from the poller. Idempotent.
    pub fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.closed = true;
        use mio::event::Source;
        if let Err(_e) = self.socket.deregister(registry) {
            warn!(local = %self.local, error = %_e, "failed to deregister transport");
        }
    }
}

/// Validates one datagram and hands it to the matching handler method.
///
/// Datagrams that fail validation are dropped here with a log line and never
/// reach the handler, so a malformed frame cannot corrupt registry state.
pub fn dispatch_frame(frame: &[u8], src: Endpoint, handler: &mut impl FrameHandler) {
    let length = frame.len();
    if length < BASE_HEADER_LENGTH {
        debug!(%src, length, "dropping runt datagram");
        return;
    }

    // Infallible after the length check.
    let Ok(header) = FrameHeader::wrap(frame, 0) else {
        return;
    };

    if header.version() != CURRENT_VERSION {
        debug!(%src, version = header.version(), "dropping frame with unknown version");
        return;
    }

    let frame_length = header.frame_length();
    if frame_length & RESERVED_BIT != 0 || header.term_offset() & RESERVED_BIT != 0 {
        warn!(%src, "dropping frame with reserved bit set");
        return;
    }
    if frame_length as usize > length {
        warn!(
            %src,
            frame_length,
            datagram_length = length,
            "dropping truncated frame"
        );
        return;
    }

    match header.frame_type() {
        frame_type::DATA => match DataHeader::wrap(frame, 0) {
            Ok(data) if frame_length as usize >= DataHeader::<&[u8]>::HEADER_LENGTH => {
                handler.on_data_frame(data, frame, length, src);
            }
            _ => warn!(%src, frame_length, "dropping undersized data frame"),
        },
        frame_type::SM => match StatusMessage::wrap(frame, 0) {
            Ok(sm) if frame_length as usize >= StatusMessage::<&[u8]>::HEADER_LENGTH => {
                handler.on_status_message_frame(sm, frame, length, src);
            }
            _ => warn!(%src, frame_length, "dropping undersized status message"),
        },
        frame_type::NAK => match Nak::wrap(frame, 0) {
            Ok(nak) if frame_length as usize >= Nak::<&[u8]>::HEADER_LENGTH => {
                handler.on_nak_frame(nak, frame, length, src);
            }
            _ => warn!(%src, frame_length, "dropping undersized NAK frame"),
        },
        _other => {
            trace!(%src, frame_type = _other, "dropping frame of unknown type");
        }
    }
}
