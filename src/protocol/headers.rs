//! Header flyweights: zero-copy typed views over frame bytes.
//!
//! A flyweight binds `(buffer, base offset)` at [`wrap`] time, where the
//! buffer extent is checked once; after that every accessor reads or writes
//! the backing bytes directly. Nothing is copied until a field is read and
//! no heap allocation happens per frame. The same view type works over
//! borrowed slices for decoding and over mutable scratch buffers for
//! encoding.
//!
//! [`wrap`]: FrameHeader::wrap

use thiserror::Error;

use super::frame::{
    BASE_HEADER_LENGTH, FLAGS_OFFSET, LENGTH_OFFSET, TERM_OFFSET_OFFSET, TYPE_OFFSET,
    VERSION_OFFSET,
};

/// Length of a data frame header; payload bytes follow immediately.
pub const DATA_HEADER_LENGTH: usize = BASE_HEADER_LENGTH + 24;

/// Length of a Status Message frame.
pub const SM_HEADER_LENGTH: usize = DATA_HEADER_LENGTH + 8;

/// Length of a NAK frame.
pub const NAK_HEADER_LENGTH: usize = DATA_HEADER_LENGTH + 8;

const SESSION_ID_OFFSET: usize = BASE_HEADER_LENGTH;
const CHANNEL_ID_OFFSET: usize = BASE_HEADER_LENGTH + 8;
const TERM_ID_OFFSET: usize = BASE_HEADER_LENGTH + 16;

const SM_HIGHEST_OFFSET: usize = DATA_HEADER_LENGTH;
const SM_WINDOW_OFFSET: usize = DATA_HEADER_LENGTH + 4;

const NAK_GAP_OFFSET: usize = DATA_HEADER_LENGTH;
const NAK_GAP_LENGTH_OFFSET: usize = DATA_HEADER_LENGTH + 4;

/// A flyweight access that would reach beyond the backing buffer.
///
/// Raised once at wrap time; the offending datagram is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("header of {need} bytes at offset {offset} exceeds buffer of {have} bytes")]
pub struct BufferOverflow {
    /// Bytes the view needs past the base offset.
    pub need: usize,
    /// Base offset the view was wrapped at.
    pub offset: usize,
    /// Total length of the backing buffer.
    pub have: usize,
}

fn check_extent(buf: &[u8], offset: usize, need: usize) -> Result<(), BufferOverflow> {
    let ok = offset
        .checked_add(need)
        .is_some_and(|end| end <= buf.len());
    if ok {
        Ok(())
    } else {
        Err(BufferOverflow {
            need,
            offset,
            have: buf.len(),
        })
    }
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Generates the view struct plus the accessors for the common base header.
macro_rules! flyweight {
    ($(#[$doc:meta])* $name:ident, $header_len:expr) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name<T> {
            buffer: T,
            offset: usize,
        }

        impl<T: AsRef<[u8]>> $name<T> {
            /// Fixed length of this header in bytes.
            pub const HEADER_LENGTH: usize = $header_len;

            /// Binds the view to `buffer` at `offset`, checking the extent
            /// once.
            ///
            /// # Errors
            ///
            /// Returns [`BufferOverflow`] if the header would not fit.
            pub fn wrap(buffer: T, offset: usize) -> Result<Self, BufferOverflow> {
                check_extent(buffer.as_ref(), offset, Self::HEADER_LENGTH)?;
                Ok(Self { buffer, offset })
            }

            /// Releases the backing buffer.
            pub fn into_inner(self) -> T {
                self.buffer
            }

            fn bytes(&self) -> &[u8] {
                self.buffer.as_ref()
            }

            /// Protocol version of the frame.
            pub fn version(&self) -> u8 {
                self.bytes()[self.offset + VERSION_OFFSET]
            }

            /// Fragment flags (see [`crate::protocol::frame::flags`]).
            pub fn flags(&self) -> u8 {
                self.bytes()[self.offset + FLAGS_OFFSET]
            }

            /// Frame type discriminant.
            pub fn frame_type(&self) -> u16 {
                get_u16(self.bytes(), self.offset + TYPE_OFFSET)
            }

            /// Unpadded logical frame length; the top bit is reserved.
            pub fn frame_length(&self) -> u32 {
                get_u32(self.bytes(), self.offset + LENGTH_OFFSET)
            }

            /// Offset within the term this frame's payload lands at.
            pub fn term_offset(&self) -> u32 {
                get_u32(self.bytes(), self.offset + TERM_OFFSET_OFFSET)
            }
        }

        impl<T: AsRef<[u8]> + AsMut<[u8]>> $name<T> {
            /// Sets the protocol version.
            pub fn set_version(&mut self, v: u8) -> &mut Self {
                let at = self.offset + VERSION_OFFSET;
                self.buffer.as_mut()[at] = v;
                self
            }

            /// Sets the fragment flags.
            pub fn set_flags(&mut self, v: u8) -> &mut Self {
                let at = self.offset + FLAGS_OFFSET;
                self.buffer.as_mut()[at] = v;
                self
            }

            /// Sets the frame type discriminant.
            pub fn set_frame_type(&mut self, v: u16) -> &mut Self {
                put_u16(self.buffer.as_mut(), self.offset + TYPE_OFFSET, v);
                self
            }

            /// Sets the logical frame length.
            pub fn set_frame_length(&mut self, v: u32) -> &mut Self {
                put_u32(self.buffer.as_mut(), self.offset + LENGTH_OFFSET, v);
                self
            }

            /// Sets the term offset.
            pub fn set_term_offset(&mut self, v: u32) -> &mut Self {
                put_u32(self.buffer.as_mut(), self.offset + TERM_OFFSET_OFFSET, v);
                self
            }
        }
    };
}

/// Generates accessors for the session/channel/term identifier triple shared
/// by the data, SM, and NAK headers.
macro_rules! stream_id_fields {
    ($name:ident) => {
        impl<T: AsRef<[u8]>> $name<T> {
            /// Identifier of the producing session.
            pub fn session_id(&self) -> u64 {
                get_u64(self.bytes(), self.offset + SESSION_ID_OFFSET)
            }

            /// Identifier of the channel within the destination.
            pub fn channel_id(&self) -> u64 {
                get_u64(self.bytes(), self.offset + CHANNEL_ID_OFFSET)
            }

            /// Identifier of the term this frame refers to.
            pub fn term_id(&self) -> u64 {
                get_u64(self.bytes(), self.offset + TERM_ID_OFFSET)
            }
        }

        impl<T: AsRef<[u8]> + AsMut<[u8]>> $name<T> {
            /// Sets the session identifier.
            pub fn set_session_id(&mut self, v: u64) -> &mut Self {
                put_u64(self.buffer.as_mut(), self.offset + SESSION_ID_OFFSET, v);
                self
            }

            /// Sets the channel identifier.
            pub fn set_channel_id(&mut self, v: u64) -> &mut Self {
                put_u64(self.buffer.as_mut(), self.offset + CHANNEL_ID_OFFSET, v);
                self
            }

            /// Sets the term identifier.
            pub fn set_term_id(&mut self, v: u64) -> &mut Self {
                put_u64(self.buffer.as_mut(), self.offset + TERM_ID_OFFSET, v);
                self
            }
        }
    };
}

flyweight!(
    /// View over the 12-byte base header shared by every frame type.
    ///
    /// Used by the transport to sniff the frame type before rebinding one of
    /// the typed views below.
    FrameHeader,
    BASE_HEADER_LENGTH
);

flyweight!(
    /// View over a data frame header; the payload follows at
    /// [`DATA_HEADER_LENGTH`].
    DataHeader,
    DATA_HEADER_LENGTH
);
stream_id_fields!(DataHeader);

flyweight!(
    /// View over a Status Message frame.
    StatusMessage,
    SM_HEADER_LENGTH
);
stream_id_fields!(StatusMessage);

flyweight!(
    /// View over a NAK frame.
    Nak,
    NAK_HEADER_LENGTH
);
stream_id_fields!(Nak);

impl<T: AsRef<[u8]>> StatusMessage<T> {
    /// Highest term offset up to which all bytes have been received.
    pub fn highest_contiguous_term_offset(&self) -> u32 {
        get_u32(self.bytes(), self.offset + SM_HIGHEST_OFFSET)
    }

    /// Bytes the receiver is prepared to accept past the contiguous position.
    pub fn receiver_window(&self) -> u32 {
        get_u32(self.bytes(), self.offset + SM_WINDOW_OFFSET)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> StatusMessage<T> {
    /// Sets the highest contiguous term offset.
    pub fn set_highest_contiguous_term_offset(&mut self, v: u32) -> &mut Self {
        put_u32(self.buffer.as_mut(), self.offset + SM_HIGHEST_OFFSET, v);
        self
    }

    /// Sets the receiver window.
    pub fn set_receiver_window(&mut self, v: u32) -> &mut Self {
        put_u32(self.buffer.as_mut(), self.offset + SM_WINDOW_OFFSET, v);
        self
    }
}

impl<T: AsRef<[u8]>> Nak<T> {
    /// Term offset at which the missing range starts.
    pub fn gap_term_offset(&self) -> u32 {
        get_u32(self.bytes(), self.offset + NAK_GAP_OFFSET)
    }

    /// Length in bytes of the missing range.
    pub fn gap_length(&self) -> u32 {
        get_u32(self.bytes(), self.offset + NAK_GAP_LENGTH_OFFSET)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Nak<T> {
    /// Sets the start of the missing range.
    pub fn set_gap_term_offset(&mut self, v: u32) -> &mut Self {
        put_u32(self.buffer.as_mut(), self.offset + NAK_GAP_OFFSET, v);
        self
    }

    /// Sets the length of the missing range.
    pub fn set_gap_length(&mut self, v: u32) -> &mut Self {
        put_u32(self.buffer.as_mut(), self.offset + NAK_GAP_LENGTH_OFFSET, v);
        self
    }
}
