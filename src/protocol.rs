//! On-wire and control-plane binary formats.
//!
//! Everything here is a view or codec over caller-supplied byte buffers;
//! nothing allocates on the frame path.
//!
//! # Wire Format
//!
//! All multi-byte integers are little-endian. Every frame starts with the
//! 12-byte base header and is padded to [`frame::FRAME_ALIGNMENT`] on the
//! wire; the `frame_length` field carries the unpadded logical length.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |B|E|  Flags    |             Type              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-------------------------------+
//! |R|                        Frame Length                         |
//! +-+-------------------------------------------------------------+
//! |R|                        Term Offset                          |
//! +-+-------------------------------------------------------------+
//! |                      Additional Fields                       ...
//! +---------------------------------------------------------------+
//! ```
//!
//! The (B)egin and (E)nd flags mark message fragmentation; both set means the
//! message fits in a single frame. R bits are reserved and must be zero.

pub mod command;
pub mod frame;
pub mod headers;
