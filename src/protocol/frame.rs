//! Frame layout constants and configuration-time validation.

use thiserror::Error;

/// Alignment as a multiple of bytes for each frame (one cache line).
pub const FRAME_ALIGNMENT: usize = 64;

/// Word alignment for fields inside a frame header.
pub const WORD_ALIGNMENT: usize = 8;

/// Length in bytes of the base header common to all frame types.
pub const BASE_HEADER_LENGTH: usize = 12;

/// Current protocol version.
pub const CURRENT_VERSION: u8 = 0;

/// Fragment flags carried in the `flags` byte of every data frame.
pub mod flags {
    /// First fragment of a message.
    pub const BEGIN_FRAG: u8 = 0b1000_0000;

    /// Last fragment of a message.
    pub const END_FRAG: u8 = 0b0100_0000;

    /// Message that does not span frames.
    pub const UNFRAGMENTED: u8 = BEGIN_FRAG | END_FRAG;
}

/// Frame type discriminants carried in the `type` field of the base header.
pub mod frame_type {
    /// Data frame (payload for a term buffer).
    pub const DATA: u16 = 0x00;

    /// NAK: retransmission request for a missing range.
    pub const NAK: u16 = 0x01;

    /// Status Message: highest contiguous position + receiver window.
    pub const SM: u16 = 0x02;
}

/// Field offsets within a frame, relative to the frame start.
pub const VERSION_OFFSET: usize = 0;
/// Offset of the flags byte.
pub const FLAGS_OFFSET: usize = 1;
/// Offset of the frame type field.
pub const TYPE_OFFSET: usize = 2;
/// Offset of the frame length field.
pub const LENGTH_OFFSET: usize = 4;
/// Offset of the term offset field.
pub const TERM_OFFSET_OFFSET: usize = 8;

/// Errors from configuration-time layout validation. These prevent startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// Frame header length below the base length or not word aligned.
    #[error(
        "frame header length must be >= {BASE_HEADER_LENGTH} and a multiple of \
         {WORD_ALIGNMENT}, was {0}"
    )]
    InvalidHeaderLength(usize),
    /// Maximum frame length not a multiple of the frame alignment.
    #[error("max frame length must be a multiple of {FRAME_ALIGNMENT}, was {0}")]
    InvalidFrameAlignment(usize),
}

/// Validates a configured frame header length.
///
/// # Errors
///
/// Returns [`LayoutError::InvalidHeaderLength`] if `length` is below
/// [`BASE_HEADER_LENGTH`] or not a multiple of [`WORD_ALIGNMENT`].
pub const fn check_header_length(length: usize) -> Result<(), LayoutError> {
    if length < BASE_HEADER_LENGTH || length % WORD_ALIGNMENT != 0 {
        return Err(LayoutError::InvalidHeaderLength(length));
    }
    Ok(())
}

/// Validates a configured maximum frame length.
///
/// # Errors
///
/// Returns [`LayoutError::InvalidFrameAlignment`] if `length` is not a
/// multiple of [`FRAME_ALIGNMENT`].
pub const fn check_max_frame_length(length: usize) -> Result<(), LayoutError> {
    if length % FRAME_ALIGNMENT != 0 {
        return Err(LayoutError::InvalidFrameAlignment(length));
    }
    Ok(())
}

/// Maximum supported message length for a term buffer of the given capacity.
#[must_use]
pub const fn max_message_length(capacity: usize) -> usize {
    let limit = capacity / 8;
    if limit < 1 << 16 { limit } else { 1 << 16 }
}

/// Rounds a logical frame length up to the on-wire padded length.
#[must_use]
pub const fn align_frame_length(length: usize) -> usize {
    (length + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_bounds() {
        assert!(check_header_length(16).is_ok());
        assert!(check_header_length(40).is_ok());
        assert_eq!(
            check_header_length(8),
            Err(LayoutError::InvalidHeaderLength(8))
        );
        assert_eq!(
            check_header_length(36),
            Err(LayoutError::InvalidHeaderLength(36))
        );
    }

    #[test]
    fn max_frame_length_alignment() {
        assert!(check_max_frame_length(1408).is_ok());
        assert_eq!(
            check_max_frame_length(1400),
            Err(LayoutError::InvalidFrameAlignment(1400))
        );
    }

    #[test]
    fn message_length_is_capacity_derived_and_capped() {
        assert_eq!(max_message_length(64 * 1024), 8 * 1024);
        assert_eq!(max_message_length(16 * 1024 * 1024), 1 << 16);
    }

    #[test]
    fn frame_length_padding() {
        assert_eq!(align_frame_length(0), 0);
        assert_eq!(align_frame_length(1), 64);
        assert_eq!(align_frame_length(44), 64);
        assert_eq!(align_frame_length(64), 64);
        assert_eq!(align_frame_length(65), 128);
    }

    #[test]
    fn unfragmented_is_both_flags() {
        assert_eq!(flags::UNFRAGMENTED, flags::BEGIN_FRAG | flags::END_FRAG);
        assert_eq!(flags::UNFRAGMENTED, 0xC0);
    }
}
