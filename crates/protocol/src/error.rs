//! Wire protocol error types

use thiserror::Error;

/// Errors raised by the wire codec and message-buffer framing layer.
///
/// This is distinct from `core::error::CoreError` (SPEC_FULL.md §7): a
/// `WireError` is always a codec/framing failure and converts into
/// `CoreError::MalformedMessage` at the boundary where the core interprets
/// decoded bytes.
#[derive(Debug, Error)]
pub enum WireError {
    /// Serialization error from postcard
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Incompatible protocol version detected
    #[error(
        "incompatible protocol version: {major}.{minor} (expected {expected_major}.{expected_minor})"
    )]
    IncompatibleVersion {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// A reserved or unrecognized message discriminant was seen.
    #[error("invalid message type")]
    InvalidMessageType,

    /// Buffer too small for operation
    #[error("buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Frame length exceeds the 2-byte length prefix's range (u16::MAX).
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// A variable-length field declared a size that exceeds the frame.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for wire codec results
pub type Result<T> = std::result::Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incompatible_version_display() {
        let err = WireError::IncompatibleVersion {
            major: 2,
            minor: 0,
            expected_major: 1,
            expected_minor: 0,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("incompatible protocol version"));
        assert!(msg.contains("2.0"));
        assert!(msg.contains("1.0"));
    }

    #[test]
    fn frame_too_large_display() {
        let err = WireError::FrameTooLarge {
            size: 100_000,
            max: 65_535,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("frame too large"));
    }
}
