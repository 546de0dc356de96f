//! Core error taxonomy (SPEC_FULL.md §7).
//!
//! Distinct from `protocol::WireError`, which is purely a codec/framing
//! failure. A `WireError` converts into `CoreError::MalformedMessage` at the
//! boundary where decoded bytes become a `protocol::MessagePayload`.

use thiserror::Error;

/// Reason a stream's consumer/producer callback was released.
pub use protocol::CloseReason;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The codec failed to decode a message; the stream is reset with
    /// `protocol_violation`.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A legal message arrived in an illegal state for the stream's current
    /// send/receive state machine.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Allocation or resource-table exhaustion; the owning connection is
    /// closed with `internal`.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Not an error: the consumer callback asked the core to finalize the
    /// stream cleanly.
    #[error("consumer finished")]
    ConsumerFinished,

    /// Surfaced from the QUIC transport; closes the stream.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<protocol::WireError> for CoreError {
    fn from(err: protocol::WireError) -> Self {
        CoreError::MalformedMessage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_error_converts_to_malformed_message() {
        let wire_err = protocol::WireError::InvalidMessageType;
        let core_err: CoreError = wire_err.into();
        assert!(matches!(core_err, CoreError::MalformedMessage(_)));
    }
}
