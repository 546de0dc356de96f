//! Shared handle types used across `core` modules.

/// Opaque handle identifying one stream (bidirectional control or
/// unidirectional warp/rush) within a connection. Assigned by
/// [`crate::connection::Connection`] when the stream is created; stable for
/// the stream's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamHandle(pub u64);
