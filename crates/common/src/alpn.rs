//! ALPN protocol identifier for the media transport.
//!
//! Application-Layer Protocol Negotiation (ALPN) identifier used for Iroh QUIC
//! connections. This ensures that only compatible publishers, relays, and
//! subscribers can communicate over the same endpoint.

/// ALPN protocol identifier for the media-over-QUIC transport.
///
/// Version 1 of the media transport protocol.
pub const ALPN_PROTOCOL: &[u8] = b"media-quic/1";
