//! Ambient utilities shared between the publisher/relay and subscriber binaries.
//!
//! This crate carries the concerns that are not part of the transport core's
//! protocol logic but that every binary built on top of it needs: structured
//! logging setup, a stable QUIC node identity, the ALPN identifier, and a
//! small ambient error type for plumbing that doesn't belong to the wire
//! protocol or the core state machines.

pub mod alpn;
pub mod error;
pub mod keys;
pub mod logging;

pub use alpn::ALPN_PROTOCOL;
pub use error::{Error, Result};
pub use keys::load_or_generate_secret_key;
pub use logging::setup_logging;
