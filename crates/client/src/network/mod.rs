//! Network subsystem.
//!
//! Iroh P2P endpoint management, the publisher/relay allowlist, and the
//! per-publisher connection driving `REQUEST`/`SUBSCRIBE` and the pushed
//! warp/rush streams and datagrams that answer them.

pub mod client;
pub mod connection;

pub use client::{SubscriberClient, SubscriberClientConfig};
pub use connection::{ConnectionState, MediaEvent, PublisherConnection};
