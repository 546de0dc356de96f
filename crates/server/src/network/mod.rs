//! Network subsystem.
//!
//! Iroh P2P endpoint management, peer authentication, and connection
//! acceptance. Per-connection protocol state (streams, reassembly, ack
//! tracking, subscriptions) lives in `media_core::Connection`; this module
//! only owns the endpoint, the allowlist, and the accept loop.
//!
//! ```text
//! IrohServer
//!   ├─> accept connections
//!   ├─> validate allowlist
//!   └─> spawn media_core::Connection per peer
//! ```

pub mod server;

pub use server::IrohServer;
