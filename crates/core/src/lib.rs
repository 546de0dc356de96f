//! Transport-independent media delivery logic: fragment reassembly,
//! datagram ACK/horizon tracking, congestion-driven object skipping,
//! subscribe/notify bookkeeping, stream/connection state machines, and
//! the QUIC transport seam they run over.
//!
//! Plays the same role a shared `common` crate plays between `server` and
//! `client`, generalized from a single USB-over-QUIC request/response
//! protocol to this crate's group/object/fragment media model.

pub mod ack_tracker;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod message_buffer;
pub mod quic;
pub mod reassembly;
pub mod repair_scheduler;
pub mod source;
pub mod stream_state;
pub mod subscribe;
pub mod types;

pub use ack_tracker::{AckTracker, RepairConfig, RequeuedDatagram};
pub use congestion::{CongestionEvaluator, CongestionMode, PathSignals};
pub use connection::Connection;
pub use error::{CoreError, Result};
pub use message_buffer::MessageBuffer;
pub use quic::{QuicConnection, QuicRecvStream, QuicSendStream};
pub use reassembly::{Delivery, Reassembler};
pub use repair_scheduler::{ScheduledRequeue, sweep};
pub use source::{Fragment, SourceEvent, SourceHandle};
pub use stream_state::{
    ControlStream, IncomingKind, ReceiveState, SendAction, SendState, UniRecvStream,
    UniSendState, UniSendStream,
};
pub use subscribe::SubscriptionRegistry;
pub use types::StreamHandle;
