//! Wire protocol for media-quic
//!
//! This crate defines the message protocol for communication between a media
//! publisher, a relay, and a subscriber over QUIC. It provides type-safe
//! message definitions, serialization/deserialization using postcard, and
//! protocol versioning.
//!
//! # Example
//!
//! ```
//! use protocol::{Message, MessagePayload};
//! use protocol::{encode_message, decode_message};
//!
//! let msg = Message::new(MessagePayload::Subscribe {
//!     url_prefix: "camera/".to_string(),
//! });
//!
//! let bytes = encode_message(&msg).unwrap();
//! let decoded = decode_message(&bytes).unwrap();
//! assert_eq!(decoded.version, msg.version);
//! ```
//!
//! # Framed Messages
//!
//! Control-channel messages are length-prefixed with a 2-byte big-endian
//! prefix:
//!
//! ```
//! use protocol::{Message, MessagePayload};
//! use protocol::{encode_framed, decode_framed};
//!
//! let msg = Message::new(MessagePayload::Notify {
//!     url: "camera/front".to_string(),
//! });
//!
//! let framed = encode_framed(&msg).unwrap();
//! let decoded = decode_framed(&framed).unwrap();
//! ```

pub mod codec;
pub mod error;
pub mod integrity;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{
    MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed, encode_message, read_framed,
    validate_version, write_framed,
};

#[cfg(feature = "async")]
pub use codec::{read_framed_async, write_framed_async};
pub use error::{Result, WireError};
pub use integrity::{compute_checksum, verify_checksum};
pub use messages::{Datagram, DatagramHeader, Message, MessagePayload};
pub use types::{
    CachePolicy, CloseReason, FragmentKey, GroupId, MediaId, ObjectId, ObjectKey,
    ObjectReadyMode, Offset, SubscribeIntent, TransportMode, flags,
};
pub use version::{CURRENT_VERSION, ProtocolVersion};
