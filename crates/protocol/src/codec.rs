//! Message serialization and deserialization using postcard
//!
//! Messages are serialized using postcard (compact binary format) and framed
//! with a length prefix for use over QUIC control streams.
//!
//! # Frame Format
//!
//! ```text
//! [Length: u16 (big-endian)][Message bytes (postcard serialized)]
//! ```
//!
//! The 2-byte prefix bounds a single framed control message to 65,535 bytes.
//! This is deliberately narrower than a typical media object: object and
//! fragment bodies travel as the trailing, unprefixed byte range of a
//! `MessagePayload::Fragment`/`ObjectHeader` frame or as raw stream/datagram
//! payload, never re-wrapped in another length-prefixed frame.

use crate::{CURRENT_VERSION, Message, ProtocolVersion, error::Result, error::WireError};
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed frame size: the full range of the 2-byte length prefix.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Encode a message to bytes using postcard.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(WireError::from)
}

/// Decode a message from bytes using postcard.
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    postcard::from_bytes(bytes).map_err(WireError::from)
}

/// Validate protocol version compatibility.
///
/// Compatible if major versions match; minor version differences are
/// allowed in both directions.
pub fn validate_version(message_version: &ProtocolVersion) -> Result<()> {
    if message_version.major != CURRENT_VERSION.major {
        return Err(WireError::IncompatibleVersion {
            major: message_version.major,
            minor: message_version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

/// Encode a message with its 2-byte length prefix.
///
/// Frame format: `[2-byte length (big-endian)][postcard message bytes]`.
pub fn encode_framed(message: &Message) -> Result<Vec<u8>> {
    let message_bytes = encode_message(message)?;
    let message_len = message_bytes.len();

    if message_len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: message_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(2 + message_len);
    frame.extend_from_slice(&(message_len as u16).to_be_bytes());
    frame.extend_from_slice(&message_bytes);

    Ok(frame)
}

/// Decode a framed message.
///
/// Expects frame format: `[2-byte length (big-endian)][postcard message bytes]`.
pub fn decode_framed(frame: &[u8]) -> Result<Message> {
    if frame.len() < 2 {
        return Err(WireError::IncompleteFrame {
            expected: 2,
            actual: frame.len(),
        });
    }

    let length = u16::from_be_bytes([frame[0], frame[1]]) as usize;

    if frame.len() < 2 + length {
        return Err(WireError::IncompleteFrame {
            expected: 2 + length,
            actual: frame.len(),
        });
    }

    let message_bytes = &frame[2..2 + length];
    decode_message(message_bytes)
}

/// Write a framed message to a writer (e.g. a QUIC control stream).
pub fn write_framed<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let framed = encode_framed(message)?;
    writer.write_all(&framed)?;
    Ok(())
}

/// Read a framed message from a reader (e.g. a QUIC control stream).
pub fn read_framed<R: Read>(reader: &mut R) -> Result<Message> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes)?;
    let length = u16::from_be_bytes(len_bytes) as usize;

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes)?;

    decode_message(&message_bytes)
}

/// Async: write a framed message to an async writer.
#[cfg(feature = "async")]
pub async fn write_framed_async<W>(writer: &mut W, framed_bytes: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(framed_bytes).await?;
    Ok(())
}

/// Async: read a framed message from an async reader.
///
/// Returns the complete framed message bytes (including the length prefix).
#[cfg(feature = "async")]
pub async fn read_framed_async<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let length = u16::from_be_bytes(len_bytes) as usize;

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes).await?;

    let mut frame = Vec::with_capacity(2 + length);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(&message_bytes);

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MessagePayload,
        types::{CachePolicy, GroupId, MediaId, ObjectId, SubscribeIntent, TransportMode},
    };
    use std::io::Cursor;

    #[test]
    fn message_roundtrip() {
        let msg = Message::new(MessagePayload::Subscribe {
            url_prefix: "media/".to_string(),
        });

        let bytes = encode_message(&msg).unwrap();
        let decoded = decode_message(&bytes).unwrap();

        assert_eq!(msg.version, decoded.version);
    }

    #[test]
    fn request_roundtrip() {
        let msg = Message::new(MessagePayload::Request {
            url: "camera/front".to_string(),
            transport_mode: TransportMode::Warp,
            subscribe_intent: SubscribeIntent::StartPoint(GroupId(3), ObjectId(0)),
            media_id: MediaId(0),
        });

        let bytes = encode_message(&msg).unwrap();
        let decoded = decode_message(&bytes).unwrap();

        let MessagePayload::Request {
            url,
            transport_mode,
            subscribe_intent,
            ..
        } = decoded.payload
        else {
            panic!("expected Request");
        };
        assert_eq!(url, "camera/front");
        assert_eq!(transport_mode, TransportMode::Warp);
        assert_eq!(subscribe_intent, SubscribeIntent::StartPoint(GroupId(3), ObjectId(0)));
    }

    #[test]
    fn fragment_roundtrip_with_large_payload() {
        let data = vec![0xABu8; 4096];
        let msg = Message::new(MessagePayload::Fragment {
            group_id: GroupId(1),
            object_id: ObjectId(2),
            nb_objects_previous_group: 30,
            offset: 0,
            object_length: 4096,
            flags: crate::types::flags::NONE,
            data,
        });

        let bytes = encode_message(&msg).unwrap();
        let decoded = decode_message(&bytes).unwrap();

        let MessagePayload::Fragment { data, .. } = decoded.payload else {
            panic!("expected Fragment");
        };
        assert_eq!(data.len(), 4096);
        assert_eq!(data[0], 0xAB);
    }

    #[test]
    fn framed_encode_decode_roundtrip() {
        let msg = Message::new(MessagePayload::CachePolicy(CachePolicy::RealTime));

        let framed = encode_framed(&msg).unwrap();
        assert!(framed.len() >= 2);

        let decoded = decode_framed(&framed).unwrap();
        assert_eq!(msg.version, decoded.version);
    }

    /// §8 invariant: the 2-byte length prefix equals the count of payload
    /// bytes that follow.
    #[test]
    fn framed_length_prefix_matches_payload_length() {
        let msg = Message::new(MessagePayload::Fragment {
            group_id: GroupId(7),
            object_id: ObjectId(1),
            nb_objects_previous_group: 5,
            offset: 128,
            object_length: 1024,
            flags: crate::types::flags::NONE,
            data: vec![0x42; 200],
        });

        let framed = encode_framed(&msg).unwrap();
        let prefix = u16::from_be_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(prefix, framed.len() - 2);
    }

    #[test]
    fn framed_incomplete_frame() {
        let incomplete = vec![0, 10]; // says 10 bytes follow, provides none
        let result = decode_framed(&incomplete);
        let Err(WireError::IncompleteFrame { expected, actual }) = result else {
            panic!("expected IncompleteFrame error, got {:?}", result);
        };
        assert_eq!(expected, 12); // 2 + 10
        assert_eq!(actual, 2);
    }

    #[test]
    fn framed_empty() {
        let empty: &[u8] = &[];
        let result = decode_framed(empty);
        assert!(matches!(result, Err(WireError::IncompleteFrame { .. })));
    }

    #[test]
    fn framed_partial_length_prefix() {
        let partial = vec![0u8]; // only 1 of 2 length bytes
        let result = decode_framed(&partial);
        assert!(result.is_err());
    }

    #[test]
    fn write_read_framed_via_cursor() {
        let msg = Message::new(MessagePayload::Notify {
            url: "camera/front/g3".to_string(),
        });

        let mut buffer = Vec::new();
        write_framed(&mut buffer, &msg).unwrap();

        let mut cursor = Cursor::new(buffer);
        let decoded = read_framed(&mut cursor).unwrap();

        assert_eq!(msg.version, decoded.version);
    }

    #[test]
    fn validate_version_compatible() {
        let v1_0 = ProtocolVersion {
            major: 1,
            minor: 0,
            patch: 0,
        };
        assert!(validate_version(&v1_0).is_ok());
    }

    #[test]
    fn validate_version_incompatible_major() {
        let v2_0 = ProtocolVersion {
            major: 2,
            minor: 0,
            patch: 0,
        };
        let result = validate_version(&v2_0);
        assert!(matches!(result, Err(WireError::IncompatibleVersion { .. })));
    }

    #[test]
    fn validate_version_newer_minor_is_compatible() {
        let v1_5 = ProtocolVersion {
            major: 1,
            minor: 5,
            patch: 0,
        };
        assert!(validate_version(&v1_5).is_ok());
    }

    #[test]
    fn serialize_all_message_types() {
        let messages = vec![
            MessagePayload::Subscribe {
                url_prefix: "a/".to_string(),
            },
            MessagePayload::Notify {
                url: "a/b".to_string(),
            },
            MessagePayload::Accept {
                transport_mode: TransportMode::Datagram,
                media_id: MediaId(9),
            },
            MessagePayload::StartPoint {
                group_id: GroupId(0),
                object_id: ObjectId(0),
            },
            MessagePayload::FinDatagram {
                group_id: GroupId(4),
                object_id: ObjectId(2),
            },
            MessagePayload::CachePolicy(CachePolicy::Default),
            MessagePayload::WarpHeader {
                media_id: MediaId(1),
                group_id: GroupId(2),
            },
            MessagePayload::ObjectHeader {
                object_id: ObjectId(3),
                nb_objects_previous_group: 12,
                flags: crate::types::flags::NONE,
                object_length: 900,
            },
        ];

        for payload in messages {
            let msg = Message::new(payload);
            let bytes = encode_message(&msg).unwrap();
            let decoded = decode_message(&bytes).unwrap();
            assert_eq!(msg.version, decoded.version);
        }
    }
}
