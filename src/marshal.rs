//! Conversion between [`Message`] and STOMP frames
//!
//! Metadata travels as frame headers; the message UUID travels in one
//! reserved header whose name is configurable.

use crate::message::Message;
use crate::transport::stomp::frame::header;
use crate::transport::Frame;
use thiserror::Error;

/// Default header carrying the message UUID
pub const DEFAULT_MESSAGE_UUID_HEADER_KEY: &str = "_message_uuid";

/// Headers owned by the STOMP protocol; never copied to or from metadata
pub const PROTOCOL_HEADERS: &[&str] = &[
    header::DESTINATION,
    header::MESSAGE_ID,
    header::SUBSCRIPTION,
    header::ACK,
    header::TRANSACTION,
    header::RECEIPT,
    header::RECEIPT_ID,
    header::CONTENT_LENGTH,
];

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("metadata key '{0}' collides with a reserved header")]
    ReservedHeader(String),
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Converts messages to frames and back
pub trait Marshaler: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Frame, MarshalError>;

    fn decode(&self, frame: &Frame) -> Result<Message, MarshalError>;
}

/// Header-based marshaler
#[derive(Debug, Clone, Default)]
pub struct DefaultMarshaler {
    /// Header used to store and read the message UUID.
    /// Empty means [`DEFAULT_MESSAGE_UUID_HEADER_KEY`].
    pub message_uuid_header_key: String,
}

impl DefaultMarshaler {
    pub fn new(message_uuid_header_key: impl Into<String>) -> Self {
        Self {
            message_uuid_header_key: message_uuid_header_key.into(),
        }
    }

    pub fn uuid_header_key(&self) -> &str {
        if self.message_uuid_header_key.is_empty() {
            DEFAULT_MESSAGE_UUID_HEADER_KEY
        } else {
            &self.message_uuid_header_key
        }
    }

    fn is_reserved(&self, key: &str) -> bool {
        key == self.uuid_header_key() || PROTOCOL_HEADERS.contains(&key)
    }
}

impl Marshaler for DefaultMarshaler {
    fn encode(&self, msg: &Message) -> Result<Frame, MarshalError> {
        let mut frame = Frame::new("SEND");

        for (key, value) in msg.metadata.iter() {
            if self.is_reserved(key) {
                return Err(MarshalError::ReservedHeader(key.to_string()));
            }
            frame.add_header(key, value);
        }
        frame.add_header(self.uuid_header_key(), msg.uuid.as_str());
        frame.body = msg.payload.clone();

        Ok(frame)
    }

    fn decode(&self, frame: &Frame) -> Result<Message, MarshalError> {
        let uuid = frame.get(self.uuid_header_key()).unwrap_or_default();
        let mut msg = Message::new(uuid, frame.body.clone());

        for (key, value) in &frame.headers {
            if self.is_reserved(key) || msg.metadata.contains_key(key) {
                continue;
            }
            msg.metadata.set(key.as_str(), value.as_str());
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    #[test]
    fn test_encode_adds_uuid_header_and_body() {
        let msg = Message::new("uuid-1", "hello").with_metadata("color", "red");
        let frame = DefaultMarshaler::default().encode(&msg).unwrap();

        assert_eq!(frame.get(DEFAULT_MESSAGE_UUID_HEADER_KEY), Some("uuid-1"));
        assert_eq!(frame.get("color"), Some("red"));
        assert_eq!(frame.body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_custom_uuid_header_key() {
        let marshaler = DefaultMarshaler::new("x-id");
        let frame = marshaler.encode(&Message::new("abc", "")).unwrap();
        assert_eq!(frame.get("x-id"), Some("abc"));
        assert!(!frame.contains(DEFAULT_MESSAGE_UUID_HEADER_KEY));

        let decoded = marshaler.decode(&frame).unwrap();
        assert_eq!(decoded.uuid, "abc");
    }

    #[test]
    fn test_missing_uuid_header_decodes_to_empty_uuid() {
        let frame = Frame::new("MESSAGE").header("k", "v").body(&b"x"[..]);
        let msg = DefaultMarshaler::default().decode(&frame).unwrap();
        assert_eq!(msg.uuid, "");
        assert_eq!(msg.metadata.get("k"), Some("v"));
    }

    #[test]
    fn test_decode_skips_protocol_headers() {
        let frame = Frame::new("MESSAGE")
            .header("destination", "/queue/a")
            .header("message-id", "7")
            .header("subscription", "0")
            .header("ack", "7")
            .header(DEFAULT_MESSAGE_UUID_HEADER_KEY, "u")
            .header("app", "1");
        let msg = DefaultMarshaler::default().decode(&frame).unwrap();
        assert_eq!(msg.metadata.len(), 1);
        assert_eq!(msg.metadata.get("app"), Some("1"));
    }

    #[test]
    fn test_encode_rejects_reserved_metadata() {
        let marshaler = DefaultMarshaler::default();

        let uuid_clash = Message::new("1", "").with_metadata(DEFAULT_MESSAGE_UUID_HEADER_KEY, "x");
        assert!(matches!(
            marshaler.encode(&uuid_clash),
            Err(MarshalError::ReservedHeader(_))
        ));

        let protocol_clash = Message::new("1", "").with_metadata("destination", "/elsewhere");
        assert!(matches!(
            marshaler.encode(&protocol_clash),
            Err(MarshalError::ReservedHeader(_))
        ));
    }

    fn metadata_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,12}".prop_filter("reserved header", |k| {
            k != DEFAULT_MESSAGE_UUID_HEADER_KEY && !PROTOCOL_HEADERS.contains(&k.as_str())
        })
    }

    proptest! {
        #[test]
        fn prop_encode_decode_round_trip(
            uuid in "[a-f0-9-]{0,36}",
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            metadata in proptest::collection::hash_map(metadata_key(), ".{0,24}", 0..8),
        ) {
            let marshaler = DefaultMarshaler::default();
            let mut msg = Message::new(uuid.clone(), payload.clone());
            for (k, v) in &metadata {
                msg.metadata.set(k.as_str(), v.as_str());
            }

            let decoded = marshaler.decode(&marshaler.encode(&msg).unwrap()).unwrap();

            prop_assert_eq!(decoded.uuid, uuid);
            prop_assert_eq!(decoded.payload.to_vec(), payload);
            prop_assert_eq!(decoded.metadata, crate::message::Metadata::from(metadata));
        }
    }
}
