//! Storage blob codec for message records.
//!
//! Stores persist [`Message`] records as opaque postcard blobs, the way
//! the history and sending tables keep a serialized message column.
//! This codec is for storage only; the wire encoding of protocol frames
//! is owned by the transport layer.

use crate::message::Message;

/// Error type for blob encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes a [`Message`] into a storage blob.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the record cannot be
/// serialized.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`Message`] from a storage blob.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the blob cannot be
/// deserialized.
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}
