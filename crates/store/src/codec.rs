//! Pluggable value serialization.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Codec failures.
#[derive(Clone, Debug, Error)]
pub enum CodecError {
    /// Failed to serialize a value.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize bytes.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Opaque encode/decode capability used for stored values and wire payloads.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// Encode a value into bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Decode bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is invalid for `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// CBOR serializer.
#[derive(Clone, Copy, Debug, Default)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        let mut vec = Vec::new();
        ciborium::ser::into_writer(value, &mut vec)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        Ok(Bytes::from(vec))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        ciborium::de::from_reader(data).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}

/// JSON serializer, handy when stored values need to stay human readable.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}
