// Pluggable message serialization over opaque string bodies.
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SerializationError;

/// Encodes typed messages to string bodies and back.
///
/// Round-trip requirement: for any message `m` of type `M`,
/// `from_string(&to_string(&m)?)?` is semantically equal to `m`. Decode
/// failures are consumer failures from the engine's point of view and flow
/// through the exception resolver.
pub trait MessageSerializer: Send + Sync + 'static {
    fn to_string<M: Serialize>(&self, message: &M) -> Result<String, SerializationError>;

    fn from_string<M: DeserializeOwned>(&self, body: &str) -> Result<M, SerializationError>;
}

/// JSON serializer used unless a subscriber or publisher overrides it.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageSerializer;

impl MessageSerializer for JsonMessageSerializer {
    fn to_string<M: Serialize>(&self, message: &M) -> Result<String, SerializationError> {
        serde_json::to_string(message)
            .map_err(|err| SerializationError::with_source("encode message as json", err))
    }

    fn from_string<M: DeserializeOwned>(&self, body: &str) -> Result<M, SerializationError> {
        serde_json::from_str(body)
            .map_err(|err| SerializationError::with_source("decode message from json", err))
    }
}
