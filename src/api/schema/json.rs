use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::api::schema::{CodecError, Schema, SchemaType};

/// The JSON projection of the message schema, exchanged as WebSocket text
/// frames.
#[derive(Debug, Default)]
pub struct Json;

impl Schema for Json {
    fn schema_type() -> SchemaType {
        SchemaType::Text
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(buf)?)
    }
}
