use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::api::schema::{CodecError, Schema, SchemaType};

/// The compact binary form of the message schema, exchanged inside the
/// length-prefixed TCP frames.
#[derive(Debug, Default)]
pub struct Binary;

impl Schema for Binary {
    fn schema_type() -> SchemaType {
        SchemaType::Binary
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(postcard::to_allocvec(value)?)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
        Ok(postcard::from_bytes(buf)?)
    }
}
