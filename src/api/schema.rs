use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub mod binary;
pub mod json;

pub use binary::Binary;
pub use json::Json;

/// Whether a schema's output is text (carried in WebSocket text frames) or
/// raw bytes (carried in length-prefixed TCP frames).
pub enum SchemaType {
    Text,
    Binary,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary codec: {0}")]
    Binary(#[from] postcard::Error),
}

/// One serialization surface over the shared message types. Both schemas
/// project the same serde-described tree, so the JSON form is the canonical
/// text projection of the binary form.
pub trait Schema {
    fn schema_type() -> SchemaType;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::message::{CellPos, ClientToServer, ServerToClient};
    use crate::rules::{ActionMode, ActionState};

    fn sample_events() -> Vec<ServerToClient> {
        vec![
            ServerToClient::Error {
                error: "nope".into(),
            },
            ServerToClient::EventMapGenerate {
                width: 20,
                height: 20,
            },
            ServerToClient::EventUnitCreate {
                unit_id: 7,
                player_id: 0,
                unit_type_id: 1,
                position: CellPos { x: 3, y: 9 },
            },
            ServerToClient::EventActionUpdate {
                action_id: 2,
                state: ActionState::Wait,
                message: Some("Not enough wood (got 0, need 5)".into()),
            },
            ServerToClient::EventPlayerResource {
                resource_type_id: 2,
                amount: 80,
            },
        ]
    }

    #[test]
    fn both_schemas_round_trip_every_sample() {
        for event in sample_events() {
            let json = Json::encode(&event).expect("json encode");
            let binary = Binary::encode(&event).expect("binary encode");
            assert_eq!(
                Json::decode::<ServerToClient>(&json).expect("json decode"),
                event
            );
            assert_eq!(
                Binary::decode::<ServerToClient>(&binary).expect("binary decode"),
                event
            );
        }
    }

    #[test]
    fn json_and_binary_agree_on_the_message_tree() {
        let command = ClientToServer::CmdActionQueue {
            action_type_id: 2,
            unit_id: 5,
            target_unit_id: None,
            target_cell: Some(CellPos { x: 1, y: 2 }),
            mode: ActionMode::Repeat,
        };
        let via_json: ClientToServer =
            Json::decode(&Json::encode(&command).expect("encode")).expect("decode");
        let via_binary: ClientToServer =
            Binary::decode(&Binary::encode(&command).expect("encode")).expect("decode");
        assert_eq!(via_json, via_binary);
    }

    #[test]
    fn json_discriminator_is_the_payload_field() {
        let json = Json::encode(&ServerToClient::EventGameStart).expect("encode");
        assert_eq!(String::from_utf8(json).expect("utf8"), "\"EventGameStart\"");

        let json = Json::encode(&ClientToServer::CmdJoin { name: "A".into() }).expect("encode");
        assert_eq!(
            String::from_utf8(json).expect("utf8"),
            "{\"CmdJoin\":{\"name\":\"A\"}}"
        );
    }

    #[test]
    fn malformed_input_is_a_codec_error() {
        assert!(Json::decode::<ClientToServer>(b"{\"CmdNope\":{}}").is_err());
        assert!(Binary::decode::<ClientToServer>(&[0xff, 0xff, 0xff]).is_err());
    }
}
