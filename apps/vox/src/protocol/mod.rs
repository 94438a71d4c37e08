//! Wire representation of signaling messages.
//!
//! Every frame is a single JSON object, adjacently tagged:
//! `{"type": "<tag>", "payload": { ... }}`. Session descriptions and ICE
//! candidates travel as opaque strings (they are JSON objects serialized into
//! a string field) and are never inspected here.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Version of the frame layout implemented by this module.
pub const WIRE_VERSION: &str = "vox-signaling/1";

const UNTAGGED: &str = "<untagged>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalingMessage {
    ClientConnect {
        client_id: String,
    },
    ClientConnected {
        server_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    Offer {
        from: String,
        to: String,
        sdp: String,
    },
    Answer {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        sdp: String,
    },
    IceCandidate {
        from: String,
        to: String,
        candidate: String,
    },
    ClientDisconnect {
        client_id: String,
    },
    ServerDisconnect {
        server_id: String,
    },
    Error {
        code: i64,
        message: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed signaling frame: {0}")]
    Malformed(String),
    #[error("{tag} message is missing required field `{field}`")]
    MissingField { tag: String, field: &'static str },
}

impl SignalingMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            SignalingMessage::ClientConnect { .. } => "client_connect",
            SignalingMessage::ClientConnected { .. } => "client_connected",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::ClientDisconnect { .. } => "client_disconnect",
            SignalingMessage::ServerDisconnect { .. } => "server_disconnect",
            SignalingMessage::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Decodes one frame.
///
/// `Ok(None)` means the frame carried a tag this client does not know; it is
/// logged and should be ignored by the caller.
pub fn decode(bytes: &[u8]) -> Result<Option<SignalingMessage>, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let Value::Object(object) = value else {
        return Err(DecodeError::Malformed("frame is not a JSON object".into()));
    };
    let tag = match object.get("type") {
        Some(Value::String(tag)) => tag.as_str(),
        _ => {
            return Err(DecodeError::MissingField {
                tag: UNTAGGED.into(),
                field: "type",
            });
        }
    };
    let Some(kind) = Tag::parse(tag) else {
        tracing::info!(target = "signaling", tag, "ignoring unknown signaling message");
        return Ok(None);
    };
    let payload = match object.get("payload") {
        Some(Value::Object(payload)) => payload,
        _ => {
            return Err(DecodeError::MissingField {
                tag: tag.into(),
                field: "payload",
            });
        }
    };
    let fields = Fields { tag, payload };

    let message = match kind {
        Tag::ClientConnect => SignalingMessage::ClientConnect {
            client_id: fields.required("client_id")?,
        },
        Tag::ClientConnected => SignalingMessage::ClientConnected {
            server_id: fields.required("server_id")?,
            client_id: fields.optional("client_id")?,
        },
        Tag::Offer => SignalingMessage::Offer {
            from: fields.required("from")?,
            to: fields.required("to")?,
            sdp: fields.required("sdp")?,
        },
        Tag::Answer => SignalingMessage::Answer {
            from: fields.optional("from")?,
            to: fields.optional("to")?,
            sdp: fields.required("sdp")?,
        },
        Tag::IceCandidate => SignalingMessage::IceCandidate {
            from: fields.required("from")?,
            to: fields.required("to")?,
            candidate: fields.required("candidate")?,
        },
        Tag::ClientDisconnect => SignalingMessage::ClientDisconnect {
            client_id: fields.required("client_id")?,
        },
        Tag::ServerDisconnect => SignalingMessage::ServerDisconnect {
            server_id: fields.required("server_id")?,
        },
        Tag::Error => SignalingMessage::Error {
            code: fields.integer("code")?,
            message: fields.required("message")?,
        },
    };
    Ok(Some(message))
}

#[derive(Debug, Clone, Copy)]
enum Tag {
    ClientConnect,
    ClientConnected,
    Offer,
    Answer,
    IceCandidate,
    ClientDisconnect,
    ServerDisconnect,
    Error,
}

impl Tag {
    fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "client_connect" => Tag::ClientConnect,
            "client_connected" => Tag::ClientConnected,
            "offer" => Tag::Offer,
            "answer" => Tag::Answer,
            "ice_candidate" => Tag::IceCandidate,
            "client_disconnect" => Tag::ClientDisconnect,
            "server_disconnect" => Tag::ServerDisconnect,
            "error" => Tag::Error,
            _ => return None,
        })
    }
}

struct Fields<'a> {
    tag: &'a str,
    payload: &'a Map<String, Value>,
}

impl Fields<'_> {
    fn missing(&self, field: &'static str) -> DecodeError {
        DecodeError::MissingField {
            tag: self.tag.into(),
            field,
        }
    }

    fn required(&self, field: &'static str) -> Result<String, DecodeError> {
        self.optional(field)?.ok_or_else(|| self.missing(field))
    }

    // Absent and null are both "not supplied"; any other non-string is rejected.
    fn optional(&self, field: &'static str) -> Result<Option<String>, DecodeError> {
        match self.payload.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(self.missing(field)),
        }
    }

    fn integer(&self, field: &'static str) -> Result<i64, DecodeError> {
        self.payload
            .get(field)
            .and_then(Value::as_i64)
            .ok_or_else(|| self.missing(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_str(text: &str) -> Result<Option<SignalingMessage>, DecodeError> {
        decode(text.as_bytes())
    }

    #[test]
    fn offer_is_adjacently_tagged_with_opaque_sdp() {
        let sdp = r#"{"type":"offer","sdp":"v=0\r\n"}"#.to_string();
        let message = SignalingMessage::Offer {
            from: "c1".into(),
            to: "s1".into(),
            sdp: sdp.clone(),
        };

        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "offer");
        assert_eq!(value["payload"]["from"], "c1");
        assert_eq!(value["payload"]["to"], "s1");
        assert_eq!(value["payload"]["sdp"], Value::String(sdp));
    }

    #[test]
    fn client_connected_reads_server_id_from_payload() {
        let decoded =
            decode_str(r#"{"type":"client_connected","payload":{"client_id":"c1","server_id":"s1"}}"#)
                .unwrap();

        assert_eq!(
            decoded,
            Some(SignalingMessage::ClientConnected {
                server_id: "s1".into(),
                client_id: Some("c1".into()),
            })
        );
    }

    #[test]
    fn answer_omits_absent_routing_fields() {
        let message = SignalingMessage::Answer {
            from: None,
            to: None,
            sdp: "{}".into(),
        };

        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        let payload = value["payload"].as_object().unwrap();

        assert_eq!(payload.len(), 1);
        assert_eq!(decode_str(&message.encode().unwrap()).unwrap(), Some(message));
    }

    #[test]
    fn unknown_tags_are_ignored() {
        assert_eq!(
            decode_str(r#"{"type":"room_created","payload":{"room_id":"r"}}"#),
            Ok(None)
        );
        assert_eq!(decode_str(r#"{"type":"ping"}"#), Ok(None));
    }

    #[test]
    fn offer_without_sdp_fails_closed() {
        let err = decode_str(r#"{"type":"offer","payload":{"from":"s1","to":"c1"}}"#).unwrap_err();

        assert_eq!(
            err,
            DecodeError::MissingField {
                tag: "offer".into(),
                field: "sdp",
            }
        );
    }

    #[test]
    fn identifiers_are_not_coerced() {
        let err =
            decode_str(r#"{"type":"client_connected","payload":{"server_id":42}}"#).unwrap_err();

        assert_eq!(
            err,
            DecodeError::MissingField {
                tag: "client_connected".into(),
                field: "server_id",
            }
        );
    }

    #[test]
    fn known_tag_without_payload_is_rejected() {
        let err = decode_str(r#"{"type":"ice_candidate","from":"a","to":"b"}"#).unwrap_err();

        assert!(matches!(err, DecodeError::MissingField { field: "payload", .. }));
    }

    #[test]
    fn garbage_and_untagged_frames_are_errors() {
        assert!(matches!(decode_str("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode_str("[1,2]"), Err(DecodeError::Malformed(_))));
        assert_eq!(
            decode_str(r#"{"payload":{}}"#),
            Err(DecodeError::MissingField {
                tag: UNTAGGED.into(),
                field: "type",
            })
        );
    }

    #[test]
    fn server_error_carries_integer_code() {
        let decoded =
            decode_str(r#"{"type":"error","payload":{"code":404,"message":"no rtc server"}}"#)
                .unwrap();

        assert_eq!(
            decoded,
            Some(SignalingMessage::Error {
                code: 404,
                message: "no rtc server".into(),
            })
        );
        assert!(decode_str(r#"{"type":"error","payload":{"code":"404","message":"x"}}"#).is_err());
    }

    #[test]
    fn disconnect_and_error_frames_use_the_same_envelope() {
        let disconnect = SignalingMessage::ClientDisconnect {
            client_id: "c1".into(),
        };
        assert_eq!(
            disconnect.encode().unwrap(),
            r#"{"type":"client_disconnect","payload":{"client_id":"c1"}}"#
        );

        let error = SignalingMessage::Error {
            code: 503,
            message: "busy".into(),
        };
        let value: Value = serde_json::from_str(&error.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], 503);
        assert_eq!(decode_str(&error.encode().unwrap()).unwrap(), Some(error));
    }
}
