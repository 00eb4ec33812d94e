//! Client-facing wire protocol.
//!
//! Streaming talk uses JSON-over-WebSocket text frames tagged by `type`.
//! Audio payloads travel as base64 inside JSON; inbound binary frames are
//! also accepted as audio chunks by the gateway.
//!
//! Turn-based talk uses the request/response bodies at the bottom of this file.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Client -> Server streaming events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    CreateConversation { scenario_id: String },

    AudioChunk {
        #[serde(with = "base64_bytes")]
        bytes: Bytes,
    },

    EndAudio,
}

/// Server -> Client streaming events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Acknowledges `createConversation` with the server-generated session id.
    #[serde(rename_all = "camelCase")]
    ConversationCreated { session_id: String },

    /// Final transcript of the user's utterance.
    Transcript { text: String },

    AiTextChunk { text: String },

    AudioChunk {
        #[serde(with = "base64_bytes")]
        bytes: Bytes,
    },

    EndAudioResponse,

    FinalResponse { text: String },

    StreamError { code: String, message: String },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::StreamError {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Event name as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConversationCreated { .. } => "conversationCreated",
            Self::Transcript { .. } => "transcript",
            Self::AiTextChunk { .. } => "aiTextChunk",
            Self::AudioChunk { .. } => "audioChunk",
            Self::EndAudioResponse => "endAudioResponse",
            Self::FinalResponse { .. } => "finalResponse",
            Self::StreamError { .. } => "streamError",
        }
    }
}

// --- Turn-based bodies ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTalkRequest {
    pub scenario_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTurnRequest {
    pub audio_bytes_base64: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkReply {
    pub text: String,
    pub audio_bytes_base64: String,
}

impl TalkReply {
    pub fn new(text: String, audio: &[u8]) -> Self {
        Self {
            text,
            audio_bytes_base64: STANDARD.encode(audio),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTalkResponse {
    pub session_id: String,
    pub reply: TalkReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTurnResponse {
    pub transcript: String,
    pub reply: TalkReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContextResponse {
    pub session_id: String,
    /// Serialized history exactly as stored.
    pub history: String,
}

/// Decode a base64 audio payload from a request body.
pub fn decode_audio(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded.trim())
}

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_tags() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"type":"createConversation","scenarioId":"bus-rush-hour"}"#)
                .unwrap();
        assert_eq!(
            ev,
            ClientEvent::CreateConversation {
                scenario_id: "bus-rush-hour".into()
            }
        );

        let ev: ClientEvent = serde_json::from_str(r#"{"type":"endAudio"}"#).unwrap();
        assert_eq!(ev, ClientEvent::EndAudio);
    }

    #[test]
    fn test_audio_chunk_is_base64() {
        let ev: ClientEvent =
            serde_json::from_str(r#"{"type":"audioChunk","bytes":"AQID"}"#).unwrap();
        assert_eq!(
            ev,
            ClientEvent::AudioChunk {
                bytes: Bytes::from_static(&[1, 2, 3])
            }
        );

        let out = serde_json::to_value(ServerEvent::AudioChunk {
            bytes: Bytes::from_static(&[1, 2, 3]),
        })
        .unwrap();
        assert_eq!(out["type"], "audioChunk");
        assert_eq!(out["bytes"], "AQID");
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let res = serde_json::from_str::<ClientEvent>(r#"{"type":"audioChunk","bytes":"%%%"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_server_event_kind_matches_tag() {
        let events = [
            ServerEvent::EndAudioResponse,
            ServerEvent::FinalResponse { text: "bye".into() },
            ServerEvent::error("session_not_found", "gone"),
            ServerEvent::AiTextChunk { text: "hi".into() },
        ];
        for ev in events {
            let json = serde_json::to_value(&ev).unwrap();
            assert_eq!(json["type"], ev.kind());
        }
    }

    #[test]
    fn test_reply_encodes_audio() {
        let reply = TalkReply::new("hello".into(), &[1, 2, 3]);
        assert_eq!(reply.audio_bytes_base64, "AQID");
        assert_eq!(decode_audio(&reply.audio_bytes_base64).unwrap(), vec![1, 2, 3]);
    }
}
