//! Envelope encoding and decoding
//!
//! The tag is resolved exactly once here. Anything that does not decode into
//! a known [`AgentMessage`] variant surfaces as a [`ProtocolError`] for that
//! single message; callers sharing a tunnel keep going.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::messages::{AgentMessage, MessageKind};
use crate::MAX_ENVELOPE_SIZE;

/// Envelope errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("Envelope too large: {size} bytes (max {max})")]
    Oversized { size: usize, max: usize },

    #[error("Failed to encode {kind} envelope: {source}")]
    Encode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct WireTag {
    #[serde(rename = "type")]
    kind: String,
}

/// A decoded message plus its creation time
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub message: AgentMessage,
}

impl Envelope {
    pub fn new(message: AgentMessage) -> Self {
        Self {
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let kind = self.kind();
        let payload = match &self.message {
            AgentMessage::Command(p) => serde_json::to_value(p),
            AgentMessage::Ping(p) | AgentMessage::Pong(p) => serde_json::to_value(p),
            AgentMessage::Shutdown(p) => serde_json::to_value(p),
            AgentMessage::VncData(p) => serde_json::to_value(p),
            AgentMessage::VncClose(p) => serde_json::to_value(p),
            AgentMessage::Heartbeat(p) => serde_json::to_value(p),
            AgentMessage::Ack(p) => serde_json::to_value(p),
            AgentMessage::Complete(p) => serde_json::to_value(p),
            AgentMessage::Failed(p) => serde_json::to_value(p),
            AgentMessage::Status(p) => serde_json::to_value(p),
            AgentMessage::VncReady(p) => serde_json::to_value(p),
            AgentMessage::VncError(p) => serde_json::to_value(p),
        }
        .map_err(|source| ProtocolError::Encode { kind, source })?;

        let wire = WireEnvelope {
            kind: kind.as_str().to_string(),
            timestamp: self.timestamp,
            payload,
        };

        serde_json::to_vec(&wire)
            .map(Bytes::from)
            .map_err(|source| ProtocolError::Encode { kind, source })
    }

    /// Decode from the JSON wire form
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_size(bytes)?;

        let wire: WireEnvelope = serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)?;
        let kind = MessageKind::parse(&wire.kind).ok_or(ProtocolError::UnknownType(wire.kind))?;
        let payload = wire.payload;

        let message = match kind {
            MessageKind::Command => AgentMessage::Command(typed(kind, payload)?),
            MessageKind::Ping => AgentMessage::Ping(typed(kind, payload)?),
            MessageKind::Shutdown => AgentMessage::Shutdown(typed(kind, payload)?),
            MessageKind::VncData => AgentMessage::VncData(typed(kind, payload)?),
            MessageKind::VncClose => AgentMessage::VncClose(typed(kind, payload)?),
            MessageKind::Pong => AgentMessage::Pong(typed(kind, payload)?),
            MessageKind::Heartbeat => AgentMessage::Heartbeat(typed(kind, payload)?),
            MessageKind::Ack => AgentMessage::Ack(typed(kind, payload)?),
            MessageKind::Complete => AgentMessage::Complete(typed(kind, payload)?),
            MessageKind::Failed => AgentMessage::Failed(typed(kind, payload)?),
            MessageKind::Status => AgentMessage::Status(typed(kind, payload)?),
            MessageKind::VncReady => AgentMessage::VncReady(typed(kind, payload)?),
            MessageKind::VncError => AgentMessage::VncError(typed(kind, payload)?),
        };

        Ok(Self {
            timestamp: wire.timestamp,
            message,
        })
    }

    /// Read only the `type` tag, leaving the payload untouched.
    ///
    /// Used by tunnel readers to route session traffic without paying for a
    /// full decode on the hot path.
    pub fn peek_kind(bytes: &[u8]) -> Result<MessageKind, ProtocolError> {
        check_size(bytes)?;
        let tag: WireTag = serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)?;
        MessageKind::parse(&tag.kind).ok_or(ProtocolError::UnknownType(tag.kind))
    }
}

impl From<AgentMessage> for Envelope {
    fn from(message: AgentMessage) -> Self {
        Envelope::new(message)
    }
}

fn check_size(bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(())
}

fn typed<T: DeserializeOwned>(kind: MessageKind, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HeartbeatPayload, VncErrorPayload};

    #[test]
    fn test_vnc_data_envelope_shape() {
        let envelope = Envelope::new(AgentMessage::vnc_data(
            "sess-123",
            Bytes::from_static(&[0x00, 0xff, 0x10]),
        ));

        let encoded = envelope.encode().unwrap();
        let json: Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(json["type"], "vnc_data");
        assert_eq!(json["payload"]["sessionId"], "sess-123");
        assert_eq!(json["payload"]["data"], "AP8Q");
        assert!(json["timestamp"].is_string());

        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_agent_error_message() {
        let raw = br#"{
            "type": "vnc_error",
            "timestamp": "2025-11-21T10:30:00Z",
            "payload": {"sessionId": "sess-456", "error": "Port-forward failed: pod not found"}
        }"#;

        let envelope = Envelope::decode(raw).unwrap();
        assert_eq!(
            envelope.message,
            AgentMessage::VncError(VncErrorPayload {
                session_id: "sess-456".to_string(),
                error: "Port-forward failed: pod not found".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_heartbeat_without_capacity() {
        let raw = br#"{"type":"heartbeat","timestamp":"2025-11-21T10:30:00Z","payload":{"status":"online","activeSessions":15}}"#;

        let envelope = Envelope::decode(raw).unwrap();
        assert_eq!(
            envelope.message,
            AgentMessage::Heartbeat(HeartbeatPayload {
                status: "online".to_string(),
                active_sessions: 15,
                capacity: None,
            })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let raw = br#"{"type":"vnc_stream","timestamp":"2025-11-21T10:30:00Z","payload":{}}"#;
        let err = Envelope::decode(raw).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "vnc_stream"));
    }

    #[test]
    fn test_decode_rejects_payload_of_wrong_shape() {
        // vnc_data without sessionId
        let raw = br#"{"type":"vnc_data","timestamp":"2025-11-21T10:30:00Z","payload":{"data":"AAAA"}}"#;
        let err = Envelope::decode(raw).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload {
                kind: MessageKind::VncData,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_envelope() {
        let huge = vec![b' '; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(
            Envelope::decode(&huge),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn test_peek_kind_ignores_payload() {
        // Payload is invalid for vnc_ready but the tag is still readable
        let raw = br#"{"type":"vnc_ready","timestamp":"2025-11-21T10:30:00Z","payload":{"bogus":true}}"#;
        assert_eq!(Envelope::peek_kind(raw).unwrap(), MessageKind::VncReady);
        assert!(Envelope::decode(raw).is_err());
    }
}
