//! Protocol message types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire tag carried in the envelope `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Control plane -> agent
    Command,
    Ping,
    Shutdown,
    // Both directions
    VncData,
    VncClose,
    // Agent -> control plane
    Pong,
    Heartbeat,
    Ack,
    Complete,
    Failed,
    Status,
    VncReady,
    VncError,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Ping => "ping",
            MessageKind::Shutdown => "shutdown",
            MessageKind::VncData => "vnc_data",
            MessageKind::VncClose => "vnc_close",
            MessageKind::Pong => "pong",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Ack => "ack",
            MessageKind::Complete => "complete",
            MessageKind::Failed => "failed",
            MessageKind::Status => "status",
            MessageKind::VncReady => "vnc_ready",
            MessageKind::VncError => "vnc_error",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        let kind = match tag {
            "command" => MessageKind::Command,
            "ping" => MessageKind::Ping,
            "shutdown" => MessageKind::Shutdown,
            "vnc_data" => MessageKind::VncData,
            "vnc_close" => MessageKind::VncClose,
            "pong" => MessageKind::Pong,
            "heartbeat" => MessageKind::Heartbeat,
            "ack" => MessageKind::Ack,
            "complete" => MessageKind::Complete,
            "failed" => MessageKind::Failed,
            "status" => MessageKind::Status,
            "vnc_ready" => MessageKind::VncReady,
            "vnc_error" => MessageKind::VncError,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether this message belongs to a per-session VNC channel and should be
    /// fanned out to relays rather than handled by the tunnel itself
    pub fn is_session_traffic(&self) -> bool {
        matches!(
            self,
            MessageKind::VncData
                | MessageKind::VncClose
                | MessageKind::VncReady
                | MessageKind::VncError
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of messages carried over an agent tunnel
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Command(CommandPayload),
    Ping(PingPayload),
    Shutdown(ShutdownPayload),
    VncData(VncDataPayload),
    VncClose(VncClosePayload),
    Pong(PingPayload),
    Heartbeat(HeartbeatPayload),
    Ack(AckPayload),
    Complete(CompletePayload),
    Failed(FailedPayload),
    Status(StatusPayload),
    VncReady(VncReadyPayload),
    VncError(VncErrorPayload),
}

impl AgentMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            AgentMessage::Command(_) => MessageKind::Command,
            AgentMessage::Ping(_) => MessageKind::Ping,
            AgentMessage::Shutdown(_) => MessageKind::Shutdown,
            AgentMessage::VncData(_) => MessageKind::VncData,
            AgentMessage::VncClose(_) => MessageKind::VncClose,
            AgentMessage::Pong(_) => MessageKind::Pong,
            AgentMessage::Heartbeat(_) => MessageKind::Heartbeat,
            AgentMessage::Ack(_) => MessageKind::Ack,
            AgentMessage::Complete(_) => MessageKind::Complete,
            AgentMessage::Failed(_) => MessageKind::Failed,
            AgentMessage::Status(_) => MessageKind::Status,
            AgentMessage::VncReady(_) => MessageKind::VncReady,
            AgentMessage::VncError(_) => MessageKind::VncError,
        }
    }

    /// Demultiplexing key for session-scoped messages
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentMessage::VncData(p) => Some(&p.session_id),
            AgentMessage::VncClose(p) => Some(&p.session_id),
            AgentMessage::VncReady(p) => Some(&p.session_id),
            AgentMessage::VncError(p) => Some(&p.session_id),
            AgentMessage::Status(p) => Some(&p.session_id),
            _ => None,
        }
    }

    pub fn vnc_data(session_id: impl Into<String>, data: Bytes) -> Self {
        AgentMessage::VncData(VncDataPayload {
            session_id: session_id.into(),
            data,
        })
    }

    pub fn vnc_close(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentMessage::VncClose(VncClosePayload {
            session_id: session_id.into(),
            reason: reason.into(),
        })
    }

    pub fn ping() -> Self {
        AgentMessage::Ping(PingPayload {
            timestamp: Utc::now(),
        })
    }
}

/// VNC bytes for one session.
///
/// On the agent tunnel `data` is always standard base64; relays hand the
/// decoded bytes to clients verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncDataPayload {
    pub session_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

/// Tear down one session's tunnel on the receiving side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncClosePayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Agent-side failure of one session's tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncErrorPayload {
    pub session_id: String,
    pub error: String,
}

/// Agent reports that its port-forward to the session pod is up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VncReadyPayload {
    pub session_id: String,
    pub vnc_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub status: String,
    #[serde(default)]
    pub active_sessions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<AgentCapacity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapacity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub command_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayload {
    pub command_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub session_id: String,
    pub state: String,
    #[serde(default)]
    pub vnc_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ShutdownPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// Frame bytes travel as base64 text inside the JSON payload
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
