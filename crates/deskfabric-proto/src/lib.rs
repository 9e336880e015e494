//! Agent Tunnel Protocol Definitions
//!
//! This crate defines the envelope that multiplexes many logical channels
//! (VNC data, tunnel close/error, heartbeats, command lifecycle) over the one
//! long-lived connection each agent keeps open to the control plane.
//!
//! Every message on the wire is a JSON object of the form
//! `{"type": "...", "timestamp": "...", "payload": {...}}`. The `type` tag is
//! resolved once, in [`Envelope::decode`], into the closed [`AgentMessage`]
//! enum so callers match exhaustively instead of re-parsing payloads.

pub mod envelope;
pub mod messages;

pub use envelope::{Envelope, ProtocolError};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded envelope size accepted from an agent (512 KiB)
pub const MAX_ENVELOPE_SIZE: usize = 512 * 1024;
