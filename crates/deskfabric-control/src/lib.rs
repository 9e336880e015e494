//! Agent tunnel fabric
//!
//! [`AgentHub`] tracks the one live tunnel per agent. [`SessionRelay`] bridges
//! a client's VNC stream through the tunnel of the agent that owns the
//! session, keeping at most one active client per session.

pub mod access;
pub mod active_relays;
pub mod directory;
pub mod hub;
pub mod relay;
pub mod relay_handle;
pub mod transport;

pub use access::{AccessPolicy, OwnerOnly};
pub use active_relays::ActiveRelays;
pub use directory::{
    ConnectionCounters, DbSessionDirectory, DirectoryError, InMemorySessionDirectory,
    SessionDirectory, SessionRecord,
};
pub use deskfabric_relay_db::entities::session::SessionState;
pub use hub::{AgentConnection, AgentHub, AgentSummary, HubError, QueueConfig};
pub use relay::{validate_session_id, RelayError, RelayTicket, SessionRelay};
pub use relay_handle::{CloseReason, RelayHandle, RelayState};
pub use transport::{ClientTransport, FrameSink, FrameSource, TransportError};
