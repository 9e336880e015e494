//! Client transport abstraction
//!
//! The relay only needs to read whole frames from the client and write whole
//! frames back. Anything that can do that (an axum WebSocket, a TCP stream
//! with a length codec, an in-memory pair in tests) can carry a VNC session.
//!
//! A transport is split into an owned read half and write half so the two
//! relay pumps can drive them concurrently without sharing a lock.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Read half of a client transport
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the peer closed the connection gracefully.
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>>;
}

/// Write half of a client transport
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame, preserving its bytes exactly
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&mut self) -> TransportResult<()>;
}

/// A bidirectional, frame-oriented client connection
pub trait ClientTransport: Send + 'static {
    type Source: FrameSource + 'static;
    type Sink: FrameSink + 'static;

    fn split(self) -> (Self::Source, Self::Sink);
}
