//! WebSocket client transport
//!
//! Adapts an upgraded axum WebSocket to the relay's frame interface. Each
//! binary message is one frame. Text messages are accepted as raw bytes for
//! clients that cannot send binary.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use deskfabric_control::transport::TransportResult;
use deskfabric_control::{ClientTransport, FrameSink, FrameSource, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::trace;

pub struct WsClientTransport {
    socket: WebSocket,
    max_frame_size: usize,
}

impl WsClientTransport {
    pub fn new(socket: WebSocket, max_frame_size: usize) -> Self {
        Self {
            socket,
            max_frame_size,
        }
    }
}

impl ClientTransport for WsClientTransport {
    type Source = WsFrameSource;
    type Sink = WsFrameSink;

    fn split(self) -> (Self::Source, Self::Sink) {
        let (sink, stream) = self.socket.split();
        (
            WsFrameSource {
                stream,
                max_frame_size: self.max_frame_size,
            },
            WsFrameSink {
                sink,
                closed: false,
            },
        )
    }
}

pub struct WsFrameSource {
    stream: SplitStream<WebSocket>,
    max_frame_size: usize,
}

impl WsFrameSource {
    fn check_size(&self, frame: Bytes) -> TransportResult<Bytes> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        Ok(frame)
    }
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>> {
        while let Some(message) = self.stream.next().await {
            let message = message.map_err(|e| TransportError::ConnectionError(e.to_string()))?;

            match message {
                Message::Binary(data) => return self.check_size(data).map(Some),
                Message::Text(text) => {
                    let data = Bytes::copy_from_slice(text.as_str().as_bytes());
                    return self.check_size(data).map(Some);
                }
                Message::Close(frame) => {
                    trace!("Client sent close frame: {:?}", frame);
                    return Ok(None);
                }
                // axum answers pings itself
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }

        Ok(None)
    }
}

pub struct WsFrameSink {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        self.sink
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // The peer may already be gone; a failed close frame is not an error
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}
