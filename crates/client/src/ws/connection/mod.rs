//! Transport socket: one physical WebSocket carrying framed events.
//!
//! This module provides the transport-agnostic types; `connection_native`
//! dials real sockets with tokio-tungstenite.

use async_trait::async_trait;
use deskline_shared::{Frame, ABNORMAL_CLOSE_CODE};
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;

/// Connection state for the real-time socket
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket is open; the wanted channels are being (re)subscribed.
    Authenticating,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. })
    }
}

/// Writer-side commands for the socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Raw reader-side events, before frame decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Text(String),
    Error(String),
    Closed { code: u16 },
}

/// Decoded transport lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(Frame),
    Error(String),
    Closed { code: u16 },
}

/// Handle for sending frames through the live socket
#[derive(Clone, Debug)]
pub struct WsHandle {
    sender: UnboundedSender<Outbound>,
}

impl WsHandle {
    pub fn new(sender: UnboundedSender<Outbound>) -> Self {
        Self { sender }
    }

    /// Queue a frame. Returns `false` once the socket's writer is gone.
    pub fn send(&self, frame: &Frame) -> bool {
        match frame.to_text() {
            Ok(json) => {
                crate::log_debug!("Sending: {}", json);
                self.sender.unbounded_send(Outbound::Text(json)).is_ok()
            }
            Err(e) => {
                crate::log_error!("Serialize failed: {}", e);
                false
            }
        }
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.unbounded_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// One live connection: a send handle plus the inbound event stream.
pub struct TransportSocket {
    handle: WsHandle,
    inbound: UnboundedReceiver<Incoming>,
    closed: bool,
}

impl TransportSocket {
    pub fn new(handle: WsHandle, inbound: UnboundedReceiver<Incoming>) -> Self {
        Self {
            handle,
            inbound,
            closed: false,
        }
    }

    pub fn handle(&self) -> WsHandle {
        self.handle.clone()
    }

    pub fn send(&self, frame: &Frame) -> bool {
        !self.closed && self.handle.send(frame)
    }

    pub fn close(&mut self, code: u16, reason: &str) {
        if !self.closed {
            self.closed = true;
            self.handle.close(code, reason);
        }
    }

    /// Next lifecycle event. Malformed frames are logged and skipped; a
    /// vanished reader reports an abnormal close.
    pub async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.inbound.next().await {
                Some(Incoming::Text(text)) => match Frame::parse(&text) {
                    Ok(frame) => return TransportEvent::Frame(frame),
                    Err(e) => crate::log_warn!("Dropping malformed frame ({}): {}", e, text),
                },
                Some(Incoming::Error(e)) => return TransportEvent::Error(e),
                Some(Incoming::Closed { code }) => {
                    self.closed = true;
                    return TransportEvent::Closed { code };
                }
                None => {
                    self.closed = true;
                    return TransportEvent::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                    };
                }
            }
        }
    }
}

/// Opens physical sockets. Tests swap in an in-memory implementation.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<TransportSocket, String>;
}

mod connection_native;
pub use connection_native::TungsteniteConnector;
