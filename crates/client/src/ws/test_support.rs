//! In-memory transport and authorizer for driving the facade in tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deskline_shared::{AuthGrant, ChannelName, Frame};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};

use super::auth::ChannelAuthorizer;
use super::connection::{Connector, Incoming, Outbound, TransportSocket, WsHandle};
use crate::config::{HeartbeatConfig, RealtimeConfig, ReconnectConfig};

/// Fast backoff and a heartbeat that stays out of the way.
pub(crate) fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        ws_url: "ws://realtime.test".to_string(),
        app_key: None,
        reconnect: ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        },
        heartbeat: HeartbeatConfig {
            ping_interval: Duration::from_secs(3600),
            timeout_multiplier: 2,
        },
        ..RealtimeConfig::default()
    }
}

/// Hands every accepted connection to the test as a `MockPeer`.
pub(crate) struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    refuse: AtomicUsize,
    connects: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            refuse: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Fail the next `n` connection attempts.
    pub(crate) fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<TransportSocket, String> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(format!("connection to {url} refused"));
        }

        let (out_tx, out_rx) = unbounded();
        let (in_tx, in_rx) = unbounded();
        let _ = self.peers.send(MockPeer {
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(TransportSocket::new(WsHandle::new(out_tx), in_rx))
    }
}

/// The server side of one mock connection.
pub(crate) struct MockPeer {
    from_client: UnboundedReceiver<Outbound>,
    to_client: UnboundedSender<Incoming>,
}

impl MockPeer {
    pub(crate) fn send_raw(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Incoming::Text(text.to_string()));
    }

    pub(crate) fn send(&self, frame: Value) {
        self.send_raw(&frame.to_string());
    }

    /// `connection_established`, with `data` double-encoded like Pusher does.
    pub(crate) fn establish(&self, socket_id: &str) {
        let data = json!({ "socket_id": socket_id, "activity_timeout": 120 });
        self.send(json!({
            "event": "pusher:connection_established",
            "data": data.to_string(),
        }));
    }

    pub(crate) fn ack(&self, wire_channel: &str) {
        self.send(json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": wire_channel,
            "data": "{}",
        }));
    }

    /// `subscription_error`, optionally without naming the channel.
    pub(crate) fn reject(&self, wire_channel: Option<&str>, status: u16) {
        let mut frame = json!({
            "event": "pusher:subscription_error",
            "data": json!({ "type": "AuthError", "error": "forbidden", "status": status }).to_string(),
        });
        if let Some(channel) = wire_channel {
            frame["channel"] = json!(channel);
        }
        self.send(frame);
    }

    pub(crate) fn event(&self, event: &str, wire_channel: &str, data: Value) {
        self.send(json!({
            "event": event,
            "channel": wire_channel,
            "data": data.to_string(),
        }));
    }

    pub(crate) fn close(&self, code: u16) {
        let _ = self.to_client.unbounded_send(Incoming::Closed { code });
    }

    pub(crate) async fn next_outbound(&mut self) -> Option<Outbound> {
        tokio::time::timeout(Duration::from_secs(600), self.from_client.next())
            .await
            .unwrap_or(None)
    }

    /// Next text frame sent by the client. Panics on close or timeout.
    pub(crate) async fn next_frame(&mut self) -> Frame {
        match self.next_outbound().await {
            Some(Outbound::Text(text)) => Frame::parse(&text).expect("client sent a bad frame"),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    /// Frames already queued, without waiting.
    pub(crate) fn drain(&mut self) -> Vec<Outbound> {
        let mut queued = Vec::new();
        while let Some(Some(outbound)) = self.from_client.next().now_or_never() {
            queued.push(outbound);
        }
        queued
    }
}

/// Grants everything not explicitly denied, optionally held behind a gate.
pub(crate) struct ScriptedAuthorizer {
    calls: Mutex<Vec<(ChannelName, String)>>,
    denied: Mutex<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedAuthorizer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            denied: Mutex::new(HashSet::new()),
            gate: None,
        })
    }

    /// Each authorization waits for one permit on the returned semaphore.
    pub(crate) fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let auth = Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            denied: Mutex::new(HashSet::new()),
            gate: Some(gate.clone()),
        });
        (auth, gate)
    }

    pub(crate) fn deny(&self, logical: &str) {
        self.denied.lock().insert(logical.to_string());
    }

    /// `(channel, socket id)` for every call, in order.
    pub(crate) fn calls(&self) -> Vec<(ChannelName, String)> {
        self.calls.lock().clone()
    }

    pub(crate) fn call_count(&self, logical: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(channel, _)| channel.logical() == logical)
            .count()
    }
}

#[async_trait]
impl ChannelAuthorizer for ScriptedAuthorizer {
    async fn authorize(&self, channel: &ChannelName, socket_id: &str) -> Option<AuthGrant> {
        self.calls
            .lock()
            .push((channel.clone(), socket_id.to_string()));

        if let Some(gate) = &self.gate {
            gate.acquire().await.ok()?.forget();
        }

        let denied = self.denied.lock().contains(channel.logical());
        if denied {
            return None;
        }
        Some(AuthGrant {
            auth: format!("key:{}:{}", channel.wire(), socket_id),
            channel_data: None,
        })
    }
}
