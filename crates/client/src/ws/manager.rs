//! Public facade over the real-time connection.
//!
//! `WsManager` is the only type the rest of an application touches. Every
//! call is synchronous and non-failing: state-changing requests are queued for
//! the driver task, and sends return `false` instead of erroring when the
//! connection or channel is not ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deskline_shared::{ChannelName, Frame, CLIENT_MESSAGE_READ_EVENT, CLIENT_TYPING_EVENT};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::auth::ChannelAuthorizer;
use super::connection::{ConnectionState, Connector};
use super::dispatcher::{ChannelEvent, HandlerId, HandlerKind, TypingEvent};
use super::driver::{Command, Driver, Shared};
use super::registry::Release;
use crate::config::RealtimeConfig;

/// Owns one real-time session: a single socket multiplexed across channels.
///
/// Must be created inside a tokio runtime. Dropping the manager stops the
/// driver; `dispose` does the same and waits for it to finish.
pub struct WsManager {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl WsManager {
    /// Spawn the driver and start connecting.
    pub fn init(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
        authorizer: Arc<dyn ChannelAuthorizer>,
    ) -> Result<Self, url::ParseError> {
        let url = config.socket_url()?;
        let (shared, commands) = Shared::new(config.dedup_window);
        let driver = Driver::new(
            &config,
            url.to_string(),
            connector,
            authorizer,
            shared.clone(),
            commands,
        );
        let task = tokio::spawn(driver.run());
        shared.send_command(Command::Connect);

        Ok(Self {
            shared,
            task: Some(task),
        })
    }

    /// Reconnect after `disconnect()`. Ignored while connected or connecting,
    /// and while `Failed` (use `retry`).
    pub fn connect(&self) {
        self.shared.send_command(Command::Connect);
    }

    /// Close the socket for good. Never triggers a reconnect.
    pub fn disconnect(&self) {
        self.shared.send_command(Command::Disconnect);
    }

    /// Leave `Failed` (or cut a backoff wait short) with a fresh attempt budget.
    pub fn retry(&self) {
        self.shared.send_command(Command::Retry);
    }

    /// Disconnect and wait for the driver to stop.
    pub async fn dispose(mut self) {
        self.shared.send_command(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                crate::log_error!("Connection driver ended abnormally: {}", e);
            }
        }
    }

    /// Keep `channel` subscribed for as long as the lease lives.
    pub fn want(&self, channel: impl Into<ChannelName>) -> ChannelLease {
        ChannelLease::acquire(self.shared.clone(), channel.into())
    }

    pub fn register_message_handler<F>(
        &self,
        channel: impl Into<ChannelName>,
        handler: F,
    ) -> HandlerRegistration
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let id = self.shared.dispatcher.on_message(&channel, Arc::new(handler));
        self.registration(HandlerKind::Message, channel, id)
    }

    /// Typing handlers get every indicator as it arrives; expiring a stale
    /// "is typing" state is up to the handler.
    pub fn register_typing_handler<F>(
        &self,
        channel: impl Into<ChannelName>,
        handler: F,
    ) -> HandlerRegistration
    where
        F: Fn(&TypingEvent) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let id = self.shared.dispatcher.on_typing(&channel, Arc::new(handler));
        self.registration(HandlerKind::Typing, channel, id)
    }

    fn registration(&self, kind: HandlerKind, channel: ChannelName, id: HandlerId) -> HandlerRegistration {
        let lease = self.want(channel.clone());
        HandlerRegistration {
            shared: self.shared.clone(),
            kind,
            channel,
            id,
            lease,
            removed: AtomicBool::new(false),
        }
    }

    pub fn send_typing(&self, channel: impl Into<ChannelName>, is_typing: bool) -> bool {
        self.send_client_event(
            &channel.into(),
            CLIENT_TYPING_EVENT,
            json!({ "is_typing": is_typing }),
        )
    }

    pub fn mark_message_as_read(&self, channel: impl Into<ChannelName>, message_id: &str) -> bool {
        self.send_client_event(
            &channel.into(),
            CLIENT_MESSAGE_READ_EVENT,
            json!({ "message_id": message_id }),
        )
    }

    fn send_client_event(&self, channel: &ChannelName, event: &str, data: Value) -> bool {
        if !self.is_connected() {
            return false;
        }
        let subscribed = self.shared.registry.lock().is_subscribed(channel);
        if !subscribed {
            crate::log_debug!("Not sending {} on {}: not subscribed", event, channel);
            return false;
        }
        self.shared
            .send_frame(&Frame::client_event(channel, event, data))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    pub fn is_subscribed(&self, channel: impl Into<ChannelName>) -> bool {
        self.shared.registry.lock().is_subscribed(&channel.into())
    }
}

impl Drop for WsManager {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shared.send_command(Command::Shutdown);
        }
    }
}

/// One reference to a channel subscription.
#[must_use = "the channel is released when the lease is dropped"]
pub struct ChannelLease {
    shared: Arc<Shared>,
    channel: ChannelName,
    released: AtomicBool,
}

impl ChannelLease {
    fn acquire(shared: Arc<Shared>, channel: ChannelName) -> Self {
        let first = shared.registry.lock().want(&channel);
        if first {
            shared.send_command(Command::Subscribe(channel.clone()));
        }
        Self {
            shared,
            channel,
            released: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Drop this reference. Only the first call has an effect.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let outcome = self.shared.registry.lock().release(&self.channel);
        if let Release::Removed { status } = outcome {
            self.shared.send_command(Command::Unsubscribe {
                channel: self.channel.clone(),
                status,
            });
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// A registered handler. Dropping it unregisters.
#[must_use = "the handler is unregistered when this is dropped"]
pub struct HandlerRegistration {
    shared: Arc<Shared>,
    kind: HandlerKind,
    channel: ChannelName,
    id: HandlerId,
    lease: ChannelLease,
    removed: AtomicBool,
}

impl HandlerRegistration {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Remove the handler and release its channel. Only the first call has an
    /// effect.
    pub fn unregister(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.dispatcher.remove(self.kind, &self.channel, self.id);
        self.lease.release();
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}
