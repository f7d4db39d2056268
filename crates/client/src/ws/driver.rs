//! The connection driver.
//!
//! One task owns the transport socket, the reconnection policy and the
//! heartbeat. It multiplexes facade commands, inbound frames, finished
//! authorizations, the backoff deadline and the heartbeat tick. Authorization
//! round trips run as separate tasks and report back over a channel, so the
//! driver itself never waits on HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deskline_shared::{
    AuthGrant, ChannelName, ControlEvent, Frame, ABNORMAL_CLOSE_CODE, MANUAL_CLOSE_CODE,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::auth::ChannelAuthorizer;
use super::connection::{ConnectionState, Connector, TransportEvent, TransportSocket, WsHandle};
use super::dispatcher::{Dispatch, Dispatcher};
use super::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use super::reconnect::{ReconnectPolicy, Transition};
use super::registry::{SubscriptionRegistry, SubscriptionStatus};
use crate::config::RealtimeConfig;

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    /// A channel went from unwanted to wanted.
    Subscribe(ChannelName),
    /// The last reference was released while the channel was in `status`.
    Unsubscribe {
        channel: ChannelName,
        status: SubscriptionStatus,
    },
    Disconnect,
    Retry,
    Shutdown,
}

/// State reachable from both the facade and the driver.
pub(crate) struct Shared {
    pub(crate) registry: Mutex<SubscriptionRegistry>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) state: watch::Sender<ConnectionState>,
    /// Present only while a socket is established.
    pub(crate) outbound: Mutex<Option<WsHandle>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Shared {
    pub(crate) fn new(dedup_window: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Self {
            registry: Mutex::new(SubscriptionRegistry::new()),
            dispatcher: Dispatcher::new(dedup_window),
            state,
            outbound: Mutex::new(None),
            commands,
        });
        (shared, rx)
    }

    /// Returns `false` once the driver has stopped.
    pub(crate) fn send_command(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub(crate) fn send_frame(&self, frame: &Frame) -> bool {
        let handle = self.outbound.lock().clone();
        handle.is_some_and(|handle| handle.send(frame))
    }
}

struct AuthOutcome {
    channel: ChannelName,
    attempt: u64,
    grant: Option<AuthGrant>,
}

pub(crate) struct Driver {
    url: String,
    connect_timeout: Duration,
    connector: Arc<dyn Connector>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    auth_tx: mpsc::UnboundedSender<AuthOutcome>,
    auth_rx: mpsc::UnboundedReceiver<AuthOutcome>,
    in_flight: HashMap<u64, AbortHandle>,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatMonitor,
    socket: Option<TransportSocket>,
    socket_id: Option<String>,
    /// Channels still to be settled before `Connected` is reported.
    replay: HashMap<String, ChannelName>,
    replaying: bool,
    /// Channels unsettled by then are marked failed.
    replay_deadline: Option<Instant>,
    replay_timeout: Duration,
    reconnect_at: Option<Instant>,
    ping_timer: Option<Interval>,
}

impl Driver {
    pub(crate) fn new(
        config: &RealtimeConfig,
        url: String,
        connector: Arc<dyn Connector>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        Self {
            url,
            connect_timeout: config.connect_timeout,
            connector,
            authorizer,
            shared,
            commands,
            auth_tx,
            auth_rx,
            in_flight: HashMap::new(),
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
            socket: None,
            socket_id: None,
            replay: HashMap::new(),
            replaying: false,
            replay_deadline: None,
            // One auth round trip plus the subscribe ack.
            replay_timeout: config.auth_timeout * 2,
            reconnect_at: None,
            ping_timer: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.disconnect();
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                event = next_transport_event(&mut self.socket) => self.handle_transport(event),
                Some(outcome) = self.auth_rx.recv() => self.handle_auth(outcome),
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
                _ = sleep_until_opt(self.replay_deadline) => self.on_replay_timeout(),
                _ = tick_opt(&mut self.ping_timer) => self.on_heartbeat_tick(),
            }
        }
        crate::log_debug!("Connection driver stopped");
    }

    /// Returns `false` when the driver should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect => {
                if self.socket.is_some() || self.reconnect_at.is_some() {
                    return true;
                }
                if !self.policy.resume() {
                    crate::log_warn!("Connection has failed; call retry() to reconnect");
                    return true;
                }
                self.connect().await;
            }
            Command::Retry => {
                if self.socket.is_some() {
                    return true;
                }
                self.policy.retry();
                self.reconnect_at = None;
                self.connect().await;
            }
            Command::Subscribe(channel) => {
                self.start_attempt(&channel);
            }
            Command::Unsubscribe { channel, status } => {
                if let SubscriptionStatus::Authorizing { attempt } = status {
                    if let Some(task) = self.in_flight.remove(&attempt) {
                        crate::log_debug!("Cancelling authorization for {}", channel);
                        task.abort();
                    }
                }
                if status.reached_server() {
                    self.send(&Frame::unsubscribe(&channel));
                }
                self.settle(&channel);
            }
            Command::Disconnect => self.disconnect(),
            Command::Shutdown => {
                self.disconnect();
                return false;
            }
        }
        true
    }

    async fn connect(&mut self) {
        if self.socket.is_some() {
            return;
        }

        let attempt = self.policy.attempt();
        if attempt == 0 {
            self.set_state(ConnectionState::Connecting);
        } else {
            self.set_state(ConnectionState::Reconnecting { attempt });
        }
        crate::log_info!("Connecting to {} (attempt {})", self.url, attempt + 1);

        let result =
            match tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.url))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "Connecting to {} timed out after {:?}",
                    self.url, self.connect_timeout
                )),
            };

        match result {
            Ok(socket) => {
                let now = Instant::now();
                self.heartbeat.start(now);
                self.restart_ping_timer(now);
                self.socket = Some(socket);
            }
            Err(e) => {
                crate::log_warn!("{}", e);
                let transition = self.policy.on_connect_failed();
                self.apply(transition);
            }
        }
    }

    fn disconnect(&mut self) {
        self.policy.on_manual_disconnect();
        self.reconnect_at = None;
        if let Some(socket) = self.socket.as_mut() {
            socket.close(MANUAL_CLOSE_CODE, "client disconnect");
        }
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Retry { attempt, delay } => {
                crate::log_info!("Reconnecting in {:?} (attempt {})", delay, attempt);
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting { attempt });
            }
            Transition::GiveUp { reason } => {
                crate::log_error!("Giving up on {}: {}", self.url, reason);
                self.reconnect_at = None;
                self.set_state(ConnectionState::Failed { reason });
            }
            Transition::Stay => self.set_state(ConnectionState::Disconnected),
        }
    }

    /// Forget everything tied to the current socket.
    fn teardown(&mut self) {
        self.socket = None;
        self.socket_id = None;
        *self.shared.outbound.lock() = None;
        self.heartbeat.stop();
        self.ping_timer = None;
        self.replay.clear();
        self.replaying = false;
        self.replay_deadline = None;
        for (_, task) in self.in_flight.drain() {
            task.abort();
        }
        self.shared.registry.lock().reset();
    }

    fn on_socket_lost(&mut self, code: u16) {
        crate::log_warn!("Connection to {} lost (code {})", self.url, code);
        self.teardown();
        let transition = self.policy.on_connection_lost(code, false);
        self.apply(transition);
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => {
                self.heartbeat.record_activity(Instant::now());
                if let Dispatch::Control(control) = self.shared.dispatcher.dispatch(&frame) {
                    self.handle_control(control);
                }
            }
            TransportEvent::Error(e) => crate::log_warn!("Socket error: {}", e),
            TransportEvent::Closed { code } => self.on_socket_lost(code),
        }
    }

    fn handle_control(&mut self, control: ControlEvent) {
        match control {
            ControlEvent::ConnectionEstablished {
                socket_id,
                activity_timeout,
            } => self.on_established(socket_id, activity_timeout),
            ControlEvent::SubscriptionSucceeded { channel } => {
                let wanted = self.shared.registry.lock().mark_subscribed(&channel);
                if wanted {
                    crate::log_info!("Subscribed to {}", channel);
                } else {
                    crate::log_debug!("Ignoring ack for unwanted channel {}", channel);
                }
                self.settle(&channel);
            }
            ControlEvent::SubscriptionError {
                channel,
                status,
                message,
            } => {
                crate::log_warn!(
                    "Subscription to {} rejected (status {:?}): {}",
                    channel.as_ref().map_or("<unknown>", ChannelName::logical),
                    status,
                    message.as_deref().unwrap_or("no reason given")
                );
                match channel.or_else(|| self.sole_pending_channel()) {
                    Some(channel) => {
                        let _ = self.shared.registry.lock().mark_failed(&channel);
                        self.settle(&channel);
                    }
                    None => crate::log_debug!(
                        "Subscription error names no channel; leaving it to the replay deadline"
                    ),
                }
            }
            ControlEvent::Ping => {
                self.send(&Frame::pong());
            }
            ControlEvent::Pong => {}
            ControlEvent::Error { code, message } => {
                crate::log_warn!(
                    "Server error {:?}: {}",
                    code,
                    message.as_deref().unwrap_or("no message")
                );
            }
            ControlEvent::Other { event } => crate::log_debug!("Ignoring {}", event),
        }
    }

    fn on_established(&mut self, socket_id: String, activity_timeout: Option<u64>) {
        let Some(handle) = self.socket.as_ref().map(TransportSocket::handle) else {
            return;
        };
        crate::log_info!("Connection established (socket id {})", socket_id);

        if let Some(secs) = activity_timeout {
            let before = self.heartbeat.interval();
            self.heartbeat.adopt_activity_timeout(secs);
            if self.heartbeat.interval() != before {
                self.restart_ping_timer(Instant::now());
            }
        }

        *self.shared.outbound.lock() = Some(handle);
        self.socket_id = Some(socket_id);
        self.set_state(ConnectionState::Authenticating);
        self.reconcile();
    }

    /// Issue one subscribe attempt for every wanted channel. `Connected` is
    /// reported only once each of them has been acked or has failed.
    fn reconcile(&mut self) {
        let desired = self.shared.registry.lock().desired();
        crate::log_info!("Subscribing to {} channel(s)", desired.len());

        self.replaying = true;
        self.replay_deadline = Some(Instant::now() + self.replay_timeout);
        self.replay = desired
            .iter()
            .map(|channel| (channel.logical().to_string(), channel.clone()))
            .collect();
        for channel in &desired {
            if !self.start_attempt(channel) {
                self.settle(channel);
            }
        }
        self.finish_replay();
    }

    /// Start authenticate-then-subscribe for one channel. Returns `false`
    /// when nothing was started.
    fn start_attempt(&mut self, channel: &ChannelName) -> bool {
        let Some(socket_id) = self.socket_id.clone() else {
            return false;
        };
        let attempt = self.shared.registry.lock().begin_attempt(channel);
        let Some(attempt) = attempt else {
            return false;
        };

        if !channel.requires_auth() {
            let _ = self
                .shared
                .registry
                .lock()
                .complete_attempt(channel, attempt, true);
            self.send(&Frame::subscribe(channel, None));
            return true;
        }

        crate::log_debug!("Authorizing {} (attempt {})", channel, attempt);
        let authorizer = self.authorizer.clone();
        let tx = self.auth_tx.clone();
        let channel = channel.clone();
        let task = tokio::spawn(async move {
            let grant = authorizer.authorize(&channel, &socket_id).await;
            let _ = tx.send(AuthOutcome {
                channel,
                attempt,
                grant,
            });
        });
        self.in_flight.insert(attempt, task.abort_handle());
        true
    }

    fn handle_auth(&mut self, outcome: AuthOutcome) {
        let AuthOutcome {
            channel,
            attempt,
            grant,
        } = outcome;
        self.in_flight.remove(&attempt);

        let current =
            self.shared
                .registry
                .lock()
                .complete_attempt(&channel, attempt, grant.is_some());
        if !current {
            crate::log_debug!("Discarding stale authorization for {}", channel);
            return;
        }

        match grant {
            Some(grant) => {
                self.send(&Frame::subscribe(&channel, Some(&grant)));
            }
            None => {
                crate::log_warn!("Not subscribing to {}: authorization failed", channel);
                self.settle(&channel);
            }
        }
    }

    /// The only channel with a subscribe awaiting its ack, if exactly one.
    fn sole_pending_channel(&self) -> Option<ChannelName> {
        let registry = self.shared.registry.lock();
        let mut pending = registry
            .desired()
            .into_iter()
            .filter(|channel| registry.status(channel) == Some(SubscriptionStatus::Pending));
        match (pending.next(), pending.next()) {
            (Some(channel), None) => Some(channel),
            _ => None,
        }
    }

    fn settle(&mut self, channel: &ChannelName) {
        if self.replay.remove(channel.logical()).is_some() {
            self.finish_replay();
        }
    }

    /// Give up on channels that neither acked nor failed in time.
    fn on_replay_timeout(&mut self) {
        self.replay_deadline = None;
        let stuck: Vec<ChannelName> = self.replay.drain().map(|(_, channel)| channel).collect();
        for channel in &stuck {
            crate::log_warn!("Subscription to {} timed out", channel);
            let mut registry = self.shared.registry.lock();
            if let Some(SubscriptionStatus::Authorizing { attempt }) = registry.status(channel) {
                if let Some(task) = self.in_flight.remove(&attempt) {
                    task.abort();
                }
            }
            let _ = registry.mark_failed(channel);
        }
        self.finish_replay();
    }

    fn finish_replay(&mut self) {
        if !self.replaying || !self.replay.is_empty() {
            return;
        }
        self.replaying = false;
        self.replay_deadline = None;
        self.policy.on_connected();
        self.set_state(ConnectionState::Connected);
    }

    fn on_heartbeat_tick(&mut self) {
        match self.heartbeat.check(Instant::now()) {
            HeartbeatAction::Idle => {}
            HeartbeatAction::Ping => {
                crate::log_debug!("Connection quiet; sending ping");
                self.send(&Frame::ping());
            }
            HeartbeatAction::Dead => {
                crate::log_warn!(
                    "No traffic for {:?} (limit {:?}); closing silent connection",
                    self.heartbeat.quiet_for(Instant::now()),
                    self.heartbeat.dead_after()
                );
                if let Some(socket) = self.socket.as_mut() {
                    socket.close(MANUAL_CLOSE_CODE, "activity timeout");
                }
                self.on_socket_lost(ABNORMAL_CLOSE_CODE);
            }
        }
    }

    fn restart_ping_timer(&mut self, now: Instant) {
        let period = self.heartbeat.interval();
        let mut timer = interval_at(now + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ping_timer = Some(timer);
    }

    fn send(&self, frame: &Frame) -> bool {
        self.socket.as_ref().is_some_and(|socket| socket.send(frame))
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            crate::log_info!("Connection state {:?} -> {:?}", current, state);
            *current = state.clone();
            true
        });
    }
}

async fn next_transport_event(socket: &mut Option<TransportSocket>) -> TransportEvent {
    match socket {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
