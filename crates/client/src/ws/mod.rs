//! Real-time channel client for Pusher-protocol servers.
//!
//! This module provides:
//! - One WebSocket per session, multiplexed across logical channels
//! - Channel authorization for private and presence channels
//! - Auto-reconnect with backoff and full resubscription
//! - Deduplicated fan-out of inbound events to per-channel handlers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    WsManager                        │
//! │   (handlers, leases, typing/read signals, state)    │
//! └─────────────────────────────────────────────────────┘
//!            │ commands                  ▲ ConnectionState (watch)
//!            ▼                           │
//! ┌─────────────────────────────────────────────────────┐
//! │                     Driver task                     │
//! │  ReconnectPolicy · HeartbeatMonitor · replay set    │
//! └─────────────────────────────────────────────────────┘
//!      │              │                    │
//!      ▼              ▼                    ▼
//! ┌──────────┐ ┌──────────────┐ ┌────────────────────┐
//! │Transport │ │ Subscription │ │ ChannelAuthorizer  │
//! │ Socket   │ │  Registry    │ │ (spawned per try)  │
//! └──────────┘ └──────────────┘ └────────────────────┘
//!      │ frames
//!      ▼
//! ┌─────────────────────┐
//! │     Dispatcher      │──▶ message / typing handlers
//! └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let tokens = Arc::new(StaticToken(Some(token)));
//! let auth = HttpChannelAuthenticator::new(&config.auth_url, tokens, config.auth_timeout);
//! let manager = WsManager::init(config, Arc::new(TungsteniteConnector), Arc::new(auth))?;
//!
//! let _messages = manager.register_message_handler("conversation.42", |event| {
//!     println!("{}: {:?}", event.event, event.payload);
//! });
//! manager.send_typing("conversation.42", true);
//! ```

pub mod auth;
pub mod connection;
pub mod dispatcher;
mod driver;
pub mod heartbeat;
pub mod manager;
pub mod reconnect;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{ChannelAuthorizer, HttpChannelAuthenticator, StaticToken, TokenSource};
pub use connection::{ConnectionState, Connector, TransportSocket, TungsteniteConnector, WsHandle};
pub use dispatcher::{ChannelEvent, TypingEvent};
pub use manager::{ChannelLease, HandlerRegistration, WsManager};
