//! Deskline real-time client.
//!
//! Multiplexes one authenticated WebSocket across organization, inbox and
//! conversation channels for a support console, and fans inbound events out
//! to registered handlers.

pub mod api_client;
pub mod config;
pub mod logging;
pub mod ws;

pub use api_client::ApiClient;
pub use config::RealtimeConfig;
pub use ws::{ConnectionState, WsManager};
