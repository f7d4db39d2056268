//! deskline-tail - follow real-time channels from the terminal.
//!
//! Usage: `deskline-tail <channel>...`, e.g.
//! `deskline-tail organization.1 conversation.42`.
//! Configuration comes from `DESKLINE_*` environment variables; the bearer
//! token for private channels from `DESKLINE_TOKEN`.

use std::sync::Arc;

use anyhow::{bail, Context};
use deskline_client::logging::init_tracing;
use deskline_client::ws::{
    ChannelEvent, HttpChannelAuthenticator, StaticToken, TungsteniteConnector, TypingEvent,
};
use deskline_client::{log_info, log_warn, RealtimeConfig, WsManager};
use deskline_shared::ChannelName;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("deskline_client=info");

    let channels: Vec<ChannelName> = std::env::args().skip(1).map(ChannelName::from).collect();
    if channels.is_empty() {
        bail!("usage: deskline-tail <channel>...");
    }

    let config = RealtimeConfig::from_env();
    let tokens = Arc::new(StaticToken(std::env::var("DESKLINE_TOKEN").ok()));
    let authenticator =
        HttpChannelAuthenticator::new(config.auth_url.clone(), tokens, config.auth_timeout);

    let manager = WsManager::init(
        config,
        Arc::new(TungsteniteConnector),
        Arc::new(authenticator),
    )
    .context("invalid DESKLINE_WS_URL")?;

    let mut registrations = Vec::new();
    for channel in &channels {
        registrations.push(manager.register_message_handler(
            channel.clone(),
            |event: &ChannelEvent| {
                log_info!(
                    "[{}] {} {:?} {}",
                    event.channel,
                    event.event,
                    event.payload,
                    event.data
                );
            },
        ));
        registrations.push(manager.register_typing_handler(
            channel.clone(),
            |event: &TypingEvent| {
                log_info!(
                    "[{}] {} typing={}",
                    event.channel,
                    event.indicator.user_name.as_deref().unwrap_or("someone"),
                    event.indicator.is_typing
                );
            },
        ));
    }

    let mut states = manager.state_changes();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            if state.is_failed() {
                log_warn!("Connection failed: {:?}", state);
            } else {
                log_info!("Connection: {:?}", state);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    log_info!("Shutting down");

    drop(registrations);
    manager.dispose().await;
    watcher.abort();
    Ok(())
}
