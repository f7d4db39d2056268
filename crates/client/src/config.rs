//! Real-time client configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use url::Url;

/// Pusher protocol revision announced in the socket URL.
const PROTOCOL_VERSION: &str = "7";
const CLIENT_NAME: &str = "deskline-rs";

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive reconnect attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff (values below 1.0 are treated as 1.0)
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// `min(initial * multiplier^attempt, max)`, non-decreasing in `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.max(1.0);
        let delay = self.initial_delay_ms as f64 * multiplier.powi(attempt.min(64) as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    /// The connection is declared dead after `ping_interval * timeout_multiplier`
    /// without any inbound traffic.
    pub timeout_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            timeout_multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    /// WebSocket endpoint, e.g. `wss://ws.example.com`.
    pub ws_url: String,
    /// When set, the socket URL becomes `{ws_url}/app/{key}?protocol=7&...`.
    pub app_key: Option<String>,
    /// Broadcasting auth endpoint for private/presence channels.
    pub auth_url: String,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
    /// Number of recent message ids remembered for deduplication.
    pub dedup_window: usize,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080".to_string(),
            app_key: None,
            auth_url: "http://localhost:8000/broadcasting/auth".to_string(),
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            dedup_window: 256,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl RealtimeConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DESKLINE_WS_URL`: WebSocket endpoint (default: "ws://localhost:8080")
    /// - `DESKLINE_APP_KEY`: Pusher application key (optional)
    /// - `DESKLINE_AUTH_URL`: channel auth endpoint (default: "http://localhost:8000/broadcasting/auth")
    /// - `DESKLINE_PING_INTERVAL_SECS` (30), `DESKLINE_PONG_TIMEOUT_MULTIPLIER` (2)
    /// - `DESKLINE_RECONNECT_MAX_ATTEMPTS` (10), `DESKLINE_RECONNECT_BASE_MS` (1000),
    ///   `DESKLINE_RECONNECT_CAP_MS` (30000)
    /// - `DESKLINE_AUTH_TIMEOUT_SECS` (10), `DESKLINE_CONNECT_TIMEOUT_SECS` (10)
    /// - `DESKLINE_DEDUP_WINDOW` (256)
    ///
    /// Zero intervals and timeouts are rejected like unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            ws_url: std::env::var("DESKLINE_WS_URL").unwrap_or(defaults.ws_url),
            app_key: std::env::var("DESKLINE_APP_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            auth_url: std::env::var("DESKLINE_AUTH_URL").unwrap_or(defaults.auth_url),
            auth_timeout: Duration::from_secs(positive_env_or(
                "DESKLINE_AUTH_TIMEOUT_SECS",
                defaults.auth_timeout.as_secs(),
            )),
            connect_timeout: Duration::from_secs(positive_env_or(
                "DESKLINE_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
            dedup_window: env_or("DESKLINE_DEDUP_WINDOW", defaults.dedup_window),
            reconnect: ReconnectConfig {
                max_attempts: env_or(
                    "DESKLINE_RECONNECT_MAX_ATTEMPTS",
                    defaults.reconnect.max_attempts,
                ),
                initial_delay_ms: env_or(
                    "DESKLINE_RECONNECT_BASE_MS",
                    defaults.reconnect.initial_delay_ms,
                ),
                max_delay_ms: env_or("DESKLINE_RECONNECT_CAP_MS", defaults.reconnect.max_delay_ms),
                backoff_multiplier: defaults.reconnect.backoff_multiplier,
            },
            heartbeat: HeartbeatConfig {
                ping_interval: Duration::from_secs(positive_env_or(
                    "DESKLINE_PING_INTERVAL_SECS",
                    defaults.heartbeat.ping_interval.as_secs(),
                )),
                timeout_multiplier: env_or(
                    "DESKLINE_PONG_TIMEOUT_MULTIPLIER",
                    defaults.heartbeat.timeout_multiplier,
                ),
            },
        }
    }

    /// The URL actually dialed, including the Pusher app path when configured.
    pub fn socket_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.ws_url)?;
        let Some(key) = &self.app_key else {
            return Ok(url);
        };

        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("app").push(key);
        }
        url.query_pairs_mut()
            .append_pair("protocol", PROTOCOL_VERSION)
            .append_pair("client", CLIENT_NAME)
            .append_pair("version", env!("CARGO_PKG_VERSION"));
        Ok(url)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            crate::log_warn!("Ignoring invalid {}={:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

/// `env_or` for durations in seconds, where zero is never meaningful.
fn positive_env_or(key: &str, default: u64) -> u64 {
    let secs = env_or(key, default);
    if secs == 0 {
        crate::log_warn!("Ignoring {}=0, using default {}", key, default);
        return default;
    }
    secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let config = ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 3000,
            backoff_multiplier: 2.0,
        };
        let delays: Vec<u64> = (0..6)
            .map(|n| config.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
    }

    #[test]
    fn backoff_is_non_decreasing_even_with_bad_multiplier() {
        let config = ReconnectConfig {
            backoff_multiplier: 0.5,
            ..ReconnectConfig::default()
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(config.max_delay_ms));
            previous = delay;
        }
    }

    #[test]
    fn socket_url_adds_app_path() {
        let config = RealtimeConfig {
            ws_url: "wss://ws.example.com".into(),
            app_key: Some("abc123".into()),
            ..RealtimeConfig::default()
        };
        let url = config.socket_url().unwrap();
        assert_eq!(url.path(), "/app/abc123");
        assert!(url.query().unwrap().starts_with("protocol=7&client=deskline-rs"));
    }

    #[test]
    fn socket_url_without_key_is_verbatim() {
        let config = RealtimeConfig::default();
        assert_eq!(config.socket_url().unwrap().as_str(), "ws://localhost:8080/");
    }

    #[test]
    fn zero_seconds_falls_back_to_default() {
        // Only this test touches these variables.
        std::env::set_var("DESKLINE_TEST_ZERO_SECS", "0");
        std::env::set_var("DESKLINE_TEST_SOME_SECS", " 15 ");
        assert_eq!(positive_env_or("DESKLINE_TEST_ZERO_SECS", 30), 30);
        assert_eq!(positive_env_or("DESKLINE_TEST_SOME_SECS", 30), 15);
        assert_eq!(positive_env_or("DESKLINE_TEST_UNSET_SECS", 30), 30);
        std::env::remove_var("DESKLINE_TEST_ZERO_SECS");
        std::env::remove_var("DESKLINE_TEST_SOME_SECS");
    }
}
