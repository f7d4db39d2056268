//! Detects silently dead sockets.
//!
//! Any inbound frame counts as activity. Once the socket has been quiet for a
//! full ping interval we ping; once it has been quiet for `dead_after` the
//! connection is declared dead and the driver closes it.
//!
//! The driver checks once per interval, so a dead socket is closed somewhere
//! between `dead_after` and `dead_after + interval` after its last frame.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::HeartbeatConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    Ping,
    Dead,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    interval: Duration,
    last_activity: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        let interval = configured_interval(&config);
        Self {
            config,
            interval,
            last_activity: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.interval = configured_interval(&self.config);
        self.last_activity = Some(now);
    }

    pub fn stop(&mut self) {
        self.last_activity = None;
    }

    pub fn is_running(&self) -> bool {
        self.last_activity.is_some()
    }

    pub fn record_activity(&mut self, now: Instant) {
        if self.is_running() {
            self.last_activity = Some(now);
        }
    }

    /// Shorten the ping interval to the server's activity timeout.
    pub fn adopt_activity_timeout(&mut self, secs: u64) {
        if secs > 0 {
            self.interval = self.interval.min(Duration::from_secs(secs));
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn dead_after(&self) -> Duration {
        self.interval * self.config.timeout_multiplier.max(1)
    }

    /// Time since the last inbound frame, zero while stopped.
    pub fn quiet_for(&self, now: Instant) -> Duration {
        self.last_activity
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last))
    }

    pub fn check(&self, now: Instant) -> HeartbeatAction {
        let Some(last) = self.last_activity else {
            return HeartbeatAction::Idle;
        };
        let quiet = now.saturating_duration_since(last);
        if quiet >= self.dead_after() {
            HeartbeatAction::Dead
        } else if quiet >= self.interval {
            HeartbeatAction::Ping
        } else {
            HeartbeatAction::Idle
        }
    }
}

/// A zero period would stall the tick timer; treat it as unset.
fn configured_interval(config: &HeartbeatConfig) -> Duration {
    if config.ping_interval.is_zero() {
        HeartbeatConfig::default().ping_interval
    } else {
        config.ping_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatConfig {
            ping_interval: Duration::from_secs(30),
            timeout_multiplier: 2,
        })
    }

    #[test]
    fn pings_when_quiet_then_declares_dead() {
        let start = Instant::now();
        let mut hb = monitor();
        assert_eq!(hb.check(start), HeartbeatAction::Idle);

        hb.start(start);
        assert_eq!(hb.check(start + Duration::from_secs(10)), HeartbeatAction::Idle);
        assert_eq!(hb.check(start + Duration::from_secs(30)), HeartbeatAction::Ping);
        assert_eq!(hb.check(start + Duration::from_secs(60)), HeartbeatAction::Dead);

        hb.record_activity(start + Duration::from_secs(50));
        assert_eq!(hb.check(start + Duration::from_secs(60)), HeartbeatAction::Idle);

        hb.stop();
        assert_eq!(hb.check(start + Duration::from_secs(500)), HeartbeatAction::Idle);
    }

    #[test]
    fn server_activity_timeout_shortens_interval() {
        let mut hb = monitor();
        hb.start(Instant::now());
        hb.adopt_activity_timeout(120);
        assert_eq!(hb.interval(), Duration::from_secs(30));
        hb.adopt_activity_timeout(10);
        assert_eq!(hb.interval(), Duration::from_secs(10));
        assert_eq!(hb.dead_after(), Duration::from_secs(20));

        // A new connection starts from the configured interval again.
        hb.start(Instant::now());
        assert_eq!(hb.interval(), Duration::from_secs(30));
    }

    #[test]
    fn zero_interval_uses_default() {
        let mut hb = HeartbeatMonitor::new(HeartbeatConfig {
            ping_interval: Duration::ZERO,
            timeout_multiplier: 2,
        });
        let default = HeartbeatConfig::default().ping_interval;
        assert_eq!(hb.interval(), default);

        let start = Instant::now();
        hb.start(start);
        assert_eq!(hb.interval(), default);
        assert_eq!(hb.check(start), HeartbeatAction::Idle);
        assert_eq!(hb.quiet_for(start + Duration::from_secs(5)), Duration::from_secs(5));
    }
}
