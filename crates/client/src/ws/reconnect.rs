//! Reconnection policy as an explicit state machine.
//!
//! ```text
//!  Idle ──connect ok──▶ Connected ──unexpected close──▶ Reconnecting ◀─┐
//!                          ▲                                │ wait     │ connect failed
//!                          └──────── connect ok ────────────┴──────────┘
//!  Reconnecting ──attempts exhausted / fatal close──▶ Failed ──retry()──▶ Idle
//!  any ──disconnect()──▶ Stopped ──resume()/retry()──▶ Idle
//! ```
//!
//! No timers live here: transitions return the delay and the driver sleeps.

use std::time::Duration;

use deskline_shared::MANUAL_CLOSE_CODE;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Idle,
    Connected,
    Reconnecting,
    Failed,
    /// Intentional disconnect; never reconnects on its own.
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Retry { attempt: u32, delay: Duration },
    GiveUp { reason: String },
    /// Nothing to schedule (manual disconnect in effect).
    Stay,
}

/// How a close code is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    Manual,
    /// Server says do not come back (Pusher 4000-4099).
    Fatal,
    /// Server asks for an immediate reconnect (Pusher 4200-4299).
    Immediate,
    Backoff,
}

impl CloseDisposition {
    pub fn classify(code: u16, initiated_locally: bool) -> Self {
        if initiated_locally && code == MANUAL_CLOSE_CODE {
            return CloseDisposition::Manual;
        }
        match code {
            4000..=4099 => CloseDisposition::Fatal,
            4200..=4299 => CloseDisposition::Immediate,
            _ => CloseDisposition::Backoff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    state: PolicyState,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            state: PolicyState::Idle,
        }
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn on_connected(&mut self) {
        self.attempt = 0;
        self.state = PolicyState::Connected;
    }

    pub fn on_connection_lost(&mut self, code: u16, initiated_locally: bool) -> Transition {
        match CloseDisposition::classify(code, initiated_locally) {
            CloseDisposition::Manual => {
                self.on_manual_disconnect();
                Transition::Stay
            }
            CloseDisposition::Fatal => {
                self.state = PolicyState::Failed;
                Transition::GiveUp {
                    reason: format!("Server closed the connection with code {code}"),
                }
            }
            CloseDisposition::Immediate => self.schedule(true),
            CloseDisposition::Backoff => self.schedule(false),
        }
    }

    pub fn on_connect_failed(&mut self) -> Transition {
        self.schedule(false)
    }

    pub fn on_manual_disconnect(&mut self) {
        self.attempt = 0;
        self.state = PolicyState::Stopped;
    }

    /// Leave `Stopped` for a fresh connect. Ignored while `Failed`.
    pub fn resume(&mut self) -> bool {
        match self.state {
            PolicyState::Failed => false,
            PolicyState::Stopped => {
                self.state = PolicyState::Idle;
                true
            }
            _ => true,
        }
    }

    /// Explicit user retry: the only way out of `Failed`.
    pub fn retry(&mut self) {
        self.attempt = 0;
        self.state = PolicyState::Idle;
    }

    fn schedule(&mut self, immediate: bool) -> Transition {
        if self.state == PolicyState::Stopped {
            return Transition::Stay;
        }

        self.attempt += 1;
        if self.config.max_attempts > 0 && self.attempt > self.config.max_attempts {
            self.state = PolicyState::Failed;
            return Transition::GiveUp {
                reason: format!(
                    "Max reconnect attempts ({}) exceeded",
                    self.config.max_attempts
                ),
            };
        }

        self.state = PolicyState::Reconnecting;
        let delay = if immediate {
            Duration::ZERO
        } else {
            self.config.delay_for_attempt(self.attempt - 1)
        };
        Transition::Retry {
            attempt: self.attempt,
            delay,
        }
    }
}
