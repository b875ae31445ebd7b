use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, warn};

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Subscribed,
    Errored,
    TimedOut,
    Reconnecting {
        attempt: u32,
    },
    Failed {
        attempts: u32,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Subscribed)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(
            self,
            Self::Errored | Self::TimedOut | Self::Reconnecting { .. }
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFailure {
    Error(String),
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    Nothing,
    Resync,
    ScheduleReconnect { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
        }
    }

    /// `min(base * 2^attempt, cap)` without the random component.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..jitter_ms)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }
}

pub struct ReconnectSupervisor {
    state: ConnectionState,
    consecutive_failures: u32,
    max_attempts: u32,
    // True only until the first subscribe or the first failure.
    initial_connect: bool,
    resync_pending: bool,
    policy: BackoffPolicy,
    rng: StdRng,
}

impl ReconnectSupervisor {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: &SyncConfig, rng: StdRng) -> Self {
        Self {
            state: ConnectionState::Idle,
            consecutive_failures: 0,
            max_attempts: config.max_reconnect_attempts.max(1),
            initial_connect: true,
            resync_pending: false,
            policy: BackoffPolicy::from_config(config),
            rng,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    pub fn start(&mut self) {
        if self.state == ConnectionState::Idle {
            self.state = ConnectionState::Connecting;
        }
    }

    pub fn restart(&mut self) -> bool {
        if !self.state.is_failed() {
            return false;
        }
        info!("sync: manual reconnect requested after terminal failure");
        self.consecutive_failures = 0;
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn on_subscribed(&mut self) -> SupervisorAction {
        match self.state {
            ConnectionState::Subscribed | ConnectionState::Failed { .. } | ConnectionState::Idle => {
                SupervisorAction::Nothing
            }
            ConnectionState::Connecting if self.initial_connect => {
                self.initial_connect = false;
                self.state = ConnectionState::Subscribed;
                SupervisorAction::Nothing
            }
            _ => {
                self.state = ConnectionState::Subscribed;
                self.resync_pending = true;
                info!(
                    failures = self.consecutive_failures,
                    "sync: channel resubscribed; resynchronizing"
                );
                SupervisorAction::Resync
            }
        }
    }

    pub fn on_failure(&mut self, failure: ChannelFailure) -> SupervisorAction {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Failed { .. }
        ) {
            return SupervisorAction::Nothing;
        }

        self.initial_connect = false;
        self.state = match &failure {
            ChannelFailure::TimedOut => ConnectionState::TimedOut,
            ChannelFailure::Error(_) | ChannelFailure::Closed => ConnectionState::Errored,
        };
        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.max_attempts {
            warn!(
                attempts = self.consecutive_failures,
                ?failure,
                "sync: reconnect attempts exhausted"
            );
            self.state = ConnectionState::Failed {
                attempts: self.consecutive_failures,
            };
            self.resync_pending = false;
            return SupervisorAction::GiveUp {
                attempts: self.consecutive_failures,
            };
        }

        let attempt = self.consecutive_failures;
        let delay = self.policy.delay(attempt - 1, &mut self.rng);
        warn!(
            attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            ?failure,
            "sync: channel failure; scheduling reconnect"
        );
        self.state = ConnectionState::Reconnecting { attempt };
        SupervisorAction::ScheduleReconnect { attempt, delay }
    }

    pub fn on_resync_succeeded(&mut self) {
        self.resync_pending = false;
        self.consecutive_failures = 0;
    }

    pub fn on_resync_failed(&mut self, reason: impl Into<String>) -> SupervisorAction {
        self.resync_pending = false;
        self.on_failure(ChannelFailure::Error(reason.into()))
    }

    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Idle;
        self.resync_pending = false;
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
