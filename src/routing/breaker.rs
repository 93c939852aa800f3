//! Circuit breaker state machine.
//!
//! A breaker is a plain value moved between states only by [`BreakerState::admit`]
//! and [`BreakerState::on_outcome`]. Both take the clock as an argument, so
//! every transition can be tested without sleeping.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch outcome reported against a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `window` that open the breaker.
    pub failure_threshold: u32,
    pub window: Duration,
    pub recovery_timeout: Duration,
    /// Upper bound for the doubled recovery timeout.
    pub max_recovery_timeout: Duration,
    /// Requests let through while half-open.
    pub probe_budget: u32,
    /// Probe successes needed to close.
    pub successes_to_close: u32,
    /// Quiet closed period after which the breaker is dropped.
    pub retention: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            max_recovery_timeout: Duration::from_secs(300),
            probe_budget: 3,
            successes_to_close: 2,
            retention: Duration::from_secs(600),
        }
    }
}

/// Whether a request may go to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed as a half-open probe.
    Probe,
    Rejected,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerState {
    pub state: CircuitState,
    /// Failures inside the sliding window.
    pub failure_count: u32,
    recent_failures: VecDeque<Instant>,
    pub opened_at: Option<Instant>,
    pub half_opened_at: Option<Instant>,
    /// Current recovery timeout; doubles on every failed probe.
    pub recovery_timeout: Duration,
    pub probes_remaining: u32,
    pub successes_needed: u32,
    /// Last recorded outcome, or creation.
    pub last_activity: Instant,
}

impl BreakerState {
    pub fn new(now: Instant, config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            recent_failures: VecDeque::new(),
            opened_at: None,
            half_opened_at: None,
            recovery_timeout: config.recovery_timeout,
            probes_remaining: 0,
            successes_needed: 0,
            last_activity: now,
        }
    }

    pub fn admit(mut self, now: Instant, config: &BreakerConfig) -> (Self, Admission) {
        match self.state {
            CircuitState::Closed => (self, Admission::Allowed),
            CircuitState::Open => {
                let opened = self.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened) < self.recovery_timeout {
                    return (self, Admission::Rejected);
                }
                self.state = CircuitState::HalfOpen;
                self.half_opened_at = Some(now);
                self.probes_remaining = config.probe_budget.max(1);
                self.successes_needed = config.successes_to_close.max(1);
                self.take_probe()
            }
            CircuitState::HalfOpen => {
                // Probes whose outcome never came back must not wedge the breaker.
                let since = self.half_opened_at.unwrap_or(now);
                if self.probes_remaining == 0
                    && now.saturating_duration_since(since) >= self.recovery_timeout
                {
                    self.half_opened_at = Some(now);
                    self.probes_remaining = config.probe_budget.max(1);
                }
                self.take_probe()
            }
        }
    }

    fn take_probe(mut self) -> (Self, Admission) {
        if self.probes_remaining == 0 {
            return (self, Admission::Rejected);
        }
        self.probes_remaining -= 1;
        (self, Admission::Probe)
    }

    pub fn on_outcome(mut self, outcome: Outcome, now: Instant, config: &BreakerConfig) -> Self {
        self.last_activity = self.last_activity.max(now);
        match (self.state, outcome.is_success()) {
            (CircuitState::Closed, true) => {
                self.recent_failures.clear();
                self.failure_count = 0;
                self
            }
            (CircuitState::Closed, false) => {
                self.recent_failures.push_back(now);
                while let Some(&oldest) = self.recent_failures.front() {
                    if now.saturating_duration_since(oldest) > config.window {
                        self.recent_failures.pop_front();
                    } else {
                        break;
                    }
                }
                self.failure_count = u32::try_from(self.recent_failures.len()).unwrap_or(u32::MAX);
                if self.failure_count >= config.failure_threshold {
                    self.open(now);
                }
                self
            }
            (CircuitState::HalfOpen, true) => {
                self.successes_needed = self.successes_needed.saturating_sub(1);
                if self.successes_needed == 0 {
                    self.close(now, config);
                }
                self
            }
            (CircuitState::HalfOpen, false) => {
                self.recovery_timeout = self
                    .recovery_timeout
                    .saturating_mul(2)
                    .min(config.max_recovery_timeout);
                self.open(now);
                self
            }
            // Late results of requests admitted before the breaker opened.
            (CircuitState::Open, _) => self,
        }
    }

    /// Closed, with an empty failure window and no outcome for at least
    /// `retention`.
    pub fn is_idle(&self, now: Instant, config: &BreakerConfig) -> bool {
        let quiet = now.saturating_duration_since(self.last_activity);
        self.state == CircuitState::Closed
            && (self.failure_count == 0 || quiet > config.window)
            && quiet >= config.retention
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_opened_at = None;
        self.probes_remaining = 0;
        self.successes_needed = 0;
    }

    fn close(&mut self, now: Instant, config: &BreakerConfig) {
        self.state = CircuitState::Closed;
        self.recent_failures.clear();
        self.failure_count = 0;
        self.opened_at = None;
        self.half_opened_at = None;
        self.recovery_timeout = config.recovery_timeout;
        self.last_activity = self.last_activity.max(now);
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
