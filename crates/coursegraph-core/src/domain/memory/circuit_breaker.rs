//! Circuit breaker guarding graph-store writes from the sync worker
//!
//! One breaker is shared by all WAL records. Transitions take an explicit
//! `now` so the state machine can be driven without a clock.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive store failures before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe
    pub cooldown: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Public-facing circuit state for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// What the caller may do with the next write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Circuit closed; dispatch normally
    Allowed,
    /// Half-open; this write is the single probe
    Probe,
    /// Circuit open, or a probe is already in flight
    Rejected,
}

/// Snapshot of circuit breaker status for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub cooldown_remaining_ms: Option<u64>,
}

/// Circuit breaker state machine
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
        }
    }

    /// Ask to dispatch one write at `now`
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// hands out exactly one probe.
    pub fn try_acquire_at(&mut self, now: Instant) -> Permit {
        match self.state {
            CircuitState::Closed => Permit::Allowed,
            CircuitState::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) >= self.config.cooldown {
                    self.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    info!("Circuit half-open after cool-down; dispatching probe");
                    Permit::Probe
                } else {
                    Permit::Rejected
                }
            }
            CircuitState::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    Permit::Rejected
                } else {
                    self.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    Permit::Probe
                }
            }
        }
    }

    pub fn try_acquire(&mut self) -> Permit {
        self.try_acquire_at(Instant::now())
    }

    /// Record a successful store write
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen { .. } => {
                self.consecutive_failures = 0;
                self.state = CircuitState::Closed;
                info!("Circuit closed after successful probe");
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a store failure at `now`
    pub fn record_failure_at(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open { opened_at: now };
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit opened after consecutive store failures"
                    );
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.state = CircuitState::Open { opened_at: now };
                warn!("Circuit re-opened after failed probe");
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now())
    }

    pub fn state(&self) -> CircuitStateKind {
        match self.state {
            CircuitState::Closed => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }

    /// Return a status snapshot for reporting
    pub fn status(&self) -> CircuitBreakerStatus {
        let cooldown_remaining_ms = match self.state {
            CircuitState::Open { opened_at } => Some(
                self.config
                    .cooldown
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };

        CircuitBreakerStatus {
            state: self.state(),
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            cooldown_ms: self.config.cooldown.as_millis() as u64,
            cooldown_remaining_ms,
        }
    }
}
