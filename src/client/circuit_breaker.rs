//! Circuit Breaker
//!
//! Per-key failure isolation. A key that keeps failing for upstream reasons is
//! taken out of rotation for a cool-down, then probed with a single request.

use crate::error::ErrorKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Traffic flows
    Closed,

    /// Traffic blocked until the cool-down elapses
    Open,

    /// One probe request may test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive upstream failures that open the circuit
    pub failure_threshold: u32,

    /// Time spent open before a probe is allowed
    pub cooldown: Duration,

    /// Successful probes needed to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    probe_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    probe_resolved: Notify,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                probe_successes: 0,
            }),
            probe_resolved: Notify::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Move OPEN to HALF_OPEN once the cool-down has elapsed
    fn advance(&self, state: &mut BreakerState, now: Instant) {
        if state.state != CircuitState::Open {
            return;
        }
        let cooled_down = state
            .opened_at
            .map_or(true, |opened| now >= opened + self.config.cooldown);

        if cooled_down {
            info!(key = %self.name, "circuit breaker transitioning to half-open");
            state.state = CircuitState::HalfOpen;
            state.probe_in_flight = false;
            state.probe_successes = 0;
        }
    }

    fn open(&self, state: &mut BreakerState, now: Instant) {
        state.state = CircuitState::Open;
        state.opened_at = Some(now);
        state.probe_successes = 0;
    }

    /// Current state, applying the cool-down transition
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.advance(&mut state, Instant::now());
        state.state
    }

    /// Whether [`allow`](Self::allow) would currently admit a request, without claiming it
    pub fn is_available(&self) -> bool {
        let mut state = self.state.lock();
        self.advance(&mut state, Instant::now());
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !state.probe_in_flight,
        }
    }

    /// Admit a request. In HALF_OPEN this claims the single probe slot.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        self.advance(&mut state, Instant::now());
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen if state.probe_in_flight => false,
            CircuitState::HalfOpen => {
                debug!(key = %self.name, "circuit breaker admitting probe");
                state.probe_in_flight = true;
                true
            }
        }
    }

    /// Give back a probe slot that was claimed but produced no health signal
    pub fn release_probe(&self) {
        let mut state = self.state.lock();
        if state.probe_in_flight {
            state.probe_in_flight = false;
            drop(state);
            self.probe_resolved.notify_waiters();
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        let was_probing = state.probe_in_flight;
        state.probe_in_flight = false;
        state.consecutive_failures = 0;

        match state.state {
            CircuitState::HalfOpen => {
                state.probe_successes += 1;
                if state.probe_successes >= self.config.success_threshold {
                    info!(key = %self.name, "circuit breaker closing after successful probe");
                    state.state = CircuitState::Closed;
                    state.opened_at = None;
                    state.probe_successes = 0;
                }
            }
            CircuitState::Open => {
                info!(key = %self.name, "circuit breaker closing after late success");
                state.state = CircuitState::Closed;
                state.opened_at = None;
            }
            CircuitState::Closed => {}
        }

        drop(state);
        if was_probing {
            self.probe_resolved.notify_waiters();
        }
    }

    /// Record a failed call. Only upstream-attributable kinds count toward the threshold.
    pub fn record_failure(&self, kind: ErrorKind) {
        if !kind.trips_breaker() {
            self.release_probe();
            return;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let was_probing = state.probe_in_flight;
        state.probe_in_flight = false;
        state.consecutive_failures += 1;

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        key = %self.name,
                        failures = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker opening due to failures"
                    );
                    self.open(&mut state, now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(key = %self.name, "circuit breaker reopening after failed probe");
                self.open(&mut state, now);
            }
            // Late failures from requests admitted before opening keep the original deadline
            CircuitState::Open => {}
        }

        drop(state);
        if was_probing {
            self.probe_resolved.notify_waiters();
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Whether a half-open probe is currently in flight
    pub fn is_probing(&self) -> bool {
        let state = self.state.lock();
        state.state == CircuitState::HalfOpen && state.probe_in_flight
    }

    /// Remaining cool-down while OPEN
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.advance(&mut state, now);
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some((opened + self.config.cooldown).saturating_duration_since(now))
            }
            _ => None,
        }
    }

    /// Notification fired whenever an in-flight probe resolves
    pub fn probe_resolved(&self) -> &Notify {
        &self.probe_resolved
    }
}
