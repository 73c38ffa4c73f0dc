//! Token Bucket Rate Limiting
//!
//! Per-key admission control: a sustained `qps` budget with burst headroom.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Tolerance for float drift when a waiter wakes exactly on schedule
const TOKEN_EPSILON: f64 = 1e-9;

/// Longest wait ever reported for a token, however slow the refill rate
pub const MAX_TOKEN_WAIT: Duration = Duration::from_secs(365 * 24 * 3600);

/// What to do when a bucket has no token available
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Suspend the caller until a token is projected to be available
    #[default]
    Wait,

    /// Fail immediately with [`Throttled`]
    Reject,
}

/// Result of a non-blocking acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,

    /// No token now; one is projected after this delay
    Wait(Duration),
}

/// A token could not be obtained within the allowed time
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("rate limited: next token in {wait:?}")]
pub struct Throttled {
    pub wait: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuously refilled token bucket
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket with capacity `qps * burst_multiplier`, starting full.
    ///
    /// Capacity is never below one token, otherwise the key could never be used.
    pub fn new(qps: f64, burst_multiplier: f64) -> Self {
        Self::with_capacity(qps, qps * burst_multiplier)
    }

    pub fn with_capacity(qps: f64, capacity: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            qps,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn qps(&self) -> f64 {
        self.qps
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.capacity);
        state.last_refill = now;
    }

    fn wait_for_token(&self, tokens: f64) -> Duration {
        let secs = ((1.0 - tokens) / self.qps).max(0.0);
        Duration::try_from_secs_f64(secs).map_or(MAX_TOKEN_WAIT, |wait| wait.min(MAX_TOKEN_WAIT))
    }

    /// Take one token if available, otherwise report the minimal wait
    pub fn try_acquire(&self) -> Admission {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            Admission::Admitted
        } else {
            Admission::Wait(self.wait_for_token(state.tokens))
        }
    }

    /// Acquire one token, waiting in [`RateLimitMode::Wait`] but never past `deadline`
    pub async fn acquire(
        &self,
        mode: RateLimitMode,
        deadline: Option<Instant>,
    ) -> Result<(), Throttled> {
        loop {
            let wait = match self.try_acquire() {
                Admission::Admitted => return Ok(()),
                Admission::Wait(wait) => wait,
            };

            if mode == RateLimitMode::Reject {
                return Err(Throttled { wait });
            }
            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    return Err(Throttled { wait });
                }
            }

            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (after refill)
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Time until the next token, zero if one is available now
    pub fn time_until_available(&self) -> Duration {
        let tokens = self.available_tokens();
        if tokens + TOKEN_EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            self.wait_for_token(tokens)
        }
    }
}
