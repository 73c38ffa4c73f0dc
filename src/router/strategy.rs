//! Key Selection Strategies
//!
//! Picks which healthy key serves the next request.

use crate::error::PoolError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Success-rate weight floor so flaky keys keep receiving some traffic
const MIN_WEIGHT: f64 = 0.05;

/// Strategy for choosing among healthy keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySelectionStrategy {
    /// Cycle through keys in stable order
    #[default]
    RoundRobin,

    /// Fewest in-flight requests, then fewest lifetime requests
    #[serde(alias = "least_busy")]
    LeastUsed,

    /// Random, weighted by observed success rate
    #[serde(alias = "weighted_random_by_success_rate")]
    WeightedRandom,

    /// Lowest rolling average latency
    LeastLatency,
}

impl std::fmt::Display for KeySelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastUsed => write!(f, "least_used"),
            Self::WeightedRandom => write!(f, "weighted_random"),
            Self::LeastLatency => write!(f, "least_latency"),
        }
    }
}

impl std::str::FromStr for KeySelectionStrategy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_used" | "least_busy" => Ok(Self::LeastUsed),
            "weighted_random" | "weighted_random_by_success_rate" => Ok(Self::WeightedRandom),
            "least_latency" => Ok(Self::LeastLatency),
            _ => Err(PoolError::Config(format!(
                "Unknown key selection strategy '{}'. Valid: round_robin, least_used, weighted_random, least_latency",
                s
            ))),
        }
    }
}

/// Selection-relevant view of one healthy key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    /// Stable position of the key in the pool
    pub index: usize,
    pub in_flight: u32,
    pub total_requests: u64,
    pub successes: u64,
    pub avg_latency: Option<Duration>,
}

impl Candidate {
    fn weight(&self) -> f64 {
        if self.total_requests == 0 {
            // Untested keys are assumed reliable until they prove otherwise
            return 1.0;
        }
        (self.successes as f64 / self.total_requests.max(1) as f64).max(MIN_WEIGHT)
    }
}

/// A strategy plus the round-robin cursor it shares across callers
#[derive(Debug)]
pub struct Selector {
    strategy: KeySelectionStrategy,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: KeySelectionStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> KeySelectionStrategy {
        self.strategy
    }

    /// Choose a candidate, returning its pool index
    pub fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        self.select_with_rng(candidates, &mut rand::thread_rng())
    }

    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        candidates: &[Candidate],
        rng: &mut R,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            KeySelectionStrategy::RoundRobin => self.round_robin(candidates),
            KeySelectionStrategy::LeastUsed => candidates
                .iter()
                .min_by_key(|c| (c.in_flight, c.total_requests, c.index))
                .map(|c| c.index),
            KeySelectionStrategy::WeightedRandom => weighted_random(candidates, rng),
            KeySelectionStrategy::LeastLatency => candidates
                .iter()
                .min_by_key(|c| (c.avg_latency.unwrap_or(Duration::ZERO), c.index))
                .map(|c| c.index),
        }
    }

    /// First candidate at or after the cursor in key order, wrapping around
    fn round_robin(&self, candidates: &[Candidate]) -> Option<usize> {
        let mut cursor = self.cursor.load(Ordering::Acquire);
        loop {
            let chosen = candidates
                .iter()
                .map(|c| c.index)
                .filter(|&i| i >= cursor)
                .min()
                .or_else(|| candidates.iter().map(|c| c.index).min())?;

            match self.cursor.compare_exchange_weak(
                cursor,
                chosen + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(chosen),
                Err(current) => cursor = current,
            }
        }
    }
}

fn weighted_random<R: Rng + ?Sized>(candidates: &[Candidate], rng: &mut R) -> Option<usize> {
    let total: f64 = candidates.iter().map(Candidate::weight).sum();
    if total <= 0.0 {
        return candidates.iter().map(|c| c.index).min();
    }

    let mut point = rng.gen_range(0.0..total);
    for candidate in candidates {
        let weight = candidate.weight();
        if point < weight {
            return Some(candidate.index);
        }
        point -= weight;
    }

    // Float residue lands on the last candidate
    candidates.last().map(|c| c.index)
}
