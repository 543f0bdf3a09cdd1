//! Per-destination circuit breakers.
//!
//! ## States
//!
//! - **Closed**: deliveries proceed. Each failure increments the failure count;
//!   reaching the threshold opens the breaker.
//! - **Open**: deliveries are not attempted until the cool-down elapses.
//! - **HalfOpen**: after the cool-down exactly one probe delivery is admitted.
//!   Its success closes the breaker, its failure reopens it with a fresh
//!   cool-down. A probe that was admitted but never attempted must be released.
//!   A probe nobody reports on within one cool-down expires, and the next
//!   caller gets a new one.
//!
//! Any success resets the failure count.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use courier_core::DestinationId;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures that open a closed breaker
    pub threshold: u32,
    /// How long an open breaker rejects before admitting a probe
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of [`CircuitBreakerRegistry::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Breaker closed: deliver normally.
    Allow,
    /// Caller holds the single half-open probe. Report the outcome, or call
    /// `release_probe` if the delivery is not attempted.
    Probe,
    /// Do not deliver; try again after `retry_after`.
    Reject { retry_after: Duration },
}

/// Snapshot of one destination's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub destination: DestinationId,
    pub failures: u32,
    pub threshold: u32,
    pub is_open: bool,
    pub state: CircuitState,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
            probe_started: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_started = None;
    }
}

/// One breaker per destination. State changes for a destination happen under
/// its map shard lock, so each transition is atomic.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<DestinationId, BreakerState>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a delivery to `destination` may be attempted now.
    pub fn check(&self, destination: &DestinationId) -> BreakerDecision {
        let mut breaker = self
            .breakers
            .entry(destination.clone())
            .or_insert_with(BreakerState::closed);

        match breaker.state {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                let elapsed = breaker.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.probe_started = Some(Instant::now());
                    info!(destination = %destination, "circuit half-open, admitting probe");
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject {
                        retry_after: self.config.cooldown - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                let in_flight = breaker.probe_started.map(|at| at.elapsed());
                match in_flight {
                    Some(elapsed) if elapsed < self.config.cooldown => BreakerDecision::Reject {
                        retry_after: self.config.cooldown - elapsed,
                    },
                    Some(_) => {
                        warn!(destination = %destination, "probe outcome never reported, reissuing");
                        breaker.probe_started = Some(Instant::now());
                        BreakerDecision::Probe
                    }
                    None => {
                        breaker.probe_started = Some(Instant::now());
                        BreakerDecision::Probe
                    }
                }
            }
        }
    }

    pub fn record_success(&self, destination: &DestinationId) {
        let mut breaker = self
            .breakers
            .entry(destination.clone())
            .or_insert_with(BreakerState::closed);

        if breaker.state != CircuitState::Closed {
            info!(destination = %destination, "circuit closed");
        }
        *breaker = BreakerState::closed();
    }

    pub fn record_failure(&self, destination: &DestinationId) {
        let mut breaker = self
            .breakers
            .entry(destination.clone())
            .or_insert_with(BreakerState::closed);

        breaker.failures = breaker.failures.saturating_add(1);
        match breaker.state {
            CircuitState::Closed if breaker.failures >= self.config.threshold => {
                breaker.open();
                warn!(
                    destination = %destination,
                    failures = breaker.failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                breaker.open();
                warn!(destination = %destination, "probe failed, circuit reopened");
            }
            _ => {}
        }
    }

    /// Give back a probe that was admitted but not attempted.
    pub fn release_probe(&self, destination: &DestinationId) {
        if let Some(mut breaker) = self.breakers.get_mut(destination) {
            if breaker.state == CircuitState::HalfOpen {
                breaker.probe_started = None;
            }
        }
    }

    pub fn is_open(&self, destination: &DestinationId) -> bool {
        self.breakers
            .get(destination)
            .is_some_and(|b| b.state != CircuitState::Closed)
    }

    /// Snapshot of every breaker, sorted by destination.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| CircuitBreakerStats {
                destination: entry.key().clone(),
                failures: entry.failures,
                threshold: self.config.threshold,
                is_open: entry.state != CircuitState::Closed,
                state: entry.state,
            })
            .collect();
        stats.sort_by(|a, b| a.destination.cmp(&b.destination));
        stats
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
