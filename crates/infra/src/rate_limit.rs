//! Per-destination token-bucket rate limiting.
//!
//! Each destination gets its own `governor` direct limiter, created lazily on
//! first use and kept for the life of the process. A destination's rate comes
//! from the entry's `rate_limit_per_minute` hint, or the registry default.
//! Burst capacity is one second's worth of tokens (at least one).
//!
//! A different hint does not reset the bucket. The new rate is adopted only
//! once the current bucket has been idle long enough to refill completely, so
//! entries with mixed hints cannot push a destination past either rate.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Serialize;
use tracing::debug;

use courier_core::DestinationId;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter registry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Rate used when an entry carries no hint.
    pub default_per_minute: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_per_minute: 600,
        }
    }
}

impl RateLimiterConfig {
    pub fn with_default_per_minute(mut self, per_minute: u32) -> Self {
        self.default_per_minute = per_minute;
        self
    }
}

/// Snapshot of one destination's limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub destination: DestinationId,
    pub rate_per_second: f64,
    pub rate_per_minute: u32,
    pub burst: u32,
}

struct LimiterSlot {
    per_minute: NonZeroU32,
    burst: NonZeroU32,
    limiter: DirectLimiter,
    last_taken: Instant,
}

impl LimiterSlot {
    fn new(per_minute: NonZeroU32) -> Self {
        let burst = non_zero(per_minute.get() / 60);
        let quota = Quota::per_minute(per_minute).allow_burst(burst);
        Self {
            per_minute,
            burst,
            limiter: RateLimiter::direct(quota),
            last_taken: Instant::now(),
        }
    }

    /// Whether the bucket is full again, i.e. replacing it grants nothing
    /// the current one would not.
    fn is_replenished(&self) -> bool {
        let refill = Duration::from_secs(60) * self.burst.get() / self.per_minute.get();
        self.last_taken.elapsed() >= refill
    }
}

/// One token bucket per destination.
pub struct RateLimiterRegistry {
    limiters: DashMap<DestinationId, LimiterSlot>,
    config: RateLimiterConfig,
    clock: DefaultClock,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            limiters: DashMap::new(),
            config,
            clock: DefaultClock::default(),
        }
    }

    /// Take one token for `destination` without blocking.
    ///
    /// On denial returns how long until a token becomes available. A changed
    /// `hint` takes effect once the destination's bucket has refilled; until
    /// then the current bucket keeps limiting.
    pub fn try_acquire(&self, destination: &DestinationId, hint: Option<u32>) -> Result<(), Duration> {
        let per_minute = non_zero(hint.unwrap_or(self.config.default_per_minute));

        let mut slot = self
            .limiters
            .entry(destination.clone())
            .or_insert_with(|| LimiterSlot::new(per_minute));
        if slot.per_minute != per_minute && slot.is_replenished() {
            debug!(
                destination = %destination,
                old_per_minute = slot.per_minute.get(),
                new_per_minute = per_minute.get(),
                "rebuilding rate limiter"
            );
            *slot = LimiterSlot::new(per_minute);
        }

        slot.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))?;
        slot.last_taken = Instant::now();
        Ok(())
    }

    /// Snapshot of every limiter, sorted by destination.
    pub fn stats(&self) -> Vec<RateLimiterStats> {
        let mut stats: Vec<_> = self
            .limiters
            .iter()
            .map(|entry| RateLimiterStats {
                destination: entry.key().clone(),
                rate_per_second: f64::from(entry.per_minute.get()) / 60.0,
                rate_per_minute: entry.per_minute.get(),
                burst: entry.burst.get(),
            })
            .collect();
        stats.sort_by(|a, b| a.destination.cmp(&b.destination));
        stats
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

/// Clamp to at least one.
fn non_zero(n: u32) -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(n.saturating_sub(1))
}
