//! Queue entry types and retry policy.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use courier_core::{DestinationId, DomainError, EntryId, TenantId};

/// Named priority levels. Lower values are delivered first.
pub mod priority {
    pub const HIGH: i32 = 1;
    pub const NORMAL: i32 = 5;
    pub const LOW: i32 = 10;
}

/// Attempt ceiling applied when an entry does not specify one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How long a `processing` row may go untouched before it is considered abandoned.
pub const DEFAULT_STALE_PROCESSING_AFTER: Duration = Duration::from_secs(120);

/// What produced a queue entry. Used for grouping and progress reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Broadcast,
    Automation,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Broadcast => "broadcast",
            SourceType::Automation => "automation",
        }
    }
}

impl FromStr for SourceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(Self::Broadcast),
            "automation" => Ok(Self::Automation),
            other => Err(DomainError::validation(format!("unknown source type: {other}"))),
        }
    }
}

/// Stored status of a queue entry.
///
/// There is no `sent` status: delivered entries are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be picked up (possibly scheduled via `next_retry_at`)
    Pending,
    /// Claimed by a worker
    Processing,
    /// Last attempt failed; eligible again once `next_retry_at` passes
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processing => "processing",
            EntryStatus::Failed => "failed",
        }
    }

    /// Pending and failed entries are both waiting for their retry time.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::Failed)
    }
}

impl FromStr for EntryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!("unknown entry status: {other}"))),
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Already-rendered message content. Opaque to the queue except for the
/// rate-limit hint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmailPayload {
    pub from_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    /// Sending ceiling for the destination, in messages per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
}

/// An entry as handed to `enqueue`, before ids and timestamps are assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueueEntry {
    pub tenant_id: TenantId,
    pub destination_id: DestinationId,
    pub recipient: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub payload: EmailPayload,
    pub priority: i32,
    pub max_attempts: u32,
}

impl NewQueueEntry {
    pub fn new(
        tenant_id: TenantId,
        destination_id: DestinationId,
        recipient: impl Into<String>,
        source_type: SourceType,
        source_id: impl Into<String>,
        payload: EmailPayload,
    ) -> Self {
        Self {
            tenant_id,
            destination_id,
            recipient: recipient.into(),
            source_type,
            source_id: source_id.into(),
            payload,
            priority: priority::NORMAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Check the entry can be stored for `tenant_id`.
    pub fn validate(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if self.tenant_id != tenant_id {
            return Err(DomainError::validation(format!(
                "entry belongs to tenant {}, not {}",
                self.tenant_id, tenant_id
            )));
        }
        if self.recipient.trim().is_empty() {
            return Err(DomainError::validation("recipient is required"));
        }
        if self.source_id.trim().is_empty() {
            return Err(DomainError::validation("source_id is required"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.payload.rate_limit_per_minute == Some(0) {
            return Err(DomainError::validation("rate_limit_per_minute must be positive"));
        }
        Ok(())
    }

    /// Materialize into a stored entry.
    pub fn into_entry(self, now: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            id: EntryId::new(),
            tenant_id: self.tenant_id,
            destination_id: self.destination_id,
            recipient: self.recipient,
            source_type: self.source_type,
            source_id: self.source_id,
            payload: self.payload,
            priority: self.priority,
            status: EntryStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            next_retry_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub destination_id: DestinationId,
    pub recipient: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub payload: EmailPayload,
    pub priority: i32,
    pub status: EntryStatus,
    /// Attempts that actually reached the transport and failed
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Whether `fetch_pending` may return this entry at `now`.
    pub fn is_visible(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.status.is_schedulable() {
            self.next_retry_at.is_none_or(|at| at <= now)
        } else {
            self.is_stale(now, stale_after)
        }
    }

    /// A `processing` row nobody has touched within `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == EntryStatus::Processing
            && now
                .checked_sub_signed(to_chrono(stale_after))
                .is_some_and(|cutoff| self.updated_at <= cutoff)
    }

    /// Whether one more failed attempt exhausts the entry.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts.saturating_add(1) >= self.max_attempts
    }
}

/// Per-tenant entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.failed
    }
}

/// An entry that exhausted its attempts, removed from the live queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry: QueueEntry,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Exponential backoff for failed deliveries: `base * 2^(attempt - 1)`,
/// capped at `max_delay`, then spread randomly by up to `jitter` of the delay
/// in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(60), Duration::from_secs(3600))
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Backoff before jitter for a 1-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(20);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Jittered delay; every call draws a fresh spread.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + spread)).unwrap_or(delay)
    }

    /// Absolute retry time for the given attempt number.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now.checked_add_signed(to_chrono(self.jittered_delay(attempt)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn dest() -> DestinationId {
        DestinationId::new("ses-primary").unwrap()
    }

    fn new_entry(tenant_id: TenantId) -> NewQueueEntry {
        NewQueueEntry::new(
            tenant_id,
            dest(),
            "ada@example.com",
            SourceType::Broadcast,
            "bc_1",
            EmailPayload {
                subject: "Hello".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn exponential_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
        assert_eq!(policy.jittered_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn default_policy_is_one_minute_to_one_hour() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(3600));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn jitter_stays_within_range_and_spreads_retries() {
        let policy = RetryPolicy::default();
        let plain = policy.delay_for_attempt(2).as_secs_f64();

        let delays: HashSet<Duration> = (0..50)
            .map(|_| {
                let delay = policy.jittered_delay(2);
                let offset = (delay.as_secs_f64() - plain).abs();
                assert!(offset <= plain * policy.jitter + 0.001);
                delay
            })
            .collect();

        // Entries failing at the same attempt do not all come back together
        assert!(delays.len() > 1);
    }

    #[test]
    fn validation_rejects_bad_entries() {
        let tenant = TenantId::new();

        assert!(new_entry(tenant).validate(tenant).is_ok());
        assert!(new_entry(tenant).validate(TenantId::new()).is_err());

        let mut blank_recipient = new_entry(tenant);
        blank_recipient.recipient = "  ".into();
        assert!(blank_recipient.validate(tenant).is_err());

        let mut no_source = new_entry(tenant);
        no_source.source_id = String::new();
        assert!(no_source.validate(tenant).is_err());

        assert!(new_entry(tenant).with_max_attempts(0).validate(tenant).is_err());
    }

    #[test]
    fn visibility_follows_status_and_schedule() {
        let now = Utc::now();
        let stale_after = DEFAULT_STALE_PROCESSING_AFTER;
        let mut entry = new_entry(TenantId::new()).into_entry(now);

        assert!(entry.is_visible(now, stale_after));

        entry.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!entry.is_visible(now, stale_after));

        entry.status = EntryStatus::Failed;
        entry.next_retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(entry.is_visible(now, stale_after));

        entry.status = EntryStatus::Processing;
        entry.updated_at = now - chrono::Duration::seconds(60);
        assert!(!entry.is_visible(now, stale_after));

        entry.updated_at = now - chrono::Duration::seconds(121);
        assert!(entry.is_visible(now, stale_after));
    }

    #[test]
    fn last_attempt_detection() {
        let mut entry = new_entry(TenantId::new()).with_max_attempts(3).into_entry(Utc::now());
        assert!(!entry.is_last_attempt());
        entry.attempts = 2;
        assert!(entry.is_last_attempt());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [EntryStatus::Pending, EntryStatus::Processing, EntryStatus::Failed] {
            assert_eq!(status.as_str().parse::<EntryStatus>().unwrap(), status);
        }
        assert!("sent".parse::<EntryStatus>().is_err());
    }
}
