//! Scheduling arithmetic for a pushed message.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{DomainError, DomainResult};

/// How long a job waits before promotion, and how long its payload survives
/// after that.
///
/// The job record lives for `delay + ready_max_lifetime`; a consumer that
/// pops the job later than that finds the payload gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delay {
    pub delay_secs: u64,
    pub ready_max_lifetime_secs: u64,
}

impl Delay {
    pub fn new(delay_secs: u64, ready_max_lifetime_secs: u64) -> Self {
        Self {
            delay_secs,
            ready_max_lifetime_secs,
        }
    }

    /// Reject a schedule whose record would be born expired, or whose TTL
    /// exceeds [`MAX_RECORD_TTL_SECS`].
    pub fn validate(&self) -> DomainResult<()> {
        let ttl = self.record_ttl_secs();
        if ttl == 0 {
            return Err(DomainError::validation(
                "delay plus ready max lifetime must be greater than 0",
            ));
        }
        if ttl > MAX_RECORD_TTL_SECS {
            return Err(DomainError::validation(format!(
                "delay plus ready max lifetime must not exceed {MAX_RECORD_TTL_SECS} seconds"
            )));
        }
        Ok(())
    }

    pub fn record_ttl_secs(&self) -> u64 {
        self.delay_secs.saturating_add(self.ready_max_lifetime_secs)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs())
    }

    /// Instant at which the job becomes due for promotion.
    pub fn ready_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = i64::try_from(self.delay_secs).unwrap_or(i64::MAX);
        now.checked_add_signed(chrono::Duration::seconds(delay.min(MAX_DELAY_SECS)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Longest accepted record lifetime (100 years).
///
/// Backing stores reject expiry times whose millisecond deadline overflows a
/// signed 64-bit integer, so a record TTL must stay well inside that range.
pub const MAX_RECORD_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

// chrono::Duration::seconds panics beyond i64::MAX milliseconds.
const MAX_DELAY_SECS: i64 = i64::MAX / 1_000;
