//! Backing-store key namespace.
//!
//! These names are shared with every other component of a deployment and
//! must not change:
//!
//! - `delayer:job_pool`: sorted set of pending ids, score = ready-at seconds
//! - `delayer:job_bucket:{id}`: hash with `topic` and `body`, carries the TTL
//! - `delayer:ready_queue:{topic}`: list of due ids; producers of ready ids
//!   `LPUSH`, consumers `RPOP`/`BRPOP`

use chrono::{DateTime, Utc};

pub const JOB_POOL: &str = "delayer:job_pool";
pub const JOB_BUCKET_PREFIX: &str = "delayer:job_bucket:";
pub const READY_QUEUE_PREFIX: &str = "delayer:ready_queue:";

pub const FIELD_TOPIC: &str = "topic";
pub const FIELD_BODY: &str = "body";

/// Build a job record key: `delayer:job_bucket:{id}`
pub fn job_bucket(id: &str) -> String {
    format!("{JOB_BUCKET_PREFIX}{id}")
}

/// Build a delivery queue key: `delayer:ready_queue:{topic}`
pub fn ready_queue(topic: &str) -> String {
    format!("{READY_QUEUE_PREFIX}{topic}")
}

/// Sorted-set score for a ready-at instant.
///
/// Seconds since the epoch, kept to millisecond precision so jobs pushed
/// within the same second still promote in push order.
pub fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_use_fixed_prefixes() {
        assert_eq!(job_bucket("j1"), "delayer:job_bucket:j1");
        assert_eq!(ready_queue("email"), "delayer:ready_queue:email");
    }

    #[test]
    fn score_is_seconds_with_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_250).unwrap();
        assert_eq!(score(at), 1_700_000_000.25);
    }

    #[test]
    fn later_instants_score_higher() {
        let at = Utc::now();
        assert!(score(at + chrono::Duration::milliseconds(1)) > score(at));
    }
}
