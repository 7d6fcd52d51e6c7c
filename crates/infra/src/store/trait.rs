use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use delayer_core::Message;

/// One sub-command of a multi-command store transaction.
///
/// Used by [`TxOutcome::Partial`] to name the steps that executed without
/// changing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStep {
    /// Write `topic`/`body` into the job record.
    WriteRecord,
    /// Attach the record's TTL.
    ExpireRecord,
    /// Insert the id into the scheduling index.
    ScheduleEntry,
    /// Remove the id from the scheduling index.
    UnscheduleEntry,
    /// Delete the job record.
    DeleteRecord,
}

/// Typed result of a multi-command store transaction.
///
/// ## Semantics
///
/// - **Committed**: every sub-command reported its expected effect
/// - **Partial**: the transaction executed atomically, but the listed steps
///   found nothing to do (e.g. the id was already promoted or cancelled)
/// - **Conflict**: the store aborted the transaction; nothing was applied
///
/// `Partial` and `Conflict` are application-level rejections, never faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Partial { missed: Vec<TxStep> },
    Conflict,
}

impl TxOutcome {
    /// Build an outcome from `(step, had_effect)` pairs.
    pub fn from_steps(steps: impl IntoIterator<Item = (TxStep, bool)>) -> Self {
        let missed: Vec<TxStep> = steps
            .into_iter()
            .filter_map(|(step, applied)| (!applied).then_some(step))
            .collect();

        if missed.is_empty() {
            Self::Committed
        } else {
            Self::Partial { missed }
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Fields found on a job record.
///
/// An absent (or expired) record reads as both fields `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredRecord {
    pub topic: Option<String>,
    pub body: Option<String>,
}

impl StoredRecord {
    /// Rebuild the message if both fields are present and non-empty.
    pub fn into_message(self, id: &str) -> Option<Message> {
        match (self.topic, self.body) {
            (Some(topic), Some(body)) if !topic.is_empty() && !body.is_empty() => {
                Some(Message::new(id, topic, body))
            }
            _ => None,
        }
    }
}

/// One job moved from the scheduling index into a delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub id: String,
    pub topic: String,
}

/// What a promotion pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    /// Jobs appended to their topic's delivery queue, in promotion order.
    pub promoted: Vec<Promotion>,
    /// Due ids whose record had already expired; removed from the index and
    /// not enqueued anywhere.
    pub dropped: Vec<String>,
}

impl PromotionReport {
    /// Number of due index entries handled (promoted or dropped).
    pub fn handled(&self) -> usize {
        self.promoted.len() + self.dropped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handled() == 0
    }

    pub fn merge(&mut self, other: PromotionReport) {
        self.promoted.extend(other.promoted);
        self.dropped.extend(other.dropped);
    }
}

/// Store operation error.
///
/// These are **transport/store faults**. They are always surfaced to the
/// caller and never retried inside the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("store state poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability over the three logical structures of the queue.
///
/// ## Structures
///
/// - **Scheduling index**: ids ordered by ready-at, one entry per id
/// - **Job records**: `topic`/`body` per id, with a TTL
/// - **Delivery queues**: one FIFO list of ids per topic
///
/// ## Atomicity
///
/// `schedule`, `unschedule` and `promote_due` are each a single indivisible
/// transition with respect to every other operation on the same id. In
/// particular only one of `unschedule` and `promote_due` can win a given id;
/// the loser sees no effect.
///
/// `pop_ready`, `read_record` and `delete_record` are independent steps.
/// Only the pop has to be exclusive: no two callers may receive the same id.
pub trait Store: Send + Sync {
    /// Write the job record (with `ttl`) and insert the id into the
    /// scheduling index at `ready_at`, as one transaction.
    fn schedule(
        &self,
        message: &Message,
        ready_at: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<TxOutcome>;

    /// Remove the id from the scheduling index and, only if it was still
    /// there, delete its record, as one transaction. An id that lost to
    /// promotion keeps its record so it stays deliverable.
    fn unschedule(&self, id: &str) -> StoreResult<TxOutcome>;

    /// Pop the oldest id from the topic's delivery queue.
    fn pop_ready(&self, topic: &str) -> StoreResult<Option<String>>;

    /// Like [`Store::pop_ready`], but waits up to `timeout` for an id.
    /// A zero `timeout` waits indefinitely.
    fn blocking_pop_ready(&self, topic: &str, timeout: Duration) -> StoreResult<Option<String>>;

    fn read_record(&self, id: &str) -> StoreResult<StoredRecord>;

    /// Delete a job record. Returns whether a record existed; deleting an
    /// absent record is not an error.
    fn delete_record(&self, id: &str) -> StoreResult<bool>;

    /// Move up to `limit` entries with `ready_at <= now` from the scheduling
    /// index into their delivery queues, in ascending ready-at order.
    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<PromotionReport>;

    /// Number of ids still in the scheduling index.
    fn scheduled_len(&self) -> StoreResult<usize>;

    /// Number of ids waiting in the topic's delivery queue.
    fn ready_len(&self, topic: &str) -> StoreResult<usize>;
}

impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    fn schedule(
        &self,
        message: &Message,
        ready_at: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<TxOutcome> {
        (**self).schedule(message, ready_at, ttl)
    }

    fn unschedule(&self, id: &str) -> StoreResult<TxOutcome> {
        (**self).unschedule(id)
    }

    fn pop_ready(&self, topic: &str) -> StoreResult<Option<String>> {
        (**self).pop_ready(topic)
    }

    fn blocking_pop_ready(&self, topic: &str, timeout: Duration) -> StoreResult<Option<String>> {
        (**self).blocking_pop_ready(topic, timeout)
    }

    fn read_record(&self, id: &str) -> StoreResult<StoredRecord> {
        (**self).read_record(id)
    }

    fn delete_record(&self, id: &str) -> StoreResult<bool> {
        (**self).delete_record(id)
    }

    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<PromotionReport> {
        (**self).promote_due(now, limit)
    }

    fn scheduled_len(&self) -> StoreResult<usize> {
        (**self).scheduled_len()
    }

    fn ready_len(&self, topic: &str) -> StoreResult<usize> {
        (**self).ready_len(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_steps_applied_is_committed() {
        let outcome = TxOutcome::from_steps([
            (TxStep::UnscheduleEntry, true),
            (TxStep::DeleteRecord, true),
        ]);
        assert_eq!(outcome, TxOutcome::Committed);
        assert!(outcome.is_committed());
    }

    #[test]
    fn missed_steps_are_listed_in_order() {
        let outcome = TxOutcome::from_steps([
            (TxStep::WriteRecord, true),
            (TxStep::ExpireRecord, false),
            (TxStep::ScheduleEntry, false),
        ]);
        assert_eq!(
            outcome,
            TxOutcome::Partial {
                missed: vec![TxStep::ExpireRecord, TxStep::ScheduleEntry]
            }
        );
        assert!(!outcome.is_committed());
    }

    #[test]
    fn incomplete_record_does_not_rebuild() {
        let only_topic = StoredRecord {
            topic: Some("email".into()),
            body: None,
        };
        assert_eq!(only_topic.into_message("j1"), None);

        let empty_body = StoredRecord {
            topic: Some("email".into()),
            body: Some(String::new()),
        };
        assert_eq!(empty_body.into_message("j1"), None);

        assert_eq!(StoredRecord::default().into_message("j1"), None);
    }

    #[test]
    fn complete_record_rebuilds_message() {
        let record = StoredRecord {
            topic: Some("email".into()),
            body: Some("hi".into()),
        };
        assert_eq!(
            record.into_message("j1"),
            Some(Message::new("j1", "email", "hi"))
        );
    }

    #[test]
    fn report_merge_accumulates() {
        let mut report = PromotionReport::default();
        assert!(report.is_empty());

        report.merge(PromotionReport {
            promoted: vec![Promotion {
                id: "a".into(),
                topic: "t".into(),
            }],
            dropped: vec!["b".into()],
        });
        report.merge(PromotionReport {
            promoted: vec![],
            dropped: vec!["c".into()],
        });

        assert_eq!(report.handled(), 3);
        assert_eq!(report.dropped, vec!["b".to_string(), "c".to_string()]);
    }
}
