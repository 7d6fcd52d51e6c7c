//! Queue client: push, pop, blocking pop and remove.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use delayer_core::{Delay, DomainError, Message};

use crate::clock::{Clock, SystemClock};
use crate::store::{Store, StoreError, TxOutcome};

/// Queue operation error.
///
/// ## Error Categories
///
/// - **Invalid**: rejected before any store mutation
/// - **Store**: transport/store fault, surfaced as-is and never retried
/// - **NotAvailable / Timeout**: expected empty-queue signals; see
///   [`QueueError::is_expected`]
/// - **ExpiredOrIncomplete**: the job was promoted but its record's TTL ran
///   out before a consumer got to it (`ready_max_lifetime` too low for the
///   consumer latency)
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no job available on topic {topic}")]
    NotAvailable { topic: String },

    #[error("timed out waiting for a job on topic {topic}")]
    Timeout { topic: String },

    #[error("record of job {id} has expired or is incomplete")]
    ExpiredOrIncomplete { id: String },
}

impl QueueError {
    /// True for conditions a polling consumer simply retries on.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NotAvailable { .. } | Self::Timeout { .. })
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Client for the delayed job queue.
///
/// Holds no state besides the store handle (and its connection pool), so it
/// is cheap to clone and safe to share across threads.
///
/// ## Usage Pattern
///
/// ```ignore
/// let client = QueueClient::new(InMemoryStore::new());
/// client.push(&Message::new("j1", "email", "hi"), 2, 60)?;
///
/// // ... a promoter moves j1 into the "email" queue after 2s ...
///
/// match client.blocking_pop("email", 5) {
///     Ok(message) => handle(message),
///     Err(e) if e.is_expected() => {}
///     Err(e) => return Err(e),
/// }
/// ```
pub struct QueueClient<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for QueueClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> std::fmt::Debug for QueueClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient").finish_non_exhaustive()
    }
}

impl<S: Store> QueueClient<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(Arc::new(store), SystemClock)
    }

    pub fn with_clock(store: Arc<S>, clock: impl Clock + 'static) -> Self {
        Self {
            store,
            clock: Arc::new(clock),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Schedule `message` for delivery after `delay_secs`.
    ///
    /// Writes the job record (TTL `delay + ready_max_lifetime`) and the
    /// scheduling index entry in one transaction. Returns `false` without an
    /// error when the transaction ran but did not fully take effect, e.g.
    /// when the id was already pending (its record and schedule are then
    /// overwritten).
    #[instrument(skip(self, message), fields(id = %message.id, topic = %message.topic))]
    pub fn push(
        &self,
        message: &Message,
        delay_secs: u64,
        ready_max_lifetime_secs: u64,
    ) -> QueueResult<bool> {
        message.validate()?;
        let delay = Delay::new(delay_secs, ready_max_lifetime_secs);
        delay.validate()?;

        let ready_at = delay.ready_at(self.clock.now());
        match self.store.schedule(message, ready_at, delay.record_ttl())? {
            TxOutcome::Committed => {
                debug!(%ready_at, "job scheduled");
                Ok(true)
            }
            TxOutcome::Partial { missed } => {
                debug!(?missed, "push transaction partially applied");
                Ok(false)
            }
            TxOutcome::Conflict => {
                debug!("push transaction aborted");
                Ok(false)
            }
        }
    }

    /// Take the oldest ready job on `topic` without waiting.
    #[instrument(skip(self))]
    pub fn pop(&self, topic: &str) -> QueueResult<Message> {
        validate_topic(topic)?;

        let id = self
            .store
            .pop_ready(topic)?
            .ok_or_else(|| QueueError::NotAvailable {
                topic: topic.to_string(),
            })?;

        self.take_record(id)
    }

    /// Take the oldest ready job on `topic`, waiting up to `timeout_secs`
    /// for one to arrive. `0` waits indefinitely.
    #[instrument(skip(self))]
    pub fn blocking_pop(&self, topic: &str, timeout_secs: u64) -> QueueResult<Message> {
        validate_topic(topic)?;

        let id = self
            .store
            .blocking_pop_ready(topic, Duration::from_secs(timeout_secs))?
            .ok_or_else(|| QueueError::Timeout {
                topic: topic.to_string(),
            })?;

        self.take_record(id)
    }

    /// Cancel a job that has not been promoted yet.
    ///
    /// Returns `true` only if both the scheduling entry and the record were
    /// removed. `false` means the job was already promoted, already removed
    /// or never existed; a promoted job stays deliverable.
    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) -> QueueResult<bool> {
        if id.is_empty() {
            return Err(DomainError::validation("job id must not be empty").into());
        }

        match self.store.unschedule(id)? {
            TxOutcome::Committed => {
                debug!("job removed");
                Ok(true)
            }
            TxOutcome::Partial { missed } => {
                debug!(?missed, "remove arrived too late or found nothing");
                Ok(false)
            }
            TxOutcome::Conflict => Ok(false),
        }
    }

    /// Read the record of a popped id and delete it.
    fn take_record(&self, id: String) -> QueueResult<Message> {
        let Some(message) = self.store.read_record(&id)?.into_message(&id) else {
            warn!(%id, "popped job has no complete record; ready_max_lifetime may be too low");
            return Err(QueueError::ExpiredOrIncomplete { id });
        };

        // The id is already ours; a failed delete only leaves the record to
        // its TTL.
        if let Err(e) = self.store.delete_record(&id) {
            warn!(%id, error = %e, "failed to delete delivered job record");
        }

        debug!(%id, "job delivered");
        Ok(message)
    }
}

#[cfg(feature = "redis")]
impl QueueClient<crate::redis::RedisStore> {
    /// Build a Redis-backed client. Connections are opened on first use.
    pub fn connect(config: &crate::config::ClientConfig) -> QueueResult<Self> {
        Ok(Self::new(crate::redis::RedisStore::connect(config)?))
    }
}

fn validate_topic(topic: &str) -> Result<(), DomainError> {
    if topic.is_empty() {
        return Err(DomainError::validation("topic must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;

    fn client() -> (QueueClient<InMemoryStore>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        (QueueClient::with_clock(store, clock.clone()), clock)
    }

    fn promote(client: &QueueClient<InMemoryStore>, clock: &ManualClock) {
        client.store().promote_due(clock.now(), 100).unwrap();
    }

    #[test]
    fn push_then_pop_after_promotion() {
        let (client, clock) = client();
        let msg = Message::new("j1", "email", "hi");

        assert!(client.push(&msg, 2, 60).unwrap());

        clock.advance(Duration::from_secs(2));
        promote(&client, &clock);

        assert_eq!(client.pop("email").unwrap(), msg);
        assert!(matches!(
            client.pop("email"),
            Err(QueueError::NotAvailable { .. })
        ));
    }

    #[test]
    fn invalid_message_is_rejected_before_mutation() {
        let (client, _) = client();

        let err = client.push(&Message::new("j1", "", "hi"), 0, 60).unwrap_err();

        assert!(matches!(err, QueueError::Invalid(_)));
        assert_eq!(client.store().scheduled_len().unwrap(), 0);
    }

    #[test]
    fn zero_lifetime_schedule_is_rejected() {
        let (client, _) = client();
        let err = client
            .push(&Message::new("j1", "email", "hi"), 0, 0)
            .unwrap_err();
        assert!(matches!(err, QueueError::Invalid(_)));
    }

    #[test]
    fn lifetime_beyond_store_expiry_range_is_rejected_before_mutation() {
        let (client, _) = client();
        let msg = Message::new("j1", "email", "hi");

        for (delay, lifetime) in [
            (u64::MAX, 0),
            (0, u64::MAX),
            (delayer_core::MAX_RECORD_TTL_SECS, 1),
        ] {
            let err = client.push(&msg, delay, lifetime).unwrap_err();
            assert!(matches!(err, QueueError::Invalid(_)));
        }

        assert_eq!(client.store().scheduled_len().unwrap(), 0);
        assert_eq!(
            client.store().read_record("j1").unwrap(),
            crate::store::StoredRecord::default()
        );
    }

    #[test]
    fn repush_of_pending_id_returns_false_and_reschedules() {
        let (client, clock) = client();
        client.push(&Message::new("j1", "email", "v1"), 1, 60).unwrap();

        let accepted = client
            .push(&Message::new("j1", "email", "v2"), 10, 60)
            .unwrap();

        assert!(!accepted);
        clock.advance(Duration::from_secs(1));
        promote(&client, &clock);
        assert!(matches!(
            client.pop("email"),
            Err(QueueError::NotAvailable { .. })
        ));

        clock.advance(Duration::from_secs(9));
        promote(&client, &clock);
        assert_eq!(client.pop("email").unwrap().body, "v2");
    }

    #[test]
    fn expired_record_surfaces_distinct_error() {
        let (client, clock) = client();
        client.push(&Message::new("j1", "email", "hi"), 0, 5).unwrap();
        promote(&client, &clock);

        clock.advance(Duration::from_secs(5));

        let err = client.pop("email").unwrap_err();
        assert!(matches!(err, QueueError::ExpiredOrIncomplete { ref id } if id == "j1"));
        assert!(!err.is_expected());
    }

    #[test]
    fn remove_before_promotion_cancels_once() {
        let (client, clock) = client();
        client.push(&Message::new("j1", "email", "hi"), 5, 60).unwrap();

        assert!(client.remove("j1").unwrap());
        assert!(!client.remove("j1").unwrap());

        clock.advance(Duration::from_secs(5));
        promote(&client, &clock);
        assert!(matches!(
            client.pop("email"),
            Err(QueueError::NotAvailable { .. })
        ));
    }

    #[test]
    fn remove_after_promotion_is_a_no_op() {
        let (client, clock) = client();
        let msg = Message::new("j1", "email", "hi");
        client.push(&msg, 0, 60).unwrap();
        promote(&client, &clock);

        assert!(!client.remove("j1").unwrap());
        assert_eq!(client.pop("email").unwrap(), msg);
    }

    #[test]
    fn remove_of_unknown_id_is_false() {
        let (client, _) = client();
        assert!(!client.remove("ghost").unwrap());
    }

    #[test]
    fn blocking_pop_times_out_as_expected_condition() {
        let (client, _) = client();
        let started = std::time::Instant::now();

        let err = client.blocking_pop("empty", 1).unwrap_err();

        assert!(matches!(err, QueueError::Timeout { .. }));
        assert!(err.is_expected());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_secs(3));
    }

    #[test]
    fn blocking_pop_returns_already_ready_job() {
        let (client, clock) = client();
        let msg = Message::new("j1", "email", "hi");
        client.push(&msg, 0, 60).unwrap();
        promote(&client, &clock);

        assert_eq!(client.blocking_pop("email", 1).unwrap(), msg);
    }

    #[test]
    fn blocking_pop_with_maximum_timeout_returns_ready_job() {
        let (client, clock) = client();
        let msg = Message::new("j1", "email", "hi");
        client.push(&msg, 0, 60).unwrap();
        promote(&client, &clock);

        assert_eq!(client.blocking_pop("email", u64::MAX).unwrap(), msg);
    }

    #[test]
    fn empty_topic_and_id_are_invalid() {
        let (client, _) = client();
        assert!(matches!(client.pop(""), Err(QueueError::Invalid(_))));
        assert!(matches!(
            client.blocking_pop("", 1),
            Err(QueueError::Invalid(_))
        ));
        assert!(matches!(client.remove(""), Err(QueueError::Invalid(_))));
    }

    #[test]
    fn expected_conditions_are_classified() {
        assert!(QueueError::NotAvailable { topic: "t".into() }.is_expected());
        assert!(QueueError::Timeout { topic: "t".into() }.is_expected());
        assert!(!QueueError::Store(StoreError::Poisoned).is_expected());
        assert!(!QueueError::Invalid(DomainError::validation("x")).is_expected());
    }
}
