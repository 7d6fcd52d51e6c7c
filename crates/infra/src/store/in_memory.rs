use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use delayer_core::Message;

use super::r#trait::{
    Promotion, PromotionReport, Store, StoreError, StoreResult, StoredRecord, TxOutcome, TxStep,
};
use crate::clock::{Clock, SystemClock};

/// Position of an id in the scheduling index.
///
/// `seq` is the push order; it breaks ties between equal ready-at instants.
type IndexKey = (DateTime<Utc>, u64);

#[derive(Debug)]
struct Record {
    topic: String,
    body: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    index: BTreeSet<(IndexKey, String)>,
    positions: HashMap<String, IndexKey>,
    records: HashMap<String, Record>,
    queues: HashMap<String, VecDeque<String>>,
    next_seq: u64,
}

impl State {
    /// Record for `id` if it has not expired by `now`. Expired records are
    /// reclaimed on the way.
    fn live_record(&mut self, id: &str, now: DateTime<Utc>) -> Option<&Record> {
        let expired = self.records.get(id).is_some_and(|r| r.expires_at <= now);
        if expired {
            self.records.remove(id);
        }
        self.records.get(id)
    }

    fn unindex(&mut self, id: &str) -> bool {
        match self.positions.remove(id) {
            Some(key) => self.index.remove(&(key, id.to_string())),
            None => false,
        }
    }

    fn pop_queue(&mut self, topic: &str) -> Option<String> {
        let queue = self.queues.get_mut(topic)?;
        let id = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(topic);
        }
        id
    }
}

/// In-memory store.
///
/// Intended for tests/dev. One mutex guards all three structures, so every
/// operation is trivially atomic; blocked consumers park on a condition
/// variable that promotions signal.
///
/// Record TTLs are checked lazily against the injected [`Clock`].
pub struct InMemoryStore {
    state: Mutex<State>,
    ready: Condvar,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
            clock: Arc::new(clock),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Store for InMemoryStore {
    fn schedule(
        &self,
        message: &Message,
        ready_at: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<TxOutcome> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut state = self.lock()?;

        state.records.insert(
            message.id.clone(),
            Record {
                topic: message.topic.clone(),
                body: message.body.clone(),
                expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            },
        );

        // Re-scheduling a pending id moves it; like a sorted-set update this
        // reports no new entry.
        let newly_indexed = !state.unindex(&message.id);
        let key = (ready_at, state.next_seq);
        state.next_seq += 1;
        state.index.insert((key, message.id.clone()));
        state.positions.insert(message.id.clone(), key);

        Ok(TxOutcome::from_steps([
            (TxStep::WriteRecord, true),
            (TxStep::ExpireRecord, true),
            (TxStep::ScheduleEntry, newly_indexed),
        ]))
    }

    fn unschedule(&self, id: &str) -> StoreResult<TxOutcome> {
        let now = self.clock.now();
        let mut state = self.lock()?;

        // A promoted id is no longer indexed; its record belongs to the
        // consumer that will pop it and must survive.
        let unindexed = state.unindex(id);
        let deleted = unindexed
            && state.live_record(id, now).is_some()
            && state.records.remove(id).is_some();

        Ok(TxOutcome::from_steps([
            (TxStep::UnscheduleEntry, unindexed),
            (TxStep::DeleteRecord, deleted),
        ]))
    }

    fn pop_ready(&self, topic: &str) -> StoreResult<Option<String>> {
        Ok(self.lock()?.pop_queue(topic))
    }

    fn blocking_pop_ready(&self, topic: &str, timeout: Duration) -> StoreResult<Option<String>> {
        // Zero, or a deadline past what `Instant` can represent, waits forever.
        let deadline = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        let mut state = self.lock()?;

        loop {
            if let Some(id) = state.pop_queue(topic) {
                return Ok(Some(id));
            }

            state = match deadline {
                None => self.ready.wait(state).map_err(|_| StoreError::Poisoned)?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    self.ready
                        .wait_timeout(state, remaining)
                        .map_err(|_| StoreError::Poisoned)?
                        .0
                }
            };
        }
    }

    fn read_record(&self, id: &str) -> StoreResult<StoredRecord> {
        let now = self.clock.now();
        let mut state = self.lock()?;

        Ok(state
            .live_record(id, now)
            .map(|r| StoredRecord {
                topic: Some(r.topic.clone()),
                body: Some(r.body.clone()),
            })
            .unwrap_or_default())
    }

    fn delete_record(&self, id: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(state.live_record(id, now).is_some() && state.records.remove(id).is_some())
    }

    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<PromotionReport> {
        let mut state = self.lock()?;

        let due: Vec<(IndexKey, String)> = state
            .index
            .iter()
            .take_while(|((ready_at, _), _)| *ready_at <= now)
            .take(limit)
            .cloned()
            .collect();

        let mut report = PromotionReport::default();
        for entry in due {
            state.index.remove(&entry);
            let id = entry.1;
            state.positions.remove(&id);

            match state.live_record(&id, now).map(|r| r.topic.clone()) {
                Some(topic) => {
                    state
                        .queues
                        .entry(topic.clone())
                        .or_default()
                        .push_back(id.clone());
                    report.promoted.push(Promotion { id, topic });
                }
                None => report.dropped.push(id),
            }
        }

        if !report.promoted.is_empty() {
            self.ready.notify_all();
        }

        Ok(report)
    }

    fn scheduled_len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.index.len())
    }

    fn ready_len(&self, topic: &str) -> StoreResult<usize> {
        Ok(self.lock()?.queues.get(topic).map_or(0, VecDeque::len))
    }
}
