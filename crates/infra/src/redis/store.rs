//! Redis-backed store.
//!
//! - **Push**: `MULTI` / `HMSET` / `EXPIRE` / `ZADD` / `EXEC`
//! - **Remove**: one Lua script; `ZREM`, then `DEL` only if the id was still
//!   scheduled, so a cancellation that loses to promotion leaves the record
//!   for the consumer
//! - **Promotion**: one Lua script; `ZRANGEBYSCORE`, then per id `ZREM`,
//!   `HGET topic` and `LPUSH` into the topic's ready queue
//! - **Pop**: `RPOP` / `BRPOP`, then `HGETALL` and `DEL` as separate commands
//!
//! Scripts run atomically on the server, which gives the single indivisible
//! transition required between promotion and cancellation.
//!
//! Standalone (or replicated primary) Redis only. The promotion script builds
//! `job_bucket`/`ready_queue` keys from prefixes passed in `ARGV` because the
//! due ids are not known before it runs; Redis Cluster requires every key a
//! script touches to be declared in `KEYS` and to hash to one slot.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use delayer_core::Message;

use super::connector::RedisPool;
use super::keys;
use crate::config::ClientConfig;
use crate::pool::PoolError;
use crate::store::{
    Promotion, PromotionReport, Store, StoreError, StoreResult, StoredRecord, TxOutcome, TxStep,
};

const UNSCHEDULE_SCRIPT: &str = r"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 0 then
  return {0, 0}
end
return {removed, redis.call('DEL', KEYS[2])}
";

// Returns a flat list of (id, topic) pairs; an empty topic marks an id whose
// record had expired and was dropped.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local result = {}
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  local topic = redis.call('HGET', ARGV[3] .. id, 'topic')
  if topic then
    redis.call('LPUSH', ARGV[4] .. topic, id)
  else
    topic = ''
  end
  table.insert(result, id)
  table.insert(result, topic)
end
return result
";

pub struct RedisStore {
    pool: RedisPool,
    unschedule_script: redis::Script,
    promote_script: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            unschedule_script: redis::Script::new(UNSCHEDULE_SCRIPT),
            promote_script: redis::Script::new(PROMOTE_SCRIPT),
        }
    }

    /// Build the pool and store from configuration without dialing.
    pub fn connect(config: &ClientConfig) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let pool = RedisPool::from_config(config).map_err(pool_error)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Run `f` on a pooled connection. Connections that fail at the
    /// transport level are discarded rather than returned.
    fn with_conn<T>(
        &self,
        what: &str,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.pool.get().map_err(pool_error)?;

        match f(&mut *conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    conn.discard();
                    return Err(StoreError::Connection(format!("{what} failed: {e}")));
                }
                Err(StoreError::Command(format!("{what} failed: {e}")))
            }
        }
    }
}

fn pool_error(e: PoolError) -> StoreError {
    match e {
        PoolError::Dial(reason) => StoreError::Connection(reason),
        other => StoreError::Pool(other.to_string()),
    }
}

/// `EXEC` reply of the push transaction. `None` means the transaction was
/// aborted.
fn schedule_outcome(reply: Option<(String, i64, i64)>) -> TxOutcome {
    match reply {
        None => TxOutcome::Conflict,
        Some((written, expired, added)) => TxOutcome::from_steps([
            (TxStep::WriteRecord, written == "OK"),
            (TxStep::ExpireRecord, expired != 0),
            (TxStep::ScheduleEntry, added != 0),
        ]),
    }
}

fn unschedule_outcome((unindexed, deleted): (i64, i64)) -> TxOutcome {
    TxOutcome::from_steps([
        (TxStep::UnscheduleEntry, unindexed != 0),
        (TxStep::DeleteRecord, deleted != 0),
    ])
}

fn promotion_report(pairs: Vec<String>) -> PromotionReport {
    let mut report = PromotionReport::default();
    let mut items = pairs.into_iter();

    while let (Some(id), Some(topic)) = (items.next(), items.next()) {
        if topic.is_empty() {
            report.dropped.push(id);
        } else {
            report.promoted.push(Promotion { id, topic });
        }
    }
    report
}

fn stored_record(mut fields: HashMap<String, String>) -> StoredRecord {
    StoredRecord {
        topic: fields.remove(keys::FIELD_TOPIC),
        body: fields.remove(keys::FIELD_BODY),
    }
}

/// Longest `BRPOP` timeout sent as-is; the server rejects values whose
/// millisecond deadline overflows. Anything longer blocks forever.
const MAX_BRPOP_TIMEOUT_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// `BRPOP` takes whole seconds, and 0 blocks forever; round sub-second
/// waits up so they still time out.
fn brpop_timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout
        .as_secs()
        .saturating_add(u64::from(timeout.subsec_nanos() > 0));
    if secs > MAX_BRPOP_TIMEOUT_SECS { 0 } else { secs }
}

impl Store for RedisStore {
    fn schedule(
        &self,
        message: &Message,
        ready_at: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<TxOutcome> {
        let bucket = keys::job_bucket(&message.id);

        let reply: Option<(String, i64, i64)> = self.with_conn("push transaction", |conn| {
            redis::pipe()
                .atomic()
                .cmd("HMSET")
                .arg(&bucket)
                .arg(keys::FIELD_TOPIC)
                .arg(&message.topic)
                .arg(keys::FIELD_BODY)
                .arg(&message.body)
                .cmd("EXPIRE")
                .arg(&bucket)
                .arg(ttl.as_secs())
                .cmd("ZADD")
                .arg(keys::JOB_POOL)
                .arg(keys::score(ready_at))
                .arg(&message.id)
                .query(conn)
        })?;

        Ok(schedule_outcome(reply))
    }

    fn unschedule(&self, id: &str) -> StoreResult<TxOutcome> {
        let reply: (i64, i64) = self.with_conn("remove script", |conn| {
            self.unschedule_script
                .key(keys::JOB_POOL)
                .key(keys::job_bucket(id))
                .arg(id)
                .invoke(conn)
        })?;

        Ok(unschedule_outcome(reply))
    }

    fn pop_ready(&self, topic: &str) -> StoreResult<Option<String>> {
        self.with_conn("RPOP", |conn| {
            redis::cmd("RPOP").arg(keys::ready_queue(topic)).query(conn)
        })
    }

    fn blocking_pop_ready(&self, topic: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let reply: Option<(String, String)> = self.with_conn("BRPOP", |conn| {
            redis::cmd("BRPOP")
                .arg(keys::ready_queue(topic))
                .arg(brpop_timeout_secs(timeout))
                .query(conn)
        })?;

        Ok(reply.map(|(_queue, id)| id))
    }

    fn read_record(&self, id: &str) -> StoreResult<StoredRecord> {
        let fields: HashMap<String, String> = self.with_conn("HGETALL", |conn| {
            redis::cmd("HGETALL").arg(keys::job_bucket(id)).query(conn)
        })?;

        Ok(stored_record(fields))
    }

    fn delete_record(&self, id: &str) -> StoreResult<bool> {
        let deleted: i64 = self.with_conn("DEL", |conn| {
            redis::cmd("DEL").arg(keys::job_bucket(id)).query(conn)
        })?;

        Ok(deleted > 0)
    }

    fn promote_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<PromotionReport> {
        let pairs: Vec<String> = self.with_conn("promote script", |conn| {
            self.promote_script
                .key(keys::JOB_POOL)
                .arg(keys::score(now))
                .arg(limit)
                .arg(keys::JOB_BUCKET_PREFIX)
                .arg(keys::READY_QUEUE_PREFIX)
                .invoke(conn)
        })?;

        let report = promotion_report(pairs);
        if !report.dropped.is_empty() {
            warn!(
                dropped = report.dropped.len(),
                "due jobs had no record left and were dropped"
            );
        }
        Ok(report)
    }

    fn scheduled_len(&self) -> StoreResult<usize> {
        self.with_conn("ZCARD", |conn| {
            redis::cmd("ZCARD").arg(keys::JOB_POOL).query(conn)
        })
    }

    fn ready_len(&self, topic: &str) -> StoreResult<usize> {
        self.with_conn("LLEN", |conn| {
            redis::cmd("LLEN").arg(keys::ready_queue(topic)).query(conn)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reply_all_ok_is_committed() {
        assert_eq!(
            schedule_outcome(Some(("OK".into(), 1, 1))),
            TxOutcome::Committed
        );
    }

    #[test]
    fn push_reply_for_pending_id_is_partial() {
        assert_eq!(
            schedule_outcome(Some(("OK".into(), 1, 0))),
            TxOutcome::Partial {
                missed: vec![TxStep::ScheduleEntry]
            }
        );
    }

    #[test]
    fn aborted_exec_is_conflict() {
        assert_eq!(schedule_outcome(None), TxOutcome::Conflict);
    }

    #[test]
    fn remove_reply_maps_each_step() {
        assert_eq!(unschedule_outcome((1, 1)), TxOutcome::Committed);
        assert_eq!(
            unschedule_outcome((1, 0)),
            TxOutcome::Partial {
                missed: vec![TxStep::DeleteRecord]
            }
        );
        assert_eq!(
            unschedule_outcome((0, 0)),
            TxOutcome::Partial {
                missed: vec![TxStep::UnscheduleEntry, TxStep::DeleteRecord]
            }
        );
    }

    #[test]
    fn promotion_pairs_split_into_promoted_and_dropped() {
        let report = promotion_report(vec![
            "j1".into(),
            "email".into(),
            "j2".into(),
            String::new(),
            "j3".into(),
            "sms".into(),
        ]);

        assert_eq!(
            report.promoted,
            vec![
                Promotion {
                    id: "j1".into(),
                    topic: "email".into()
                },
                Promotion {
                    id: "j3".into(),
                    topic: "sms".into()
                },
            ]
        );
        assert_eq!(report.dropped, vec!["j2".to_string()]);
    }

    #[test]
    fn hash_fields_map_to_record() {
        let fields = HashMap::from([
            ("topic".to_string(), "email".to_string()),
            ("body".to_string(), "hi".to_string()),
        ]);
        assert_eq!(
            stored_record(fields),
            StoredRecord {
                topic: Some("email".into()),
                body: Some("hi".into()),
            }
        );
        assert_eq!(stored_record(HashMap::new()), StoredRecord::default());
    }

    #[test]
    fn brpop_timeout_rounds_up() {
        assert_eq!(brpop_timeout_secs(Duration::ZERO), 0);
        assert_eq!(brpop_timeout_secs(Duration::from_secs(2)), 2);
        assert_eq!(brpop_timeout_secs(Duration::from_millis(1)), 1);
        assert_eq!(brpop_timeout_secs(Duration::from_millis(1500)), 2);
    }

    #[test]
    fn brpop_timeout_beyond_server_range_blocks_forever() {
        assert_eq!(
            brpop_timeout_secs(Duration::from_secs(MAX_BRPOP_TIMEOUT_SECS)),
            MAX_BRPOP_TIMEOUT_SECS
        );
        assert_eq!(
            brpop_timeout_secs(Duration::from_secs(MAX_BRPOP_TIMEOUT_SECS + 1)),
            0
        );
        assert_eq!(brpop_timeout_secs(Duration::from_secs(u64::MAX)), 0);
        assert_eq!(brpop_timeout_secs(Duration::MAX), 0);
    }
}
