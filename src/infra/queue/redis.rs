//! Redis queue backend: sorted-set priority index with an atomic
//! promote-and-pop script.
//!
//! # Key Schema
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{ns}:ready` | Sorted Set | Ready index; score = priority + time |
//! | `{ns}:delayed` | Sorted Set | Delayed index; score = eligibility ms |
//! | `{ns}:delayed_scores` | Hash | Ready score to apply at promotion |
//! | `{ns}:task:{id}` | String | Task envelope payload, TTL'd |
//! | `{ns}:result:{id}` | String | Transient result cache, TTL'd |
//!
//! The pop path runs as a single Lua script so concurrent consumers cannot
//! double-pop: due delayed tasks are promoted into the ready index, then
//! `ZPOPMIN` hands the lowest-score member to exactly one caller. The
//! payload fetch happens after the pop, when the caller already owns the id
//! exclusively.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tracing::warn;

use crate::core::{SchedulerError, Task, TaskEnvelope, TaskId};
use crate::util::clock;

use super::QueueBackend;

/// Promote due delayed members, then pop the lowest-score ready member.
///
/// KEYS[1] = ready zset, KEYS[2] = delayed zset, KEYS[3] = score hash.
/// ARGV[1] = current epoch milliseconds.
/// Returns: the popped member id, or false when the ready index is empty.
const LUA_POP: &str = r"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, 64)
for _, id in ipairs(due) do
    local score = redis.call('HGET', KEYS[3], id)
    if score then
        redis.call('ZADD', KEYS[1], tonumber(score), id)
    end
    redis.call('HDEL', KEYS[3], id)
    redis.call('ZREM', KEYS[2], id)
end
local popped = redis.call('ZPOPMIN', KEYS[1], 1)
if popped[1] then
    return popped[1]
end
return false
";

/// Redis-backed queue. The multiplexed connection is cloned per call; all
/// clones share one TCP connection.
pub struct RedisQueue {
    conn: MultiplexedConnection,
    namespace: String,
    payload_ttl: Duration,
    pop_script: Script,
}

impl RedisQueue {
    /// Connect and ping, failing fast when the server is unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Redis`] if the client cannot be created,
    /// the connection cannot be established, or the ping fails.
    pub async fn connect(
        url: &str,
        namespace: &str,
        payload_ttl: Duration,
    ) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            payload_ttl,
            pop_script: Script::new(LUA_POP),
        })
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.namespace)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.namespace)
    }

    fn scores_key(&self) -> String {
        format!("{}:delayed_scores", self.namespace)
    }

    fn task_key(&self, id: &TaskId) -> String {
        format!("{}:task:{id}", self.namespace)
    }

    fn result_key(&self, id: &TaskId) -> String {
        format!("{}:result:{id}", self.namespace)
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn put(&self, task: &Task) -> Result<bool, SchedulerError> {
        let raw = TaskEnvelope::wrap(task.clone()).encode()?;
        let id = task.id.to_string();
        let score = task.queue_score();
        let payload_ttl = Self::ttl_secs(self.payload_ttl);
        let mut conn = self.conn.clone();

        let now_ms = clock::now_ms();
        if let Some(at) = task.eligible_at_ms().filter(|at| *at > now_ms) {
            let _: () = redis::pipe()
                .atomic()
                .set_ex(self.task_key(&task.id), raw, payload_ttl)
                .hset(self.scores_key(), &id, score)
                .zadd(self.delayed_key(), &id, at)
                .query_async(&mut conn)
                .await?;
        } else {
            let _: () = redis::pipe()
                .atomic()
                .set_ex(self.task_key(&task.id), raw, payload_ttl)
                .zadd(self.ready_key(), &id, score)
                .query_async(&mut conn)
                .await?;
        }
        Ok(true)
    }

    async fn pop(&self) -> Result<Option<Task>, SchedulerError> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = self
            .pop_script
            .key(self.ready_key())
            .key(self.delayed_key())
            .key(self.scores_key())
            .arg(clock::now_ms())
            .invoke_async(&mut conn)
            .await?;

        let Some(raw_id) = popped else {
            return Ok(None);
        };
        let id = TaskId::parse(&raw_id)
            .map_err(|_| SchedulerError::QueueUnavailable(format!("malformed member {raw_id}")))?;

        let payload_key = self.task_key(&id);
        let payload: Option<String> = conn.get(&payload_key).await?;
        let _: () = conn.del(&payload_key).await?;

        match payload {
            Some(raw) => Ok(Some(TaskEnvelope::decode(&raw)?)),
            None => {
                // Index entry outlived its TTL'd payload; skip it.
                warn!(task_id = %id, "popped task with expired payload");
                Ok(None)
            }
        }
    }

    async fn size(&self) -> Result<usize, SchedulerError> {
        let mut conn = self.conn.clone();
        let (ready, delayed): (usize, usize) = redis::pipe()
            .zcard(self.ready_key())
            .zcard(self.delayed_key())
            .query_async(&mut conn)
            .await?;
        Ok(ready + delayed)
    }

    async fn remove(&self, id: &TaskId) -> Result<bool, SchedulerError> {
        let member = id.to_string();
        let mut conn = self.conn.clone();
        let (from_ready, from_delayed, _, _): (i64, i64, i64, i64) = redis::pipe()
            .atomic()
            .zrem(self.ready_key(), &member)
            .zrem(self.delayed_key(), &member)
            .hdel(self.scores_key(), &member)
            .del(self.task_key(id))
            .query_async(&mut conn)
            .await?;
        Ok(from_ready + from_delayed > 0)
    }

    async fn set_result(
        &self,
        id: &TaskId,
        value: &Value,
        ttl: Duration,
    ) -> Result<(), SchedulerError> {
        let raw = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.result_key(id), raw, Self::ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn get_result(&self, id: &TaskId) -> Result<Option<Value>, SchedulerError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.result_key(id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
