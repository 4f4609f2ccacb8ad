//! Redis backend: sorted sets for ordering, hashes for job bodies.
//!
//! Key layout under `{prefix}`:
//! - `{prefix}:pending` zset, member = profile key, score = dispatch score (ms)
//! - `{prefix}:retry`   zset, member = profile key, score = retry time (ms)
//! - `{prefix}:jobs`    hash, profile key -> job JSON (pending and retry jobs)
//! - `{prefix}:leased`  hash, profile key -> leased job JSON
//! - `{prefix}:leases`  zset, member = profile key, score = lease expiry (ms)
//! - `{prefix}:dead`    list of dead-letter JSON
//!
//! Equal pending scores dispatch in member (lexicographic) order. A failed
//! lease is routed by compare-and-swap: the leased JSON read before applying
//! the [`RetryPolicy`] must still be in place when the routing script runs.

use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::{
    QueueResult, QueueError, Job, LeasedJob, DeadLetter, FailureRoute, FailedLease, QueueStats,
    Lane, RetryPolicy, backend::QueueBackend,
};

const PUSH_PENDING: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1])
  or redis.call('HEXISTS', KEYS[3], ARGV[1]) == 1
  or redis.call('ZSCORE', KEYS[4], ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
return 1
"#;

const LEASE_NEXT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
local key = popped[1]
local job = redis.call('HGET', KEYS[2], key)
redis.call('HDEL', KEYS[2], key)
if not job then
  return false
end
local leased = '{"job":' .. job .. ',"leased_at":"' .. ARGV[1] .. '","lease_until":"' .. ARGV[2] .. '"}'
redis.call('HSET', KEYS[3], key, leased)
redis.call('ZADD', KEYS[4], ARGV[3], key)
return leased
"#;

const TAKE_LEASE: &str = r#"
local leased = redis.call('HGET', KEYS[1], ARGV[1])
if not leased then
  return false
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return leased
"#;

const ROUTE_FAILURE: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
if ARGV[3] == 'retry' then
  redis.call('HSET', KEYS[3], ARGV[1], ARGV[4])
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
else
  redis.call('RPUSH', KEYS[5], ARGV[4])
end
return 1
"#;

const PROMOTE_RETRY: &str = r#"
local due = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not due or tonumber(due) > tonumber(ARGV[2]) then
  return 0
end
if redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  redis.call('ZREM', KEYS[1], ARGV[1])
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

/// Redis-backed queue shared by every process that points at the same prefix
#[derive(Clone)]
pub struct RedisBackend {
    /// Shared by every clone; `None` once closed
    conn: Arc<RwLock<Option<ConnectionManager>>>,
    pending_key: String,
    retry_key: String,
    jobs_key: String,
    leased_key: String,
    leases_key: String,
    dead_key: String,
}

impl RedisBackend {
    /// Connect to Redis and namespace every key under `prefix`
    pub async fn connect(redis_url: &str, prefix: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to Redis queue backend (prefix: {})", prefix);

        Ok(Self {
            conn: Arc::new(RwLock::new(Some(conn))),
            pending_key: format!("{}:pending", prefix),
            retry_key: format!("{}:retry", prefix),
            jobs_key: format!("{}:jobs", prefix),
            leased_key: format!("{}:leased", prefix),
            leases_key: format!("{}:leases", prefix),
            dead_key: format!("{}:dead", prefix),
        })
    }

    fn conn(&self) -> QueueResult<ConnectionManager> {
        self.conn
            .read()
            .clone()
            .ok_or_else(|| QueueError::Backend("redis backend is closed".to_string()))
    }

    /// Read the lease, route it through `policy`, then swap it out only if it
    /// is unchanged
    async fn route_lease(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
        expired_only: bool,
    ) -> QueueResult<Option<FailedLease>> {
        let mut conn = self.conn()?;

        let raw: Option<String> = conn.hget(&self.leased_key, key).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let leased: LeasedJob = serde_json::from_str(&raw)?;
        if expired_only && !leased.lease_expired(now) {
            return Ok(None);
        }

        let lease_until = leased.lease_until;
        let route = policy.route(leased.job, error, now);
        let (lane, body, score) = match &route {
            FailureRoute::Retry { job, retry_at } => {
                ("retry", serde_json::to_string(job)?, retry_at.timestamp_millis())
            }
            FailureRoute::Dead(letter) => ("dead", serde_json::to_string(letter)?, now.timestamp_millis()),
        };

        let routed: i64 = Script::new(ROUTE_FAILURE)
            .key(&self.leased_key)
            .key(&self.leases_key)
            .key(&self.jobs_key)
            .key(&self.retry_key)
            .key(&self.dead_key)
            .arg(key)
            .arg(&raw)
            .arg(lane)
            .arg(body)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        if routed == 1 {
            Ok(Some(FailedLease { lease_until, route }))
        } else {
            debug!("Lease on {} changed before its failure was routed", key);
            Ok(None)
        }
    }

    fn decode_leased(raw: Option<String>) -> QueueResult<Option<LeasedJob>> {
        raw.map(|json| serde_json::from_str::<LeasedJob>(&json))
            .transpose()
            .map_err(QueueError::from)
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn push_pending(&self, job: Job, score_ms: i64) -> QueueResult<bool> {
        let body = serde_json::to_string(&job)?;
        let mut conn = self.conn()?;

        let inserted: i64 = Script::new(PUSH_PENDING)
            .key(&self.pending_key)
            .key(&self.jobs_key)
            .key(&self.leased_key)
            .key(&self.retry_key)
            .arg(&job.key)
            .arg(score_ms)
            .arg(body)
            .invoke_async(&mut conn)
            .await?;

        Ok(inserted == 1)
    }

    async fn lease_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> QueueResult<Option<LeasedJob>> {
        let mut conn = self.conn()?;

        let raw: Option<String> = Script::new(LEASE_NEXT)
            .key(&self.pending_key)
            .key(&self.jobs_key)
            .key(&self.leased_key)
            .key(&self.leases_key)
            .arg(now.to_rfc3339())
            .arg(lease_until.to_rfc3339())
            .arg(lease_until.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        Self::decode_leased(raw)
    }

    async fn take_lease(&self, key: &str) -> QueueResult<Option<LeasedJob>> {
        let mut conn = self.conn()?;

        let raw: Option<String> = Script::new(TAKE_LEASE)
            .key(&self.leased_key)
            .key(&self.leases_key)
            .arg(key)
            .invoke_async(&mut conn)
            .await?;

        Self::decode_leased(raw)
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>> {
        let mut conn = self.conn()?;
        let keys: Vec<String> = conn
            .zrangebyscore(&self.leases_key, "-inf", now.timestamp_millis())
            .await?;
        Ok(keys)
    }

    async fn fail_lease(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> QueueResult<Option<FailedLease>> {
        self.route_lease(key, error, now, policy, false).await
    }

    async fn reclaim_lease(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> QueueResult<Option<FailedLease>> {
        self.route_lease(key, error, now, policy, true).await
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>> {
        let mut conn = self.conn()?;
        let keys: Vec<String> = conn
            .zrangebyscore(&self.retry_key, "-inf", now.timestamp_millis())
            .await?;
        Ok(keys)
    }

    async fn promote_retry(&self, key: &str, now: DateTime<Utc>, score_ms: i64) -> QueueResult<bool> {
        let mut conn = self.conn()?;

        let moved: i64 = Script::new(PROMOTE_RETRY)
            .key(&self.retry_key)
            .key(&self.pending_key)
            .arg(key)
            .arg(now.timestamp_millis())
            .arg(score_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = conn.lrange(&self.dead_key, 0, -1).await?;

        raw.iter()
            .map(|json| serde_json::from_str::<DeadLetter>(json).map_err(QueueError::from))
            .collect()
    }

    async fn lane_of(&self, key: &str) -> QueueResult<Option<Lane>> {
        let mut conn = self.conn()?;

        let pending: Option<f64> = conn.zscore(&self.pending_key, key).await?;
        if pending.is_some() {
            return Ok(Some(Lane::Pending));
        }

        let leased: bool = conn.hexists(&self.leased_key, key).await?;
        if leased {
            return Ok(Some(Lane::Leased));
        }

        let retry: Option<f64> = conn.zscore(&self.retry_key, key).await?;
        Ok(retry.map(|_| Lane::Retry))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn()?;

        let (pending, leased, retry, dead): (usize, usize, usize, usize) = redis::pipe()
            .zcard(&self.pending_key)
            .hlen(&self.leased_key)
            .zcard(&self.retry_key)
            .llen(&self.dead_key)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats::new(pending, leased, retry, dead))
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn()?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!("Redis ping: {}", pong);
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        // the socket closes once in-flight calls drop their clones
        if self.conn.write().take().is_some() {
            info!("Released Redis queue connection");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
