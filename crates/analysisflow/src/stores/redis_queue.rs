//! Redis-backed fast queue.
//!
//! Key layout, all under `analysisflow:`:
//! - `queue:{name}`: list, LPUSH on submit; BRPOPLPUSH on dequeue moves the
//!   entry to `claimed:{name}` until it is acknowledged
//! - `job:{id}`: cached JSON record with a TTL, `job:{id}:rank` beside it
//! - `registry:{name}:{active|finished|failed}`: sorted sets scored by ms
//! - `workers:{name}`: sorted set of worker heartbeats

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Script;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::jobs::model::{JobId, JobRecord};
use crate::stores::{FastQueue, Registry, StoreError, StoreResult};

const KEY_PREFIX: &str = "analysisflow:";

// Keeps the newer of two cached records. KEYS: record, rank.
// ARGV: rank, body, ttl secs.
const CACHE_PUT_SCRIPT: &str = r#"
    local current = tonumber(redis.call('GET', KEYS[2]))
    if current and current > tonumber(ARGV[1]) then
        return 0
    end
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
    redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[3])
    return 1
"#;

#[derive(Clone)]
pub struct RedisFastQueue {
    conn: ConnectionManager,
    client: redis::Client,
    // A blocking pop owns its connection until it returns, so each
    // concurrent pop checks out its own.
    idle: Arc<Mutex<Vec<MultiplexedConnection>>>,
    queue_name: String,
}

impl RedisFastQueue {
    pub async fn new(redis_url: &str, queue_name: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("redis client error: {e}")))?;

        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            conn,
            client,
            idle: Arc::new(Mutex::new(Vec::new())),
            queue_name: queue_name.to_string(),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn queue_key(&self) -> String {
        format!("{KEY_PREFIX}queue:{}", self.queue_name)
    }

    fn claimed_key(&self) -> String {
        format!("{KEY_PREFIX}claimed:{}", self.queue_name)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{KEY_PREFIX}job:{job_id}")
    }

    fn rank_key(&self, job_id: &JobId) -> String {
        format!("{KEY_PREFIX}job:{job_id}:rank")
    }

    async fn checkout(&self) -> StoreResult<MultiplexedConnection> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn);
    }

    fn registry_key(&self, registry: Registry) -> String {
        format!("{KEY_PREFIX}registry:{}:{}", self.queue_name, registry.as_str())
    }

    fn workers_key(&self) -> String {
        format!("{KEY_PREFIX}workers:{}", self.queue_name)
    }
}

#[async_trait]
impl FastQueue for RedisFastQueue {
    async fn push(&self, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.queue_key())
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> StoreResult<Option<JobId>> {
        let mut conn = self.checkout().await?;

        // BRPOPLPUSH with a zero timeout blocks forever.
        let cmd = if wait.is_zero() {
            let mut cmd = redis::cmd("RPOPLPUSH");
            cmd.arg(self.queue_key()).arg(self.claimed_key());
            cmd
        } else {
            let mut cmd = redis::cmd("BRPOPLPUSH");
            cmd.arg(self.queue_key())
                .arg(self.claimed_key())
                .arg(wait.as_secs_f64());
            cmd
        };

        // a failed connection is dropped rather than returned to the pool
        let id: Option<String> = cmd.query_async(&mut conn).await?;
        self.checkin(conn);
        Ok(id.map(JobId::from))
    }

    async fn ack(&self, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(self.claimed_key())
            .arg(0)
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn unacked(&self) -> StoreResult<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.claimed_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn remove(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("LREM")
            .arg(self.queue_key())
            .arg(0)
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn contains(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let (queued, claimed): (Option<i64>, Option<i64>) = redis::pipe()
            .cmd("LPOS")
            .arg(self.queue_key())
            .arg(job_id.as_str())
            .cmd("LPOS")
            .arg(self.claimed_key())
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(queued.is_some() || claimed.is_some())
    }

    async fn position(&self, job_id: &JobId) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let key = self.queue_key();
        let (index, len): (Option<u64>, u64) = redis::pipe()
            .atomic()
            .cmd("LPOS")
            .arg(&key)
            .arg(job_id.as_str())
            .cmd("LLEN")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        // pushed on the left, popped from the right
        Ok(index.map(|i| len.saturating_sub(i + 1)))
    }

    async fn len(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = redis::cmd("LLEN")
            .arg(self.queue_key())
            .query_async(&mut conn)
            .await?;
        Ok(n)
    }

    async fn cache_put(&self, record: &JobRecord, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(record)?;
        let script = Script::new(CACHE_PUT_SCRIPT);
        let _: i64 = script
            .key(self.job_key(&record.job_id))
            .key(self.rank_key(&record.job_id))
            .arg(record.cache_rank())
            .arg(body)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn cache_get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("GET")
            .arg(self.job_key(job_id))
            .query_async(&mut conn)
            .await?;

        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    async fn cache_evict(&self, job_id: &JobId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.job_key(job_id))
            .arg(self.rank_key(job_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_registry(
        &self,
        job_id: &JobId,
        registry: Option<Registry>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for r in Registry::ALL {
            pipe.cmd("ZREM")
                .arg(self.registry_key(r))
                .arg(job_id.as_str())
                .ignore();
        }
        if let Some(r) = registry {
            pipe.cmd("ZADD")
                .arg(self.registry_key(r))
                .arg(at.timestamp_millis())
                .arg(job_id.as_str())
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn registry_count(&self, registry: Registry, since: DateTime<Utc>) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let key = self.registry_key(registry);
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(format!("({}", since.timestamp_millis()))
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.workers_key())
            .arg(at.timestamp_millis())
            .arg(worker_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(self.workers_key())
            .arg(worker_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn live_workers(&self, since: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = self.workers_key();
        let (mut names,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(format!("({}", since.timestamp_millis()))
            .ignore()
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        names.sort();
        Ok(names)
    }
}
