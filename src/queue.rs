//! Durable work queue on Redis, plus the persistence worker that consumes
//! it.
//!
//! Layout per queue `{name}`:
//! - `queue:{name}:wait`    list of ready jobs (LPUSH / BRPOP)
//! - `queue:{name}:delayed` zset of retry jobs scored by due time (ms)
//! - `queue:{name}:failed`  list of terminally failed jobs, last 100 kept
//!
//! Failed jobs retry with exponential backoff (`2s * 2^(attempt-1)`) up to
//! `max_attempts`, then land in the fail log. Handlers must be idempotent:
//! a crash between processing and completion redelivers.

use anyhow::{anyhow, Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::DocStore;

pub const KIND_PERSIST_PRICE: &str = "persistPrice";

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: i64 = 2_000;
const FAIL_LOG_KEEP: isize = 100;
const POP_TIMEOUT_SECS: f64 = 1.0;
const PROMOTE_BATCH: isize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    /// Attempts already made; 0 until the first run fails.
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: i64,
}

/// Payload of a `persistPrice` job. Idempotency key is `(symbol, ts)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistPricePayload {
    pub symbol: String,
    pub price: String,
    pub ts: i64,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub failed: u64,
}

/// Retry delay for the given (1-based) failed attempt.
pub fn backoff_delay_ms(attempt: u32) -> i64 {
    BACKOFF_BASE_MS * (1i64 << (attempt.saturating_sub(1).min(16)))
}

#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
    name: String,
}

impl JobQueue {
    pub async fn connect(url: &str, name: &str) -> Result<Self> {
        let client = Client::open(url).context("invalid queue Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect job queue")?;
        info!(queue = name, "🧰 job queue ready");
        Ok(Self {
            conn,
            name: name.to_string(),
        })
    }

    fn wait_key(&self) -> String {
        format!("queue:{}:wait", self.name)
    }

    fn delayed_key(&self) -> String {
        format!("queue:{}:delayed", self.name)
    }

    fn failed_key(&self) -> String {
        format!("queue:{}:failed", self.name)
    }

    pub async fn enqueue(&self, kind: &str, payload: Value) -> Result<()> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
        };
        let encoded = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.wait_key(), encoded)
            .await
            .context("enqueue failed")?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let waiting: u64 = conn.llen(self.wait_key()).await.unwrap_or(0);
        let delayed: u64 = conn.zcard(self.delayed_key()).await.unwrap_or(0);
        let failed: u64 = conn.llen(self.failed_key()).await.unwrap_or(0);
        Ok(QueueStats {
            waiting,
            delayed,
            failed,
        })
    }

    /// Move due retry jobs from the delayed zset back onto the wait list.
    async fn promote_due(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.delayed_key(), 0i64, now, 0, PROMOTE_BATCH)
            .await
            .unwrap_or_default();
        for encoded in due {
            let removed: i64 = conn.zrem(self.delayed_key(), &encoded).await.unwrap_or(0);
            // Another worker may have promoted it first.
            if removed > 0 {
                conn.rpush::<_, _, ()>(self.wait_key(), &encoded).await?;
            }
        }
        Ok(())
    }

    /// Block for the next ready job.
    async fn pop(&self) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(self.wait_key(), POP_TIMEOUT_SECS)
            .await
            .context("queue pop failed")?;
        match popped {
            Some((_key, encoded)) => {
                let job = serde_json::from_str(&encoded).context("undecodable job")?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Re-schedule a failed job with backoff, or park it in the fail log
    /// once attempts are exhausted.
    async fn retry_or_fail(&self, mut job: Job, error: &anyhow::Error) -> Result<()> {
        job.attempt += 1;
        let encoded = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();

        if job.attempt < job.max_attempts {
            let due = chrono::Utc::now().timestamp_millis() + backoff_delay_ms(job.attempt);
            warn!(
                job = %job.id,
                kind = %job.kind,
                attempt = job.attempt,
                retry_in_ms = backoff_delay_ms(job.attempt),
                error = %error,
                "job failed, scheduling retry"
            );
            conn.zadd::<_, _, _, ()>(self.delayed_key(), encoded, due)
                .await?;
        } else {
            warn!(
                job = %job.id,
                kind = %job.kind,
                attempts = job.attempt,
                error = %error,
                "job exhausted retries, moving to fail log"
            );
            conn.lpush::<_, _, ()>(self.failed_key(), encoded).await?;
            conn.ltrim::<_, ()>(self.failed_key(), 0, FAIL_LOG_KEEP - 1)
                .await?;
        }
        Ok(())
    }
}

/// Consumes the job queue. The only kind currently dispatched is
/// `persistPrice`, an idempotent structured-record sink.
pub struct PersistenceWorker {
    queue: JobQueue,
    store: Arc<DocStore>,
    shutdown: Arc<AtomicBool>,
}

impl PersistenceWorker {
    pub fn new(queue: JobQueue, store: Arc<DocStore>) -> Self {
        Self {
            queue,
            store,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("⚙️  persistence worker started");
            while !self.shutdown.load(Ordering::Relaxed) {
                if let Err(e) = self.queue.promote_due().await {
                    debug!(error = %e, "delayed-job promotion failed");
                }

                let job = match self.queue.pop().await {
                    Ok(Some(job)) => job,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(error = %e, "queue pop error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                if let Err(e) = self.process(&job).await {
                    if let Err(requeue_err) = self.queue.retry_or_fail(job, &e).await {
                        warn!(error = %requeue_err, "failed to requeue job");
                    }
                }
            }
            info!("⚙️  persistence worker stopped");
        })
    }

    async fn process(&self, job: &Job) -> Result<()> {
        match job.kind.as_str() {
            KIND_PERSIST_PRICE => {
                let payload: PersistPricePayload =
                    serde_json::from_value(job.payload.clone()).context("bad persistPrice payload")?;
                self.store
                    .record_price_event(&payload.symbol, &payload.price, payload.ts, &payload.source)
                    .await
            }
            other => Err(anyhow!("unknown job kind: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_from_two_seconds() {
        assert_eq!(backoff_delay_ms(1), 2_000);
        assert_eq!(backoff_delay_ms(2), 4_000);
        assert_eq!(backoff_delay_ms(3), 8_000);
        // Attempt 0 (never failed) behaves like the first retry.
        assert_eq!(backoff_delay_ms(0), 2_000);
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job {
            id: "abc".into(),
            kind: KIND_PERSIST_PRICE.into(),
            payload: serde_json::json!({"symbol": "BTCUSDT", "price": "1", "ts": 5, "source": "Trade"}),
            attempt: 2,
            max_attempts: 3,
            enqueued_at: 1_700_000_000_000,
        };
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, "abc");
        assert_eq!(decoded.attempt, 2);

        let payload: PersistPricePayload = serde_json::from_value(decoded.payload).unwrap();
        assert_eq!(payload.symbol, "BTCUSDT");
        assert_eq!(payload.ts, 5);
    }
}
