//! Durable job queue between ingress and the review worker.
//!
//! Redis-backed, at-least-once. Jobs wait on a pending list, are claimed
//! into a per-consumer processing list with `LMOVE`, and stay there until
//! explicitly acknowledged. Each claim is recorded in a registry hash so
//! the reaper can push jobs whose lease expired (crashed or stalled
//! consumer) back onto the pending list; processing entries with no claim
//! record are swept there too. With more than one consumer there is no
//! global ordering, and redelivery can duplicate a job a slow consumer
//! still holds.

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Direction};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::AppError,
    models::{QueuedJob, ReviewJob},
};

const PENDING_KEY: &str = "reviews:jobs";
const PROCESSING_PREFIX: &str = "reviews:processing:";
const DEAD_KEY: &str = "reviews:dead";
const CLAIMS_KEY: &str = "reviews:claims";
const CONSUMERS_KEY: &str = "reviews:consumers";

/// A job leased to one consumer. Holds the raw payload so the exact list
/// entry can be removed on ack.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: ReviewJob,
    pub raw: String,
    pub consumer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Requeued,
    Buried,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably enqueues a job. A broker failure here surfaces to the
    /// caller; nothing is silently dropped.
    async fn enqueue(&self, job: &ReviewJob) -> Result<(), AppError>;

    /// Leases the next pending job to `consumer`, if any.
    async fn claim(&self, consumer: &str) -> Result<Option<ClaimedJob>, AppError>;

    /// Removes a finished job from the queue. Terminal for the job whether
    /// it succeeded or failed permanently.
    async fn ack(&self, claimed: &ClaimedJob) -> Result<(), AppError>;

    /// Handles a transient failure: requeues with an incremented attempt
    /// counter, or buries the job on the dead-letter list once the retry
    /// budget is exhausted.
    async fn retry_or_bury(&self, claimed: ClaimedJob) -> Result<RetryDisposition, AppError>;

    /// Returns jobs whose lease expired to the pending list. Invoked
    /// periodically by the reaper.
    async fn reclaim_expired(&self) -> Result<usize, AppError>;
}

#[derive(Serialize, Deserialize)]
struct ClaimRecord {
    consumer: String,
    claimed_at: i64,
    payload: String,
}

pub struct RedisQueue {
    conn: ConnectionManager,
    max_attempts: u32,
    lease_secs: u64,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, max_attempts: u32, lease_secs: u64) -> Self {
        Self {
            conn,
            max_attempts,
            lease_secs,
        }
    }

    fn processing_key(consumer: &str) -> String {
        format!("{PROCESSING_PREFIX}{consumer}")
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &ReviewJob) -> Result<(), AppError> {
        let raw = QueuedJob::encode(job).map_err(|e| AppError::Broker(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(PENDING_KEY, raw)
            .await
            .map_err(|e| AppError::Broker(e.to_string()))?;

        Ok(())
    }

    async fn claim(&self, consumer: &str) -> Result<Option<ClaimedJob>, AppError> {
        let mut conn = self.conn.clone();
        let processing = Self::processing_key(consumer);

        // Register before the LMOVE: the reaper scans processing lists by
        // consumer name, so a consumer that dies between moving the job
        // and recording its claim is still found.
        let _: () = conn.sadd(CONSUMERS_KEY, consumer).await?;

        let raw: Option<String> = conn
            .lmove(PENDING_KEY, &processing, Direction::Right, Direction::Left)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let job = match QueuedJob::decode(&raw) {
            Ok(job) => job,
            Err(e) => {
                // Never crash the consumer on a bad payload.
                warn!("Dead-lettering undecodable job payload: {e}");
                let _: () = conn.lrem(&processing, 1, &raw).await?;
                let _: () = conn.lpush(DEAD_KEY, &raw).await?;
                return Ok(None);
            }
        };

        let record = ClaimRecord {
            consumer: consumer.to_string(),
            claimed_at: Utc::now().timestamp(),
            payload: raw.clone(),
        };
        let record = serde_json::to_string(&record).map_err(|e| AppError::Broker(e.to_string()))?;
        let _: () = conn.hset(CLAIMS_KEY, job.id.to_string(), record).await?;

        Ok(Some(ClaimedJob {
            job,
            raw,
            consumer: consumer.to_string(),
        }))
    }

    async fn ack(&self, claimed: &ClaimedJob) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let processing = Self::processing_key(&claimed.consumer);

        let _: () = conn.lrem(&processing, 1, &claimed.raw).await?;
        let _: () = conn.hdel(CLAIMS_KEY, claimed.job.id.to_string()).await?;

        Ok(())
    }

    async fn retry_or_bury(&self, claimed: ClaimedJob) -> Result<RetryDisposition, AppError> {
        let mut conn = self.conn.clone();
        let processing = Self::processing_key(&claimed.consumer);

        let mut job = claimed.job;
        job.attempts += 1;

        let raw = QueuedJob::encode(&job).map_err(|e| AppError::Broker(e.to_string()))?;

        // The successor entry must be durable before the claimed delivery
        // is dropped: a crash between the two commands redelivers the old
        // payload instead of losing the job.
        let disposition = if job.attempts >= self.max_attempts {
            let _: () = conn.lpush(DEAD_KEY, raw).await?;
            RetryDisposition::Buried
        } else {
            let _: () = conn.lpush(PENDING_KEY, raw).await?;
            RetryDisposition::Requeued
        };

        let _: () = conn.lrem(&processing, 1, &claimed.raw).await?;
        let _: () = conn.hdel(CLAIMS_KEY, job.id.to_string()).await?;

        Ok(disposition)
    }

    async fn reclaim_expired(&self) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let claims: std::collections::HashMap<String, String> = conn.hgetall(CLAIMS_KEY).await?;
        let now = Utc::now().timestamp();

        let mut reclaimed = 0;
        for (job_id, raw_record) in claims {
            let Ok(record) = serde_json::from_str::<ClaimRecord>(&raw_record) else {
                let _: () = conn.hdel(CLAIMS_KEY, &job_id).await?;
                continue;
            };

            if now - record.claimed_at < self.lease_secs as i64 {
                continue;
            }

            let processing = Self::processing_key(&record.consumer);
            let removed: i64 = conn.lrem(&processing, 1, &record.payload).await?;
            if removed > 0 {
                // Redelivery, not retry: the attempt counter is untouched.
                let _: () = conn.lpush(PENDING_KEY, &record.payload).await?;
                info!(job_id = %job_id, consumer = %record.consumer, "Reclaimed expired job lease");
                reclaimed += 1;
            }
            let _: () = conn.hdel(CLAIMS_KEY, &job_id).await?;
        }

        // A processing-list entry with no claim record is residue of a
        // consumer that died between claiming the job and registering the
        // claim. Redeliver it; at-least-once tolerates the duplicate if
        // the consumer is actually mid-claim.
        let consumers: Vec<String> = conn.smembers(CONSUMERS_KEY).await?;
        for consumer in consumers {
            let processing = Self::processing_key(&consumer);
            let entries: Vec<String> = conn.lrange(&processing, 0, -1).await?;

            for raw in entries {
                let job_id = QueuedJob::decode(&raw).ok().map(|job| job.id);
                if let Some(id) = job_id {
                    let has_claim: bool = conn.hexists(CLAIMS_KEY, id.to_string()).await?;
                    if has_claim {
                        continue;
                    }
                }

                let removed: i64 = conn.lrem(&processing, 1, &raw).await?;
                if removed == 0 {
                    continue;
                }

                if let Some(id) = job_id {
                    let _: () = conn.lpush(PENDING_KEY, &raw).await?;
                    info!(job_id = %id, consumer = %consumer, "Reclaimed orphaned processing entry");
                    reclaimed += 1;
                } else {
                    warn!(consumer = %consumer, "Dead-lettering undecodable orphaned entry");
                    let _: () = conn.lpush(DEAD_KEY, &raw).await?;
                }
            }
        }

        Ok(reclaimed)
    }
}
