//! Review worker: consumes queued review jobs, persists the review,
//! uploads photos, persists the photo records, then acknowledges.
//!
//! Per-job state machine with failure exits at each stage:
//! - review insert hitting the unique constraint is permanent (a
//!   concurrent duplicate won the race; nothing was created, so the job
//!   is acknowledged as failed and never retried);
//! - photo uploads fan out concurrently and fail independently, the
//!   review persists even if some or all uploads fail;
//! - anything else is transient and goes through the queue's bounded
//!   retry before dead-lettering.
//!
//! Outcomes are only observable through logs; the original HTTP caller
//! got its 202 long ago.

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    blob::BlobStore,
    error::AppError,
    models::{Review, ReviewJob},
    queue::{ClaimedJob, JobQueue, RetryDisposition},
    store::Store,
};

pub struct ReviewWorker {
    consumer: String,
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    blobs: Arc<dyn BlobStore>,
    poll: Duration,
}

impl ReviewWorker {
    pub fn new(
        consumer: String,
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        blobs: Arc<dyn BlobStore>,
        poll: Duration,
    ) -> Self {
        Self {
            consumer,
            store,
            queue,
            blobs,
            poll,
        }
    }

    pub async fn run(self) {
        info!(consumer = %self.consumer, "Review worker ready");

        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll).await,
                Err(e) => {
                    error!(consumer = %self.consumer, "Queue claim failed: {e}");
                    sleep(self.poll).await;
                }
            }
        }
    }

    /// Claims and handles at most one job. Returns whether one was
    /// processed.
    pub async fn tick(&self) -> Result<bool, AppError> {
        let Some(claimed) = self.queue.claim(&self.consumer).await? else {
            return Ok(false);
        };

        self.handle(claimed).await;
        Ok(true)
    }

    async fn handle(&self, claimed: ClaimedJob) {
        let job_id = claimed.job.id;

        match self.process(&claimed.job).await {
            Ok((review, photo_count)) => {
                if let Err(e) = self.queue.ack(&claimed).await {
                    error!(job_id = %job_id, "Failed to acknowledge completed job: {e}");
                    return;
                }
                remove_staged(&claimed.job.photo_paths).await;
                info!(
                    job_id = %job_id,
                    review_id = %review.id,
                    photos = photo_count,
                    "Job completed"
                );
            }
            Err(e) if e.is_permanent() => {
                warn!(job_id = %job_id, "Job failed permanently, not retrying: {e}");
                if let Err(e) = self.queue.ack(&claimed).await {
                    error!(job_id = %job_id, "Failed to acknowledge failed job: {e}");
                    return;
                }
                remove_staged(&claimed.job.photo_paths).await;
            }
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    attempts = claimed.job.attempts,
                    "Job failed: {e}"
                );
                match self.queue.retry_or_bury(claimed).await {
                    Ok(RetryDisposition::Requeued) => {}
                    Ok(RetryDisposition::Buried) => {
                        error!(job_id = %job_id, "Job exhausted retry budget, dead-lettered");
                    }
                    Err(e) => {
                        // The lease reaper redelivers it eventually.
                        error!(job_id = %job_id, "Failed to hand job back to the queue: {e}");
                    }
                }
            }
        }
    }

    async fn process(&self, job: &ReviewJob) -> Result<(Review, usize), AppError> {
        let review = self.store.insert_review(job).await?;

        let urls = self.upload_photos(job).await;
        let photos = if urls.is_empty() {
            Vec::new()
        } else {
            self.store.insert_photos(review.id, &urls).await?
        };

        Ok((review, photos.len()))
    }

    /// Uploads all staged photos concurrently. Failures are isolated per
    /// photo: a failed upload is logged and its photo omitted.
    async fn upload_photos(&self, job: &ReviewJob) -> Vec<String> {
        let uploads = job.photo_paths.iter().enumerate().map(|(index, path)| {
            let blobs = Arc::clone(&self.blobs);
            let upload_key = format!("{}-{}", job.id, index);
            let path = PathBuf::from(path);
            async move { (index, blobs.upload(&path, &upload_key).await) }
        });

        let mut urls = Vec::new();
        for (index, result) in join_all(uploads).await {
            match result {
                Ok(url) => urls.push(url),
                Err(e) => {
                    warn!(job_id = %job.id, photo_index = index, "Photo upload failed, omitting photo: {e}");
                }
            }
        }
        urls
    }
}

/// Periodically returns jobs with expired leases to the pending list.
pub async fn run_reaper(queue: Arc<dyn JobQueue>, interval: Duration) {
    loop {
        if let Err(e) = queue.reclaim_expired().await {
            error!("Lease reclaim sweep failed: {e}");
        }
        sleep(interval).await;
    }
}

async fn remove_staged(paths: &[String]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!(path = %path, "Failed to remove staged file: {e}");
        }
    }
}
