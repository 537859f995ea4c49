use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A product that can be reviewed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
}

/// A user's review of a product. At most one per (user, product), ever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    /// 1-5 stars.
    pub rating: Option<i32>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A photo attached to a review. Only ever created after a successful
/// blob upload, and only for an already-persisted review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPhoto {
    pub id: Uuid,
    pub review_id: Uuid,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// One unit of deferred review-processing work. Lives on the queue from
/// enqueue until acknowledged; carries everything the worker needs so no
/// request state has to be re-queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub rating: Option<i32>,
    pub comment: Option<String>,
    /// Local paths of staged photo files.
    pub photo_paths: Vec<String>,
    /// Delivery attempts so far. Incremented on each transient failure.
    pub attempts: u32,
}

impl ReviewJob {
    pub fn new(
        user_id: Uuid,
        product_id: Uuid,
        rating: Option<i32>,
        comment: Option<String>,
        photo_paths: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            product_id,
            rating,
            comment,
            photo_paths,
            attempts: 0,
        }
    }
}

/// Versioned wire form of a queued job. Unknown versions fail to decode
/// and are dead-lettered rather than crashing a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum QueuedJob {
    #[serde(rename = "1")]
    V1(ReviewJob),
}

impl QueuedJob {
    pub fn encode(job: &ReviewJob) -> Result<String, serde_json::Error> {
        serde_json::to_string(&QueuedJob::V1(job.clone()))
    }

    pub fn decode(raw: &str) -> Result<ReviewJob, serde_json::Error> {
        let QueuedJob::V1(job) = serde_json::from_str(raw)?;
        Ok(job)
    }
}
