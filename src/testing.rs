//! In-memory fakes for the collaborator ports, used by unit tests across
//! the crate. The queue fake speaks the same encoded-payload protocol as
//! the Redis implementation so payload versioning and attempt counting
//! behave identically.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    blob::BlobStore,
    cache::Cache,
    config::Config,
    error::AppError,
    generative::{ChunkStream, GenerativeBackend},
    models::{NewProduct, Product, QueuedJob, Review, ReviewJob, ReviewPhoto},
    queue::{ClaimedJob, JobQueue, RetryDisposition},
    state::AppState,
    store::Store,
};

#[derive(Default)]
pub struct MemoryStore {
    products: Mutex<Vec<Product>>,
    reviews: Mutex<Vec<Review>>,
    photos: Mutex<Vec<ReviewPhoto>>,
    fail_review_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent review insert fail with a transient error.
    pub fn fail_review_inserts(&self) {
        self.fail_review_inserts.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_product(&self, new: NewProduct) -> Result<Product, AppError> {
        let product = Product {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            price: new.price,
            created_at: Utc::now(),
        };
        self.products.lock().unwrap().push(product.clone());
        Ok(product)
    }

    async fn all_products(&self) -> Result<Vec<Product>, AppError> {
        Ok(self.products.lock().unwrap().clone())
    }

    async fn product_by_id(&self, id: Uuid) -> Result<Option<Product>, AppError> {
        Ok(self
            .products
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn find_review(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Review>, AppError> {
        Ok(self
            .reviews
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.user_id == user_id && r.product_id == product_id)
            .cloned())
    }

    async fn insert_review(&self, job: &ReviewJob) -> Result<Review, AppError> {
        if self.fail_review_inserts.load(Ordering::SeqCst) {
            return Err(AppError::Internal("simulated store outage".into()));
        }

        let mut reviews = self.reviews.lock().unwrap();
        if reviews
            .iter()
            .any(|r| r.user_id == job.user_id && r.product_id == job.product_id)
        {
            return Err(AppError::DuplicateReview);
        }

        let review = Review {
            id: Uuid::new_v4(),
            user_id: job.user_id,
            product_id: job.product_id,
            rating: job.rating,
            comment: job.comment.clone(),
            created_at: Utc::now(),
        };
        reviews.push(review.clone());
        Ok(review)
    }

    async fn insert_photos(
        &self,
        review_id: Uuid,
        urls: &[String],
    ) -> Result<Vec<ReviewPhoto>, AppError> {
        let inserted: Vec<ReviewPhoto> = urls
            .iter()
            .map(|url| ReviewPhoto {
                id: Uuid::new_v4(),
                review_id,
                url: url.clone(),
                created_at: Utc::now(),
            })
            .collect();
        self.photos.lock().unwrap().extend(inserted.clone());
        Ok(inserted)
    }

    async fn reviews_for_product(&self, product_id: Uuid) -> Result<Vec<Review>, AppError> {
        Ok(self
            .reviews
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn photos_for_review(&self, review_id: Uuid) -> Result<Vec<ReviewPhoto>, AppError> {
        Ok(self
            .photos
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.review_id == review_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, _ttl_secs: u64) -> Result<(), AppError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), AppError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

struct ClaimEntry {
    consumer: String,
    claimed_at: i64,
    payload: String,
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<String>,
    processing: HashMap<String, Vec<String>>,
    dead: Vec<String>,
    claims: HashMap<Uuid, ClaimEntry>,
}

pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    max_attempts: u32,
    lease_secs: u64,
    fail_enqueue: AtomicBool,
}

impl MemoryQueue {
    pub fn new(max_attempts: u32, lease_secs: u64) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_attempts,
            lease_secs,
            fail_enqueue: AtomicBool::new(false),
        }
    }

    pub fn fail_enqueues(&self) {
        self.fail_enqueue.store(true, Ordering::SeqCst);
    }

    pub fn push_raw(&self, raw: &str) {
        self.inner
            .lock()
            .unwrap()
            .pending
            .push_front(raw.to_string());
    }

    /// Plants a processing-list entry with no claim record, as left behind
    /// by a consumer that died right after claiming.
    pub fn push_processing_orphan(&self, consumer: &str, raw: &str) {
        self.inner
            .lock()
            .unwrap()
            .processing
            .entry(consumer.to_string())
            .or_default()
            .push(raw.to_string());
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn dead_len(&self) -> usize {
        self.inner.lock().unwrap().dead.len()
    }

    pub fn pending_jobs(&self) -> Vec<ReviewJob> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .iter()
            .filter_map(|raw| QueuedJob::decode(raw).ok())
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &ReviewJob) -> Result<(), AppError> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(AppError::Broker("broker unavailable".into()));
        }
        let raw = QueuedJob::encode(job).map_err(|e| AppError::Broker(e.to_string()))?;
        self.inner.lock().unwrap().pending.push_front(raw);
        Ok(())
    }

    async fn claim(&self, consumer: &str) -> Result<Option<ClaimedJob>, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(raw) = inner.pending.pop_back() else {
            return Ok(None);
        };

        let job = match QueuedJob::decode(&raw) {
            Ok(job) => job,
            Err(_) => {
                inner.dead.push(raw);
                return Ok(None);
            }
        };

        inner
            .processing
            .entry(consumer.to_string())
            .or_default()
            .push(raw.clone());
        inner.claims.insert(
            job.id,
            ClaimEntry {
                consumer: consumer.to_string(),
                claimed_at: Utc::now().timestamp(),
                payload: raw.clone(),
            },
        );

        Ok(Some(ClaimedJob {
            job,
            raw,
            consumer: consumer.to_string(),
        }))
    }

    async fn ack(&self, claimed: &ClaimedJob) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entries) = inner.processing.get_mut(&claimed.consumer) {
            if let Some(pos) = entries.iter().position(|raw| raw == &claimed.raw) {
                entries.remove(pos);
            }
        }
        inner.claims.remove(&claimed.job.id);
        Ok(())
    }

    async fn retry_or_bury(&self, claimed: ClaimedJob) -> Result<RetryDisposition, AppError> {
        let mut job = claimed.job.clone();
        job.attempts += 1;
        let raw = QueuedJob::encode(&job).map_err(|e| AppError::Broker(e.to_string()))?;

        // Successor before removal, same ordering as the Redis queue.
        let disposition = {
            let mut inner = self.inner.lock().unwrap();
            if job.attempts >= self.max_attempts {
                inner.dead.push(raw);
                RetryDisposition::Buried
            } else {
                inner.pending.push_front(raw);
                RetryDisposition::Requeued
            }
        };
        self.ack(&claimed).await?;
        Ok(disposition)
    }

    async fn reclaim_expired(&self) -> Result<usize, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now().timestamp();
        let lease = self.lease_secs as i64;

        let expired: Vec<Uuid> = inner
            .claims
            .iter()
            .filter(|(_, entry)| now - entry.claimed_at >= lease)
            .map(|(id, _)| *id)
            .collect();

        let mut reclaimed = 0;
        for id in expired {
            let Some(entry) = inner.claims.remove(&id) else {
                continue;
            };
            if let Some(entries) = inner.processing.get_mut(&entry.consumer) {
                if let Some(pos) = entries.iter().position(|raw| raw == &entry.payload) {
                    entries.remove(pos);
                    inner.pending.push_front(entry.payload);
                    reclaimed += 1;
                }
            }
        }

        // Claim-less processing entries, same sweep as the Redis queue.
        let consumers: Vec<String> = inner.processing.keys().cloned().collect();
        for consumer in consumers {
            let entries = inner.processing.get(&consumer).cloned().unwrap_or_default();
            for raw in entries {
                let job_id = QueuedJob::decode(&raw).ok().map(|job| job.id);
                if let Some(id) = job_id {
                    if inner.claims.contains_key(&id) {
                        continue;
                    }
                }

                if let Some(list) = inner.processing.get_mut(&consumer) {
                    if let Some(pos) = list.iter().position(|r| r == &raw) {
                        list.remove(pos);
                    }
                }
                if job_id.is_some() {
                    inner.pending.push_front(raw);
                    reclaimed += 1;
                } else {
                    inner.dead.push(raw);
                }
            }
        }

        Ok(reclaimed)
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    pub uploads: Mutex<Vec<(PathBuf, String)>>,
    failing: Mutex<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes uploads for this exact local path fail.
    pub fn fail_path(&self, path: &str) {
        self.failing.lock().unwrap().push(path.to_string());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, local_path: &Path, upload_key: &str) -> Result<String, AppError> {
        let path_str = local_path.to_string_lossy().into_owned();
        if self.failing.lock().unwrap().contains(&path_str) {
            return Err(AppError::Upload("simulated upload failure".into()));
        }

        let url = format!("https://blobs.test/{upload_key}");
        self.uploads
            .lock()
            .unwrap()
            .push((local_path.to_path_buf(), url.clone()));
        Ok(url)
    }
}

pub struct ScriptedBackend {
    chunks: Vec<Result<String, String>>,
    fail_on_connect: bool,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(chunks: Vec<Result<String, String>>) -> Self {
        Self {
            chunks,
            fail_on_connect: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on_connect() -> Self {
        Self {
            chunks: Vec::new(),
            fail_on_connect: true,
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    async fn complete(&self, prompt: &str) -> Result<ChunkStream, AppError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail_on_connect {
            return Err(AppError::Generative("simulated connect failure".into()));
        }

        let items: Vec<Result<String, AppError>> = self
            .chunks
            .iter()
            .cloned()
            .map(|r| r.map_err(AppError::Generative))
            .collect();
        Ok(stream::iter(items).boxed())
    }
}

/// Full application state over in-memory fakes, for router-level tests.
pub struct TestHarness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub queue: Arc<MemoryQueue>,
    pub blobs: Arc<MemoryBlobStore>,
    pub generative: Arc<ScriptedBackend>,
    pub staging: TempDir,
}

pub fn test_harness(generative: ScriptedBackend) -> TestHarness {
    let staging = tempfile::tempdir().unwrap();
    let config = Config {
        port: 0,
        database_url: String::new(),
        redis_url: String::new(),
        staging_dir: staging.path().to_string_lossy().into_owned(),
        jwt_secret: "test-secret".into(),
        blob_upload_url: String::new(),
        blob_folder: "reviews".into(),
        generative_url: String::new(),
        generative_key: String::new(),
        queue_max_attempts: 3,
        queue_lease_secs: 60,
        queue_poll_ms: 10,
        worker_count: 1,
    };

    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let queue = Arc::new(MemoryQueue::new(
        config.queue_max_attempts,
        config.queue_lease_secs,
    ));
    let blobs = Arc::new(MemoryBlobStore::new());
    let generative = Arc::new(generative);

    let state = Arc::new(AppState {
        config,
        store: store.clone(),
        cache: cache.clone(),
        queue: queue.clone(),
        blobs: blobs.clone(),
        generative: generative.clone(),
    });

    TestHarness {
        state,
        store,
        cache,
        queue,
        blobs,
        generative,
        staging,
    }
}
