use std::sync::Arc;

use crate::{
    blob::{BlobStore, HttpBlobStore},
    cache::{Cache, RedisCache},
    config::Config,
    database::{init_postgres, init_redis},
    error::AppError,
    generative::{GeminiBackend, GenerativeBackend},
    queue::{JobQueue, RedisQueue},
    store::{PgStore, Store},
};

/// Shared application state. Every collaborator is an explicitly
/// constructed dependency behind a trait object, so handlers, the worker
/// and tests all receive the same shape.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub queue: Arc<dyn JobQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub generative: Arc<dyn GenerativeBackend>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>, AppError> {
        let pool = init_postgres(&config.database_url).await?;
        let redis = init_redis(&config.redis_url).await?;

        tokio::fs::create_dir_all(&config.staging_dir).await?;

        let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
        let cache: Arc<dyn Cache> = Arc::new(RedisCache::new(redis.clone()));
        let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
            redis,
            config.queue_max_attempts,
            config.queue_lease_secs,
        ));
        let blobs: Arc<dyn BlobStore> = Arc::new(HttpBlobStore::new(
            config.blob_upload_url.clone(),
            config.blob_folder.clone(),
        ));
        let generative: Arc<dyn GenerativeBackend> = Arc::new(GeminiBackend::new(
            config.generative_url.clone(),
            config.generative_key.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            cache,
            queue,
            blobs,
            generative,
        }))
    }
}
