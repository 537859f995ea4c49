//! Cache-aside layer for the product listing.
//!
//! One fixed key holds the serialized list of all products for up to an
//! hour. Product creation deletes the key before the creation response is
//! returned, so the next read recomputes the snapshot. A reader racing the
//! gap between insert and delete may see one stale read; that window is
//! accepted.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::warn;

use crate::{error::AppError, models::Product, store::Store};

pub const ALL_PRODUCTS_CACHE_KEY: &str = "all_products";
pub const CACHE_TTL_SECS: u64 = 3600;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), AppError>;
    async fn del(&self, key: &str) -> Result<(), AppError>;
}

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

/// Returns the product listing, reading through to the store on a cache
/// miss. Cache errors are logged and degrade to the store; the snapshot is
/// a disposable derived view and must never take down the read path.
pub async fn cached_products(
    cache: &dyn Cache,
    store: &dyn Store,
) -> Result<Vec<Product>, AppError> {
    match cache.get(ALL_PRODUCTS_CACHE_KEY).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(products) => return Ok(products),
            Err(e) => warn!("Discarding unreadable product cache entry: {e}"),
        },
        Ok(None) => {}
        Err(e) => warn!("Product cache read failed: {e}"),
    }

    let products = store.all_products().await?;

    if let Ok(raw) = serde_json::to_string(&products) {
        if let Err(e) = cache
            .set_ex(ALL_PRODUCTS_CACHE_KEY, &raw, CACHE_TTL_SECS)
            .await
        {
            warn!("Product cache write failed: {e}");
        }
    }

    Ok(products)
}

/// Drops the cached snapshot. Called synchronously after a successful
/// product creation, before the 201 goes out.
pub async fn invalidate_products(cache: &dyn Cache) -> Result<(), AppError> {
    cache.del(ALL_PRODUCTS_CACHE_KEY).await
}
