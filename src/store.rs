//! Persistence port and its Postgres implementation.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{NewProduct, Product, Review, ReviewJob, ReviewPhoto},
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_product(&self, new: NewProduct) -> Result<Product, AppError>;
    async fn all_products(&self) -> Result<Vec<Product>, AppError>;
    async fn product_by_id(&self, id: Uuid) -> Result<Option<Product>, AppError>;

    async fn find_review(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Review>, AppError>;

    /// Inserts the review carried by a job. A unique-constraint violation
    /// (a concurrent duplicate that raced past the ingress check) surfaces
    /// as [`AppError::DuplicateReview`].
    async fn insert_review(&self, job: &ReviewJob) -> Result<Review, AppError>;

    async fn insert_photos(
        &self,
        review_id: Uuid,
        urls: &[String],
    ) -> Result<Vec<ReviewPhoto>, AppError>;

    async fn reviews_for_product(&self, product_id: Uuid) -> Result<Vec<Review>, AppError>;
    async fn photos_for_review(&self, review_id: Uuid) -> Result<Vec<ReviewPhoto>, AppError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_product(&self, new: NewProduct) -> Result<Product, AppError> {
        let product = sqlx::query_as::<_, Product>(
            "INSERT INTO products (name, description, price)
             VALUES ($1, $2, $3)
             RETURNING id, name, description, price, created_at",
        )
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.price)
        .fetch_one(&self.pool)
        .await?;

        Ok(product)
    }

    async fn all_products(&self) -> Result<Vec<Product>, AppError> {
        let products = sqlx::query_as::<_, Product>(
            "SELECT id, name, description, price, created_at
             FROM products ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    async fn product_by_id(&self, id: Uuid) -> Result<Option<Product>, AppError> {
        let product = sqlx::query_as::<_, Product>(
            "SELECT id, name, description, price, created_at
             FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    async fn find_review(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Review>, AppError> {
        let review = sqlx::query_as::<_, Review>(
            "SELECT id, user_id, product_id, rating, comment, created_at
             FROM reviews WHERE user_id = $1 AND product_id = $2",
        )
        .bind(user_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(review)
    }

    async fn insert_review(&self, job: &ReviewJob) -> Result<Review, AppError> {
        let result = sqlx::query_as::<_, Review>(
            "INSERT INTO reviews (user_id, product_id, rating, comment)
             VALUES ($1, $2, $3, $4)
             RETURNING id, user_id, product_id, rating, comment, created_at",
        )
        .bind(job.user_id)
        .bind(job.product_id)
        .bind(job.rating)
        .bind(&job.comment)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(review) => Ok(review),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(AppError::DuplicateReview)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_photos(
        &self,
        review_id: Uuid,
        urls: &[String],
    ) -> Result<Vec<ReviewPhoto>, AppError> {
        let photos = sqlx::query_as::<_, ReviewPhoto>(
            "INSERT INTO review_photos (review_id, url)
             SELECT $1, url FROM UNNEST($2::text[]) AS t(url)
             RETURNING id, review_id, url, created_at",
        )
        .bind(review_id)
        .bind(urls)
        .fetch_all(&self.pool)
        .await?;

        Ok(photos)
    }

    async fn reviews_for_product(&self, product_id: Uuid) -> Result<Vec<Review>, AppError> {
        let reviews = sqlx::query_as::<_, Review>(
            "SELECT id, user_id, product_id, rating, comment, created_at
             FROM reviews WHERE product_id = $1 ORDER BY created_at",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(reviews)
    }

    async fn photos_for_review(&self, review_id: Uuid) -> Result<Vec<ReviewPhoto>, AppError> {
        let photos = sqlx::query_as::<_, ReviewPhoto>(
            "SELECT id, review_id, url, created_at
             FROM review_photos WHERE review_id = $1 ORDER BY created_at",
        )
        .bind(review_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(photos)
    }
}
