//! HTTP handlers for products and review ingestion.

use std::{path::PathBuf, sync::Arc};

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Multipart, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation as JwtValidation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    cache::{cached_products, invalidate_products},
    error::AppError,
    models::{NewProduct, Product, Review, ReviewJob, ReviewPhoto},
    state::AppState,
};

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "OK" }))
}

/// The authenticated caller, pulled from the bearer JWT. Token issuance
/// lives in the user service; this only validates and reads the claims.
pub struct AuthUser {
    pub id: Uuid,
}

#[derive(Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AppError::Auth)?;
        let token = header.strip_prefix("Bearer ").unwrap_or(header);

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
            &JwtValidation::new(Algorithm::HS256),
        )
        .map_err(|_| AppError::Auth)?;

        Ok(AuthUser {
            id: data.claims.sub,
        })
    }
}

struct ReviewForm {
    rating: Option<i32>,
    comment: Option<String>,
    photos: Vec<(Option<String>, Bytes)>,
}

/// Accepts a review submission: validates, checks for an existing
/// (user, product) review, stages the photos, enqueues one job, and
/// acknowledges with 202. Persistence and uploads happen in the worker;
/// the caller never waits for them.
pub async fn post_review(
    State(state): State<Arc<AppState>>,
    AuthUser { id: user_id }: AuthUser,
    Path(product_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let form = read_review_form(multipart).await?;

    if let Some(rating) = form.rating {
        if !(1..=5).contains(&rating) {
            return Err(AppError::Validation(
                "rating must be between 1 and 5".into(),
            ));
        }
    }
    let has_comment = form
        .comment
        .as_deref()
        .is_some_and(|c| !c.trim().is_empty());
    if form.rating.is_none() && !has_comment {
        return Err(AppError::Validation("rating or comment is required".into()));
    }

    if state
        .store
        .find_review(user_id, product_id)
        .await?
        .is_some()
    {
        return Err(AppError::DuplicateReview);
    }

    // No side effect until the dedup check has passed.
    let mut photo_paths = Vec::with_capacity(form.photos.len());
    for (file_name, bytes) in form.photos {
        photo_paths.push(stage_photo(&state.config.staging_dir, file_name, bytes).await?);
    }

    let job = ReviewJob::new(
        user_id,
        product_id,
        form.rating,
        form.comment.filter(|_| has_comment),
        photo_paths.clone(),
    );

    if let Err(e) = state.queue.enqueue(&job).await {
        // Surface broker failures synchronously; drop the staging leftovers.
        for path in &photo_paths {
            let _ = tokio::fs::remove_file(path).await;
        }
        return Err(e);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Review added" })),
    ))
}

async fn read_review_form(mut multipart: Multipart) -> Result<ReviewForm, AppError> {
    let mut form = ReviewForm {
        rating: None,
        comment: None,
        photos: Vec::new(),
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "rating" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                form.rating = Some(text.trim().parse().map_err(|_| {
                    AppError::Validation("rating must be an integer".into())
                })?);
            }
            "comment" => {
                form.comment = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::Validation(e.to_string()))?,
                );
            }
            "photos" => {
                let file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                form.photos.push((file_name, bytes));
            }
            _ => {}
        }
    }

    Ok(form)
}

/// Writes one uploaded photo to transient local storage for the worker.
async fn stage_photo(
    staging_dir: &str,
    file_name: Option<String>,
    bytes: Bytes,
) -> Result<String, AppError> {
    let extension = file_name
        .as_deref()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| format!(".{ext}"))
        .unwrap_or_default();

    let path = PathBuf::from(staging_dir).join(format!("{}{}", Uuid::new_v4(), extension));
    tokio::fs::write(&path, &bytes).await?;

    Ok(path.to_string_lossy().into_owned())
}

pub async fn fetch_all_products(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Product>>, AppError> {
    let products = cached_products(state.cache.as_ref(), state.store.as_ref()).await?;
    Ok(Json(products))
}

pub async fn create_product(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewProduct>,
) -> Result<impl IntoResponse, AppError> {
    if new.name.trim().is_empty() {
        return Err(AppError::Validation("name is required".into()));
    }
    if new.price <= 0.0 {
        return Err(AppError::Validation("price must be positive".into()));
    }

    let product = state.store.create_product(new).await?;

    // Invalidate before responding, so a follow-up read recomputes.
    invalidate_products(state.cache.as_ref()).await?;

    Ok((StatusCode::CREATED, Json(product)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductQuery {
    pub product_id: Uuid,
}

#[derive(Serialize)]
pub struct ProductDetail {
    #[serde(flatten)]
    pub product: Product,
    pub reviews: Vec<ReviewDetail>,
}

#[derive(Serialize)]
pub struct ReviewDetail {
    #[serde(flatten)]
    pub review: Review,
    pub photos: Vec<ReviewPhoto>,
}

pub async fn fetch_product(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProductQuery>,
) -> Result<Json<ProductDetail>, AppError> {
    let product = state
        .store
        .product_by_id(query.product_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Product not found.".into()))?;

    let mut reviews = Vec::new();
    for review in state.store.reviews_for_product(product.id).await? {
        let photos = state.store.photos_for_review(review.id).await?;
        reviews.push(ReviewDetail { review, photos });
    }

    Ok(Json(ProductDetail { product, reviews }))
}
