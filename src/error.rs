use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized")]
    Auth,

    #[error("You have already reviewed this product.")]
    DuplicateReview,

    #[error("{0}")]
    NotFound(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Generative backend error: {0}")]
    Generative(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Validation(_) | AppError::DuplicateReview => StatusCode::BAD_REQUEST,
            AppError::Auth => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // 5xx details go to the logs, not the client.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("{self}");
            "Internal Server Error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl AppError {
    /// Whether a worker-side failure should be retried by the queue.
    /// A duplicate review means a concurrent submission already won the
    /// race; retrying can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AppError::DuplicateReview | AppError::Validation(_))
    }
}
