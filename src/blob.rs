//! Blob storage port: takes a staged local file, returns a durable public
//! URL. The production implementation posts to a Cloudinary-style upload
//! endpoint.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::AppError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads one file. `upload_key` is deterministic per job and file
    /// index, so a redelivered job overwrites the same blob instead of
    /// orphaning a new one.
    async fn upload(&self, local_path: &Path, upload_key: &str) -> Result<String, AppError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: String,
}

pub struct HttpBlobStore {
    http: reqwest::Client,
    upload_url: String,
    folder: String,
}

impl HttpBlobStore {
    pub fn new(upload_url: String, folder: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            upload_url,
            folder,
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, local_path: &Path, upload_key: &str) -> Result<String, AppError> {
        let bytes = tokio::fs::read(local_path).await?;
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| upload_key.to_string());

        let form = reqwest::multipart::Form::new()
            .text("folder", self.folder.clone())
            .text("public_id", upload_key.to_string())
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let response = self
            .http
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::Upload(e.to_string()))?
            .error_for_status()
            .map_err(|e| AppError::Upload(e.to_string()))?;

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upload(e.to_string()))?;

        Ok(body.secure_url)
    }
}
