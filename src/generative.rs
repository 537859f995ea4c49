//! Generative backend port: one prompt in, an asynchronous sequence of
//! text chunks out. The production implementation streams a Gemini-style
//! `streamGenerateContent` endpoint.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use serde_json::{json, Value};

use crate::error::AppError;

pub type ChunkStream = BoxStream<'static, Result<String, AppError>>;

#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<ChunkStream, AppError>;
}

pub const SYSTEM_PROMPT: &str = "\
You are a professional AI assistant that summarizes user reviews and extracts common themes.

Your task:
- Provide a concise and insightful summary of the overall sentiment and key points from the reviews.
- Generate relevant hashtags (tags) based on recurring words, emotions, or features mentioned in the reviews.

Output format:
- Use complete **Markdown format** that is clean, well-structured, and easy to read.
- Ensure line breaks between sections for readability.

Example:
Input: \"The product is great, I love it! The quality is amazing and the service was excellent. The delivery was fast and the packaging was perfect. I will definitely buy again and recommend it to my friends.\"

**Summary:**
\"Great product with outstanding quality and excellent service. Fast delivery and secure packaging. Highly recommended!\"

**Tags:**
#greatproduct #amazingquality #excellentservice #fastdelivery #securepackaging #highlyrecommended";

pub struct GeminiBackend {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl GeminiBackend {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            api_key,
        }
    }
}

#[async_trait]
impl GenerativeBackend for GeminiBackend {
    async fn complete(&self, prompt: &str) -> Result<ChunkStream, AppError> {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
        });

        let response = self
            .http
            .post(&self.url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Generative(e.to_string()))?
            .error_for_status()
            .map_err(|e| AppError::Generative(e.to_string()))?;

        let inner = response
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();

        let decoder = SseDecoder {
            inner,
            buf: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        Ok(stream::unfold(decoder, |mut d| async move {
            loop {
                if let Some(text) = d.pending.pop_front() {
                    return Some((Ok(text), d));
                }
                if d.done {
                    return None;
                }
                match d.inner.next().await {
                    Some(Ok(bytes)) => {
                        d.buf.push_str(&String::from_utf8_lossy(&bytes));
                        d.drain_lines();
                    }
                    Some(Err(e)) => {
                        d.done = true;
                        return Some((Err(AppError::Generative(e)), d));
                    }
                    None => d.done = true,
                }
            }
        })
        .boxed())
    }
}

struct SseDecoder {
    inner: BoxStream<'static, Result<Vec<u8>, String>>,
    buf: String,
    pending: VecDeque<String>,
    done: bool,
}

impl SseDecoder {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim().to_string();
            self.buf.drain(..=pos);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            if let Some(text) = extract_text(data) {
                self.pending.push_back(text);
            }
        }
    }
}

/// Pulls the generated text out of one streamed response event.
fn extract_text(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    let parts = value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();

    (!text.is_empty()).then_some(text)
}
