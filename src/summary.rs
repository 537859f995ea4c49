//! Streaming review-summary endpoint.
//!
//! Relay protocol: zero or more `data:` frames as chunks arrive from the
//! generative backend, then exactly one terminal frame (`event: done` or
//! `event: error`), then the connection closes. The relay is a bounded
//! channel: a spawned task pulls backend chunks and pushes frames, the
//! response stream drains the receiver. A client disconnect drops the
//! receiver and the send error stops the task.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

use crate::{
    error::AppError,
    generative::{ChunkStream, SYSTEM_PROMPT},
    models::Review,
    state::AppState,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    pub product_id: Uuid,
}

#[derive(Debug, PartialEq)]
pub enum Frame {
    Data(String),
    Done,
    Error(String),
}

impl Frame {
    fn into_event(self) -> Event {
        match self {
            Frame::Data(text) => Event::default().data(text),
            Frame::Done => Event::default().event("done").data("Summary complete."),
            Frame::Error(message) => Event::default().event("error").data(message),
        }
    }
}

pub async fn stream_review_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let reviews = state.store.reviews_for_product(query.product_id).await?;
    if reviews.is_empty() {
        return Err(AppError::NotFound(
            "No reviews found for this product.".into(),
        ));
    }

    let prompt = build_prompt(&reviews);
    let chunks = state.generative.complete(&prompt).await?;

    let rx = spawn_relay(chunks);
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(frame.into_event()), rx))
    });

    Ok(Sse::new(stream))
}

/// Forwards backend chunks into a bounded channel as frames, closing with
/// exactly one terminal frame. Blank chunks are skipped; everything else
/// is relayed verbatim and in order.
fn spawn_relay(mut chunks: ChunkStream) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        loop {
            match chunks.next().await {
                Some(Ok(text)) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if tx.send(Frame::Data(text)).await.is_err() {
                        // Client disconnected; stop relaying.
                        return;
                    }
                }
                Some(Err(e)) => {
                    error!("Summary stream failed: {e}");
                    let _ = tx.send(Frame::Error("Internal Server Error".into())).await;
                    return;
                }
                None => {
                    let _ = tx.send(Frame::Done).await;
                    return;
                }
            }
        }
    });

    rx
}

/// All reviews for the product concatenated into one prompt context.
fn build_prompt(reviews: &[Review]) -> String {
    let review_text = reviews
        .iter()
        .map(|r| {
            format!(
                "Rating: {}, Comment: {}",
                r.rating.map_or_else(|| "none".to_string(), |v| v.to_string()),
                r.comment.as_deref().unwrap_or("none"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("{SYSTEM_PROMPT}\n\n{review_text}")
}
