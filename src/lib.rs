//! Product review backend.
//!
//! Two asynchronous pipelines around a small product API:
//!
//! - **Ingestion**: a review submission is deduplicated against the
//!   database, its photos staged to local disk, and one job pushed onto a
//!   durable Redis queue. A background worker persists the review, uploads
//!   the photos concurrently (failures isolated per photo), persists the
//!   photo records, and acknowledges. Transient failures retry a bounded
//!   number of times before dead-lettering; a lease reaper redelivers jobs
//!   from crashed workers.
//! - **Summary streaming**: on demand, all reviews of a product are folded
//!   into one prompt and the generative backend's token stream is relayed
//!   to the client over a server-sent-events connection, ending in exactly
//!   one `done` or `error` frame.
//!
//! The product listing sits behind a cache-aside Redis snapshot that is
//! invalidated on every product creation.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    routing::{get, post},
    Router,
};

use signal::{
    ctrl_c,
    unix::{signal, SignalKind},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub mod blob;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod generative;
pub mod models;
pub mod queue;
pub mod routes;
pub mod state;
pub mod store;
pub mod summary;
pub mod worker;

#[cfg(test)]
pub mod testing;

use config::Config;
use state::AppState;
use worker::ReviewWorker;

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let config = Config::load();
    let state = AppState::new(config)
        .await
        .expect("Failed to initialize state");

    for n in 0..state.config.worker_count {
        let worker = ReviewWorker::new(
            format!("worker-{n}"),
            state.store.clone(),
            state.queue.clone(),
            state.blobs.clone(),
            Duration::from_millis(state.config.queue_poll_ms),
        );
        tokio::spawn(worker.run());
    }
    tokio::spawn(worker::run_reaper(
        state.queue.clone(),
        Duration::from_secs((state.config.queue_lease_secs / 2).max(1)),
    ));

    info!("Starting server...");

    let address = format!("0.0.0.0:{}", state.config.port);
    let app = app(state);

    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    println!("Server shutting down...");
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/", get(routes::health))
        .route(
            "/api/products",
            get(routes::fetch_all_products).post(routes::create_product),
        )
        // Trailing-slash requests are distinct paths to the router.
        .route(
            "/api/products/",
            get(routes::fetch_all_products).post(routes::create_product),
        )
        .route("/api/products/get-product", get(routes::fetch_product))
        .route(
            "/api/actions/product/{product_id}/review",
            post(routes::post_review),
        )
        .route(
            "/api/actions/product/review-summary",
            get(summary::stream_review_summary),
        )
        .layer(DefaultBodyLimit::max(30 * 1024 * 1024))
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
