//!
//! wikipath HTTP server
//! --------------------
//! Axum surface over the search engine:
//! - POST `/find-path-stream` runs a search and streams its events as SSE.
//! - GET `/autocomplete` proxies upstream prefix suggestions.
//! - GET `/history` returns recent search records.
//! - GET `/cache/stats` exposes cache and upstream counters.
//!
//! Startup wires the shared capabilities (store, cache, upstream client)
//! into the router state, warms the cache from the durable tier and spawns
//! the background segment flusher and compaction ticker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::cache::{SegmentCache, FLUSH_INTERVAL_MS, FLUSH_MAX_PENDING};
use crate::config::Config;
use crate::error::AppError;
use crate::events::{sse_frames, EventSink};
use crate::search::{SearchEngine, SearchRequest};
use crate::storage::SharedStore;
use crate::upstream::{LinkSource, WikiClient};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub cache: Arc<SegmentCache>,
    pub client: Arc<WikiClient>,
}

/// Start the wikipath HTTP server with the given configuration: open the
/// store, warm the cache, spawn background maintenance and mount all routes.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let store = SharedStore::new(&config.data_dir)
        .with_context(|| format!("opening data directory {}", config.data_dir))?;
    let cache = Arc::new(SegmentCache::new(store.clone(), config.cache_capacity));
    let warmed = cache.warm(config.cache_capacity);
    info!(target: "wikipath", "segment cache warmed with {} durable entries", warmed);

    let client = Arc::new(WikiClient::new(&config).context("building upstream client")?);

    // Background segment flusher: batch durable writes every 500ms or at
    // 256 pending entries, whichever comes first.
    {
        let cache = cache.clone();
        tokio::spawn(async move {
            let mut last_flush = Instant::now();
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let pending = cache.pending_len();
                let interval_due = last_flush.elapsed() >= Duration::from_millis(FLUSH_INTERVAL_MS);
                if pending >= FLUSH_MAX_PENDING || (interval_due && pending > 0) {
                    match cache.flush_pending() {
                        Ok(n) if n > 0 => debug!(target: "wikipath::cache", "flushed {} segments", n),
                        Ok(_) => {}
                        Err(e) => warn!(target: "wikipath::cache", "segment flush failed: {}", e),
                    }
                    last_flush = Instant::now();
                }
            }
        });
    }

    // Background durable-tier compaction ticker; interval in seconds,
    // 0 or negative disables it.
    {
        let cache = cache.clone();
        let config = config.clone();
        let interval_sec: i64 = std::env::var("WIKIPATH_COMPACT_INTERVAL_SEC")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(3600);
        if interval_sec > 0 {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(interval_sec as u64)).await;
                    match cache.compact_durable(config.cache_ttl_days, config.cache_capacity) {
                        Ok(n) if n > 0 => info!(target: "wikipath::cache", "compaction removed {} stale segments", n),
                        Ok(_) => {}
                        Err(e) => warn!(target: "wikipath::cache", "compaction failed: {}", e),
                    }
                }
            });
        } else {
            info!(target: "wikipath", "durable-tier compaction ticker disabled");
        }
    }

    let app_state = AppState {
        config: config.clone(),
        store,
        cache: cache.clone(),
        client,
    };

    let app = Router::new()
        .route("/", get(|| async { "wikipath ok" }))
        .route("/find-path-stream", post(find_path_stream))
        .route("/autocomplete", get(autocomplete))
        .route("/history", get(history))
        .route("/cache/stats", get(cache_stats))
        .with_state(app_state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Do not lose queued durable writes on the way out.
    match cache.flush_pending() {
        Ok(n) if n > 0 => info!(target: "wikipath", "flushed {} segments at shutdown", n),
        Ok(_) => {}
        Err(e) => warn!(target: "wikipath", "shutdown flush failed: {}", e),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
}

fn error_response(err: &AppError) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({"status": "error", "code": err.kind_str(), "message": err.message()})),
    )
}

/// Run a search and stream its events. The response ends after `complete`
/// or `error`; closing the connection cancels the search.
async fn find_path_stream(State(state): State<AppState>, Json(req): Json<SearchRequest>) -> impl IntoResponse {
    let (sink, rx) = EventSink::channel();
    let source: Arc<dyn LinkSource> = state.client.clone();
    let engine = SearchEngine::new(source, state.cache.clone(), state.store.clone(), state.config.clone());
    tokio::spawn(async move {
        engine.run(req, sink).await;
    });
    Sse::new(sse_frames(rx))
}

#[derive(Debug, Deserialize)]
struct AutocompleteParams {
    q: String,
    limit: Option<usize>,
}

async fn autocomplete(State(state): State<AppState>, Query(params): Query<AutocompleteParams>) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(10).clamp(1, 50);
    match state.client.autocomplete(&params.q, limit).await {
        Ok(titles) => (StatusCode::OK, Json(json!({"status": "ok", "titles": titles}))),
        Err(e) => {
            error!("autocomplete failed: {e}");
            error_response(&e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn history(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let records = {
        let store = state.store.0.lock();
        store.recent_records(limit)
    };
    match records {
        Ok(records) => (StatusCode::OK, Json(json!({"status": "ok", "records": records}))),
        Err(e) => {
            error!("history read failed: {e}");
            error_response(&AppError::internal(e.to_string()))
        }
    }
}

async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.cache.stats();
    let upstream = state.client.stats();
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "cache": cache, "upstream": upstream})),
    )
}
