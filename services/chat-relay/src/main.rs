//! Chat relay gateway
//!
//! Single-binary service that:
//! 1. Loads a pool of rotating backend credentials
//! 2. Accepts OpenAI-style chat completion requests
//! 3. Runs each request through retry/failover orchestration
//! 4. Streams responses back over SSE or returns them whole

mod backend_impl;
mod config;
mod error;
mod helper;
mod metrics;
mod orchestrator;
mod stream;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use account_pool::{ChallengeCache, CredentialPool, spawn_sweep_task};
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use backend::ChatRequest;
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::backend_impl::HttpChatBackend;
use crate::config::Config;
use crate::error::RelayError;
use crate::orchestrator::Orchestrator;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    pool: Arc<CredentialPool>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(completion_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting chat-relay");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.relay.listen_addr,
        backend_url = %config.relay.backend_url,
        credentials = config.credentials.tokens.len(),
        challenge_port = config.challenge.port,
        "configuration loaded"
    );

    let client = reqwest::Client::new();
    let pool = Arc::new(CredentialPool::new(config.credentials.tokens.clone()));
    let cache = Arc::new(ChallengeCache::for_port(client.clone(), config.challenge.port));
    let chat_backend: Arc<dyn backend::ChatBackend> = Arc::new(HttpChatBackend::new(
        client,
        config.relay.backend_url.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        cache.clone(),
        chat_backend.clone(),
    ));

    let helper = if config.helper.enabled {
        let helper = helper::HelperProcess::spawn(&config.helper.command, config.challenge.port)
            .context("failed to spawn challenge helper")?;
        Some(helper)
    } else {
        None
    };

    spawn_sweep_task(
        pool.clone(),
        cache,
        chat_backend,
        Duration::from_secs(config.relay.sweep_interval_secs),
    );

    let app_state = AppState {
        orchestrator,
        pool,
        prometheus,
    };
    let app = build_router(app_state, config.relay.max_connections);

    let listener = TcpListener::bind(config.relay.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.relay.listen_addr))?;

    info!(addr = %config.relay.listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(helper) = helper {
        helper.shutdown().await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Chat completion endpoint. Streams over SSE when the request asks for it,
/// otherwise returns the full response as JSON.
async fn completion_handler(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<ChatRequest>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    if request.stream {
        return stream_completion(state, request, request_id).await;
    }

    let started = Instant::now();
    match state.orchestrator.execute(&request, None).await {
        Ok(content) => {
            metrics::record_request(0, started.elapsed().as_secs_f64());
            info!(request_id, model = %request.model, "request completed");
            axum::Json(serde_json::json!({
                "model": request.model,
                "content": content,
            }))
            .into_response()
        }
        Err(err) => {
            metrics::record_request(err.code(), started.elapsed().as_secs_f64());
            error!(request_id, code = err.code(), error = %err, "request failed");
            error_response(&err, &request_id)
        }
    }
}

/// Run the orchestrator in a task feeding an SSE response. Content events
/// arrive as chunks clear the matcher chain; the terminal event ([DONE] or an
/// error object) is appended once the orchestrator finishes, so it always
/// comes after every content event.
async fn stream_completion(state: AppState, request: ChatRequest, request_id: String) -> Response {
    let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel::<String>(64);
    let (result_tx, result_rx) = tokio::sync::oneshot::channel::<Result<String, RelayError>>();

    let orchestrator = state.orchestrator.clone();
    let task_request_id = request_id.clone();
    tokio::spawn(async move {
        let started = Instant::now();
        let result = orchestrator.execute(&request, Some(chunk_tx)).await;
        let code = result.as_ref().map(|_| 0).unwrap_or_else(|e| e.code());
        metrics::record_request(code, started.elapsed().as_secs_f64());
        if let Err(err) = &result {
            error!(request_id = task_request_id, code = err.code(), error = %err, "request failed");
        }
        let _ = result_tx.send(result);
    });

    let content_events = ReceiverStream::new(chunk_rx).map(|chunk| {
        Ok::<_, Infallible>(
            Event::default().data(serde_json::json!({ "content": chunk }).to_string()),
        )
    });

    let tail = futures_util::stream::once(async move {
        let event = match result_rx.await {
            Ok(Ok(_)) | Err(_) => Event::default().data("[DONE]"),
            Ok(Err(err)) => Event::default().data(
                serde_json::json!({
                    "error": {
                        "code": err.code(),
                        "message": err.to_string(),
                        "request_id": request_id,
                    }
                })
                .to_string(),
            ),
        };
        Ok::<_, Infallible>(event)
    });

    Sse::new(content_events.chain(tail)).into_response()
}

fn error_response(err: &RelayError, request_id: &str) -> Response {
    let status = axum::http::StatusCode::from_u16(err.http_status())
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        axum::Json(serde_json::json!({
            "error": {
                "code": err.code(),
                "message": err.to_string(),
                "request_id": request_id,
            }
        })),
    )
        .into_response()
}

/// Pool health summary. Returns 200 while at least one credential is usable
/// or in flight, 503 once the pool is fully disabled.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.pool.health().await;
    let status = if health["status"] == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        health.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
