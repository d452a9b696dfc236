//! Farm Session Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads the signed-in session from the local session file
//! 2. Listens for incoming requests
//! 3. Forwards them to the farm backend with the session's access token
//! 4. Refreshes the token once for every request that hit the same expiry,
//!    and ends the session when it cannot be refreshed

mod config;
mod metrics;
mod proxy;
mod session;

use anyhow::{Context, Result};
use auth_client::{AuthClient, Navigator};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use session_auth::FileCredentialStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::proxy::ProxyState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters surfaced on `/health`
#[derive(Clone)]
struct GatewayStats {
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    teardowns_total: Arc<AtomicU64>,
    started_at: Instant,
}

impl GatewayStats {
    fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            teardowns_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// A headless gateway has nowhere to navigate; callers learn about the
/// redirect from the `session_expired` response instead.
struct GatewayNavigator {
    teardowns_total: Arc<AtomicU64>,
}

impl Navigator for GatewayNavigator {
    fn redirect(&self, route: &str) {
        self.teardowns_total.fetch_add(1, Ordering::Relaxed);
        info!(route, "session ended, callers will be sent to entry route");
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    stats: GatewayStats,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrent in-flight requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let client = state.proxy.client.clone();
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
        .merge(session::build_session_router(client))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

/// Wire the client, its navigator, and the counters together.
fn build_state(
    client_config: auth_client::ClientConfig,
    store: Arc<dyn session_auth::CredentialStore>,
    prometheus: PrometheusHandle,
) -> Result<AppState> {
    let stats = GatewayStats::new();
    let navigator = Arc::new(GatewayNavigator {
        teardowns_total: stats.teardowns_total.clone(),
    });
    let client = AuthClient::new(client_config, store, navigator)
        .context("failed to build backend client")?;

    Ok(AppState {
        proxy: ProxyState {
            client: Arc::new(client),
            requests_total: stats.requests_total.clone(),
            errors_total: stats.errors_total.clone(),
        },
        stats,
        prometheus,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting farm-session-gateway");

    // Installed before anything emits metrics
    let prometheus_handle = metrics::install_recorder()?;

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
        listen_addr = %config.gateway.listen_addr,
        backend_url = %config.backend.base_url,
        credentials_path = %config.session.credentials_path.display(),
        "configuration loaded"
    );

    let store = FileCredentialStore::load(config.session.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open session file {}",
                config.session.credentials_path.display()
            )
        })?;

    let app_state = build_state(config.backend, Arc::new(store), prometheus_handle)?;
    match app_state.proxy.client.is_authenticated().await {
        Ok(true) => info!("stored session found"),
        Ok(false) => warn!("no stored session, requests will go out anonymously until PUT /session"),
        Err(e) => warn!(error = %e, "could not read stored session"),
    }

    let app = build_router(app_state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: service and session state, uptime, request counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let client = &state.proxy.client;
    let authenticated = client.is_authenticated().await.unwrap_or(false);

    axum::Json(serde_json::json!({
        "status": "healthy",
        "authenticated": authenticated,
        "refreshing": client.coordinator().is_refreshing(),
        "queued_requests": client.coordinator().queued(),
        "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
        "requests_served": state.stats.requests_total.load(Ordering::Relaxed),
        "errors_total": state.stats.errors_total.load(Ordering::Relaxed),
        "session_teardowns": state.stats.teardowns_total.load(Ordering::Relaxed),
    }))
}

/// Prometheus metrics endpoint, text exposition format.
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

/// Catch-all handler that forwards everything else to the backend.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let method = request.method().to_string();
    let started = Instant::now();

    let response = proxy::proxy_request(&state.proxy, request, request_id).await;

    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
