//! HTTP server
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /{repo}/latest/version.txt` - Newest version as plain text
//! - `GET /{repo}/{tag}.{ext}` - Asset without platform qualifier
//! - `GET /{repo}/{tag}/{platform}.{ext}` - Asset for an `{os}_{arch}` platform
//!
//! `{tag}` is `latest` or an exact upstream tag. Asset responses mirror the
//! upstream status and carry `Backend-Url`, `Version` and (platform route
//! only) `Platform` headers.
//!
//! # Example
//!
//! ```no_run
//! use gh_download::{GatewayConfig, Server};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(GatewayConfig::from_env()?);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::analytics::{AnalyticsSink, DOWNLOADS_COLLECTION};
use crate::config::GatewayConfig;
use crate::errors::{GatewayError, NOT_FOUND_BODY};
use crate::github::GitHubClient;
use crate::proxy::{self, AssetProxy, ProxiedAsset, PLATFORM_HEADER, VERSION_HEADER};
use crate::resolver::{normalize_version, resolve};
use crate::types::{is_valid_repo_name, DownloadEvent, DownloadRequest, LATEST};

/// File name of the version endpoint under `/{repo}/latest/`.
const VERSION_FILE: &str = "version.txt";

/// Context shared by every request handler.
///
/// Built once at startup and read-only afterwards; the analytics sink
/// synchronizes internally. Call [`AnalyticsSink::shutdown`] on teardown.
pub struct AppState {
    /// Gateway configuration.
    pub config: GatewayConfig,
    /// Release-listing client.
    pub github: GitHubClient,
    /// Asset fetcher.
    pub proxy: AssetProxy,
    /// Download event sink.
    pub analytics: AnalyticsSink,
}

impl AppState {
    /// Build clients from `config`. Starts the analytics worker when
    /// analytics are configured, so this must run inside a tokio runtime.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let http = proxy::build_http_client(config.upstream_connect_timeout)
            .context("Failed to create HTTP client")?;

        let mut github = GitHubClient::new()
            .with_http_client(http.clone())
            .with_base_url(config.github_api_url.clone())
            .with_timeout(config.api_timeout);
        if let Some(ref token) = config.github_token {
            github = github.with_token(token.clone());
        }

        let analytics = match config.analytics {
            Some(ref analytics) => AnalyticsSink::start(analytics.clone(), http.clone()),
            None => {
                tracing::info!("Analytics disabled (KEEN_PROJECT/KEEN_WRITE_KEY not set)");
                AnalyticsSink::disabled()
            }
        };

        Ok(Self {
            proxy: AssetProxy::new(http, &config.download_url)?,
            github,
            analytics,
            config,
        })
    }
}

/// Gateway server.
#[derive(Debug)]
pub struct Server {
    config: GatewayConfig,
}

impl Server {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Override the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Override the bind address.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Bind, serve until SIGINT/SIGTERM, then flush analytics.
    pub async fn start(&self) -> Result<()> {
        let state = Arc::new(AppState::new(self.config.clone())?);
        let addr = self.config.listen_addr();

        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!("Port {} is already in use", self.config.port)
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        tracing::info!("serving on port {} for {} ...", self.config.port, self.config.owner);

        serve(listener, state, shutdown_signal()).await
    }
}

/// Build the router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/:repo/:file", get(asset_handler))
        .route("/:repo/:tag/:file", get(platform_asset_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves, then flush analytics.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state.clone());

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    state.analytics.shutdown().await;
    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response()
}

/// `/{repo}/{tag}.{ext}`
async fn asset_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path((repo, file)): Path<(String, String)>,
) -> Response {
    match DownloadRequest::plain(&repo, &file) {
        Some(request) => download(&state, request, connect_info.map(|c| c.0)).await,
        None => not_found_handler().await,
    }
}

/// `/{repo}/{tag}/{platform}.{ext}`, and `/{repo}/latest/version.txt`.
async fn platform_asset_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path((repo, tag, file)): Path<(String, String, String)>,
) -> Response {
    // The version file shadows a platform literally named "version".
    if tag == LATEST && file == VERSION_FILE {
        return match latest_version(&state, &repo).await {
            Ok(version) => (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("{}\n", version),
            )
                .into_response(),
            Err(e) => e.into_response(),
        };
    }

    match DownloadRequest::with_platform(&repo, &tag, &file) {
        Some(request) => download(&state, request, connect_info.map(|c| c.0)).await,
        None => not_found_handler().await,
    }
}

/// Normalized version of the newest release of `repo`.
async fn latest_version(state: &AppState, repo: &str) -> Result<String, GatewayError> {
    if !is_valid_repo_name(repo) {
        return Err(GatewayError::InvalidRepo(repo.to_string()));
    }
    let releases = state.github.list_releases(&state.config.owner, repo).await?;
    let tag = resolve(&releases, LATEST).map_err(|_| GatewayError::TagNotFound {
        repo: repo.to_string(),
        selector: LATEST.to_string(),
    })?;
    Ok(normalize_version(tag).to_string())
}

async fn download(state: &AppState, request: DownloadRequest, client: Option<SocketAddr>) -> Response {
    let mut headers = HeaderMap::new();
    match proxy_download(state, &request, client, &mut headers).await {
        Ok(asset) => (headers, asset).into_response(),
        Err(e) => (headers, e).into_response(),
    }
}

/// Resolve, record and fetch one download. Informational headers are added
/// to `headers` as soon as they are known so error responses carry them too.
async fn proxy_download(
    state: &AppState,
    request: &DownloadRequest,
    client: Option<SocketAddr>,
    headers: &mut HeaderMap,
) -> Result<ProxiedAsset, GatewayError> {
    let owner = &state.config.owner;
    let releases = state.github.list_releases(owner, &request.repo).await?;

    let tag = resolve(&releases, &request.tag_selector).map_err(|_| GatewayError::TagNotFound {
        repo: request.repo.clone(),
        selector: request.tag_selector.clone(),
    })?;

    insert_header(headers, VERSION_HEADER, tag);
    if let Some(ref platform) = request.platform {
        insert_header(headers, PLATFORM_HEADER, platform);
    }

    let asset = state.proxy.resolve_asset(owner, request, tag)?;

    if let Some(addr) = client {
        let event = DownloadEvent {
            repo: request.repo.clone(),
            requested_tag: request.tag_selector.clone(),
            resolved_version: asset.canonical_tag.clone(),
            extension: request.extension.clone(),
            platform: request
                .platform
                .as_deref()
                .map(str::to_lowercase)
                .unwrap_or_default(),
            client_address: addr.ip().to_string(),
        };
        state.analytics.add_event(DOWNLOADS_COLLECTION, &event);
    }

    state.proxy.fetch(&asset).await
}

fn insert_header(headers: &mut HeaderMap, name: axum::http::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!("Skipping {} header, value is not header-safe: {:?}", name, value),
    }
}

// =============================================================================
// Utilities
// =============================================================================

/// Graceful shutdown signal handler.
///
/// Resolves on SIGINT/SIGTERM (Ctrl+C on non-Unix platforms).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            _ => {
                tracing::warn!("Failed to install signal handlers, waiting for Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// State whose upstreams point at a port nothing listens on.
    async fn unreachable_state() -> Arc<AppState> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = GatewayConfig::new("acme");
        config.github_api_url = format!("http://{}", addr);
        config.download_url = format!("http://{}", addr);
        Arc::new(AppState::new(config).unwrap())
    }

    async fn get(state: Arc<AppState>, uri: &str) -> Response {
        build_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn test_server_overrides() {
        let server = Server::new(GatewayConfig::new("acme"))
            .with_port(3000)
            .with_bind_address("127.0.0.1");
        assert_eq!(server.port(), 3000);
        assert_eq!(server.config.listen_addr(), "127.0.0.1:3000");
    }

    #[tokio::test]
    async fn test_health() {
        let response = get(unreachable_state().await, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_listing_failure_is_bad_gateway() {
        let state = unreachable_state().await;

        let response = get(state.clone(), "/tool/v1.2.3.zip").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get("backend-url").is_none());
        assert!(response.headers().get("version").is_none());

        let response = get(state.clone(), "/tool/latest/linux_amd64.zip").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = get(state, "/tool/latest/version.txt").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unroutable_paths() {
        let state = unreachable_state().await;
        for uri in [
            "/tool/latest",
            "/tool/v1/linux_amd64",
            "/",
            "/a/b/c/d.zip",
            "/..%2Fother/latest/version.txt",
            "/..%2F..%2Fother%2Fprivate/latest/version.txt",
            "/..%2Fother/v1.zip",
            "/tool/..%2F..%2Fother/linux_amd64.zip",
            "/tool/latest/..%2Flinux_amd64.zip",
            "/%2E%2E/latest/version.txt",
        ] {
            let response = get(state.clone(), uri).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }
}
