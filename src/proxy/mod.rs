// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asset proxy
//!
//! Turns a resolved tag into the upstream asset URL and relays that asset
//! to the client.
//!
//! Upstream naming convention, which filenames must reproduce exactly:
//!
//! | request                      | filename                      |
//! |------------------------------|-------------------------------|
//! | `tool/v1.2.3.zip`            | `tool_v1.2.3.zip`             |
//! | `tool/v1.2.3/Linux_AMD64.zip`| `tool_1.2.3_linux_amd64.zip`  |
//!
//! Un-platformed assets keep the raw tag; platformed ones use the
//! normalized version and a lower-cased platform.
//!
//! The body is relayed chunk by chunk. The upstream connection is owned by
//! the [`RelayStream`] inside the outbound body, so it is closed whenever
//! that body is dropped: after the last chunk, after an upstream read
//! error, or when the client disconnects mid-transfer.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{bail, Context as _};
use reqwest::Url;

use crate::errors::GatewayError;
use crate::resolver::normalize_version;
use crate::types::{DownloadRequest, ResolvedAsset};

/// Default host serving release downloads.
pub const DEFAULT_DOWNLOAD_URL: &str = "https://github.com";

/// Upstream URL actually fetched.
pub const BACKEND_URL_HEADER: HeaderName = HeaderName::from_static("backend-url");
/// Canonical tag the request resolved to.
pub const VERSION_HEADER: HeaderName = HeaderName::from_static("version");
/// Platform token as sent by the client.
pub const PLATFORM_HEADER: HeaderName = HeaderName::from_static("platform");

// =============================================================================
// Filename and URL construction
// =============================================================================

/// Build the upstream asset filename.
///
/// Fails with [`GatewayError::MalformedPlatform`] when `platform` has no `_`.
pub fn asset_filename(
    repo: &str,
    canonical_tag: &str,
    platform: Option<&str>,
    extension: &str,
) -> Result<String, GatewayError> {
    let parts = match platform {
        Some(platform) => {
            let platform = platform.to_lowercase();
            if !platform.contains('_') {
                return Err(GatewayError::MalformedPlatform(platform));
            }
            vec![repo.to_string(), normalize_version(canonical_tag).to_string(), platform]
        }
        None => vec![repo.to_string(), canonical_tag.to_string()],
    };

    Ok(format!("{}.{}", parts.join("_"), extension))
}

/// Build `<base>/<owner>/<repo>/releases/download/<tag>/<filename>`.
///
/// Each part is pushed as one percent-encoded path segment, so a `/` inside
/// a part can never address another repository. `download_base` must be a
/// hierarchical URL, which [`AssetProxy::new`] checks.
pub fn asset_url(download_base: &Url, owner: &str, repo: &str, canonical_tag: &str, filename: &str) -> Url {
    let mut url = download_base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty()
            .extend([owner, repo, "releases", "download", canonical_tag, filename]);
    }
    url
}

// =============================================================================
// Proxy
// =============================================================================

/// Build the HTTP client used for asset fetches.
///
/// No overall timeout: a large asset may legitimately take minutes to relay.
pub fn build_http_client(connect_timeout: Option<Duration>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder.build()
}

/// Fetches release assets from the download host.
#[derive(Debug, Clone)]
pub struct AssetProxy {
    client: reqwest::Client,
    download_base: Url,
}

impl AssetProxy {
    /// Fails when `download_base` is not an absolute `http(s)`-style URL.
    pub fn new(client: reqwest::Client, download_base: &str) -> anyhow::Result<Self> {
        let download_base = Url::parse(download_base)
            .with_context(|| format!("Invalid download URL: {}", download_base))?;
        if download_base.cannot_be_a_base() {
            bail!("Invalid download URL: {} has no path", download_base);
        }
        Ok(Self { client, download_base })
    }

    /// Derive the asset for `request` given the tag it resolved to.
    pub fn resolve_asset(
        &self,
        owner: &str,
        request: &DownloadRequest,
        canonical_tag: &str,
    ) -> Result<ResolvedAsset, GatewayError> {
        let filename = asset_filename(
            &request.repo,
            canonical_tag,
            request.platform.as_deref(),
            &request.extension,
        )?;

        Ok(ResolvedAsset {
            canonical_tag: canonical_tag.to_string(),
            normalized_version: normalize_version(canonical_tag).to_string(),
            upstream_url: asset_url(&self.download_base, owner, &request.repo, canonical_tag, &filename).into(),
            asset_filename: filename,
        })
    }

    /// GET the asset. Any HTTP response, whatever its status, is relayed;
    /// only transport failures become errors.
    pub async fn fetch(&self, asset: &ResolvedAsset) -> Result<ProxiedAsset, GatewayError> {
        let url = &asset.upstream_url;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(url = %url, "error: {}", e);
                GatewayError::UpstreamUnreachable(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::OK {
            tracing::info!("download: {}", url);
        } else {
            tracing::error!("error: {} {}", status, url);
        }

        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let content_length = response.headers().get(header::CONTENT_LENGTH).cloned();

        Ok(ProxiedAsset {
            status,
            upstream_url: url.clone(),
            content_type,
            content_length,
            body: RelayStream::new(url.clone(), response.bytes_stream()),
        })
    }
}

/// An upstream response ready to be relayed.
pub struct ProxiedAsset {
    pub status: StatusCode,
    pub upstream_url: String,
    content_type: Option<HeaderValue>,
    content_length: Option<HeaderValue>,
    body: RelayStream,
}

impl IntoResponse for ProxiedAsset {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        match HeaderValue::from_str(&self.upstream_url) {
            Ok(value) => {
                headers.insert(BACKEND_URL_HEADER, value);
            }
            Err(_) => tracing::warn!(url = %self.upstream_url, "URL is not a valid header value"),
        }
        if let Some(value) = self.content_type {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Some(value) = self.content_length {
            headers.insert(header::CONTENT_LENGTH, value);
        }

        response
    }
}

// =============================================================================
// Relay stream
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayOutcome {
    Streaming,
    Completed,
    Failed,
}

/// Single-pass relay of an upstream body.
///
/// Owns the upstream side; dropping it closes the upstream connection.
pub struct RelayStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    url: String,
    relayed: u64,
    outcome: RelayOutcome,
}

impl RelayStream {
    pub fn new<S>(url: String, stream: S) -> Self
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
            url,
            relayed: 0,
            outcome: RelayOutcome::Streaming,
        }
    }

    /// Bytes handed to the client so far.
    pub fn relayed(&self) -> u64 {
        self.relayed
    }
}

impl Stream for RelayStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.outcome != RelayOutcome::Streaming {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.outcome = RelayOutcome::Failed;
                tracing::error!(url = %this.url, relayed = this.relayed, "error: upstream body: {}", e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.outcome = RelayOutcome::Completed;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        match self.outcome {
            RelayOutcome::Completed => {
                tracing::debug!(url = %self.url, relayed = self.relayed, "Relay complete")
            }
            RelayOutcome::Failed => {
                tracing::debug!(url = %self.url, relayed = self.relayed, "Relay aborted by upstream")
            }
            RelayOutcome::Streaming => tracing::debug!(
                url = %self.url,
                relayed = self.relayed,
                "Client went away, closing upstream"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::{Arc, Mutex};

    fn request(platform: Option<&str>) -> DownloadRequest {
        DownloadRequest {
            repo: "tool".to_string(),
            tag_selector: "latest".to_string(),
            platform: platform.map(str::to_string),
            extension: "zip".to_string(),
        }
    }

    fn github() -> Url {
        Url::parse(DEFAULT_DOWNLOAD_URL).unwrap()
    }

    /// An address nothing listens on.
    async fn closed_addr() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    /// Log output collected by a thread-local subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_filename_without_platform_keeps_raw_tag() {
        assert_eq!(asset_filename("tool", "v1.2.3", None, "zip").unwrap(), "tool_v1.2.3.zip");
        assert_eq!(asset_filename("tool", "1.2.3", None, "tgz").unwrap(), "tool_1.2.3.tgz");
    }

    #[test]
    fn test_filename_with_platform_strips_v_and_lowercases() {
        assert_eq!(
            asset_filename("tool", "v1.2.3", Some("Linux_AMD64"), "zip").unwrap(),
            "tool_1.2.3_linux_amd64.zip"
        );
        assert_eq!(
            asset_filename("tool", "v1.2.3", Some("linux_arm_v7"), "tar.gz").unwrap(),
            "tool_1.2.3_linux_arm_v7.tar.gz"
        );
    }

    #[test]
    fn test_platform_without_separator_is_rejected() {
        let err = asset_filename("tool", "v1.2.3", Some("MacOS"), "zip").unwrap_err();
        assert_eq!(err, GatewayError::MalformedPlatform("macos".to_string()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_asset_url() {
        assert_eq!(
            asset_url(&github(), "acme", "tool", "v1.2.3", "tool_v1.2.3.zip").as_str(),
            "https://github.com/acme/tool/releases/download/v1.2.3/tool_v1.2.3.zip"
        );

        let mirror = Url::parse("http://mirror.local/gh/").unwrap();
        assert_eq!(
            asset_url(&mirror, "acme", "tool", "v1", "tool_v1.zip").as_str(),
            "http://mirror.local/gh/acme/tool/releases/download/v1/tool_v1.zip"
        );
    }

    #[test]
    fn test_asset_url_keeps_each_part_in_one_segment() {
        let url = asset_url(&github(), "acme", "../../other/private", "v1/../x", "x.zip");
        assert_eq!(
            url.as_str(),
            "https://github.com/acme/..%2F..%2Fother%2Fprivate/releases/download/v1%2F..%2Fx/x.zip"
        );
        assert_eq!(url.path_segments().unwrap().nth(1), Some("..%2F..%2Fother%2Fprivate"));
    }

    #[test]
    fn test_proxy_requires_hierarchical_base() {
        assert!(AssetProxy::new(reqwest::Client::new(), "not a url").is_err());
        assert!(AssetProxy::new(reqwest::Client::new(), "mailto:ops@example.com").is_err());
        assert!(AssetProxy::new(reqwest::Client::new(), "http://127.0.0.1:8080").is_ok());
    }

    #[test]
    fn test_resolve_asset() {
        let proxy = AssetProxy::new(reqwest::Client::new(), DEFAULT_DOWNLOAD_URL).unwrap();

        let asset = proxy.resolve_asset("acme", &request(Some("Linux_AMD64")), "v1.2.3").unwrap();
        assert_eq!(asset.canonical_tag, "v1.2.3");
        assert_eq!(asset.normalized_version, "1.2.3");
        assert_eq!(asset.asset_filename, "tool_1.2.3_linux_amd64.zip");
        assert_eq!(
            asset.upstream_url,
            "https://github.com/acme/tool/releases/download/v1.2.3/tool_1.2.3_linux_amd64.zip"
        );

        let asset = proxy.resolve_asset("acme", &request(None), "v1.2.3").unwrap();
        assert_eq!(
            asset.upstream_url,
            "https://github.com/acme/tool/releases/download/v1.2.3/tool_v1.2.3.zip"
        );
    }

    #[tokio::test]
    async fn test_relay_stream_passes_chunks_through() {
        let chunks = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let mut relay = RelayStream::new("http://upstream/asset".to_string(), stream::iter(chunks));

        let mut out = Vec::new();
        while let Some(chunk) = relay.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(out, b"hello world");
        assert_eq!(relay.relayed(), 11);
        assert_eq!(relay.outcome, RelayOutcome::Completed);
        assert!(relay.next().await.is_none());
    }

    #[tokio::test]
    async fn test_relay_stream_stops_after_upstream_error() {
        let upstream_err = reqwest::Client::new()
            .get(format!("http://{}/asset", closed_addr().await))
            .send()
            .await
            .unwrap_err();

        let chunks = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(upstream_err),
            Ok(Bytes::from_static(b"never relayed")),
        ];
        let mut relay = RelayStream::new("http://upstream/asset".to_string(), stream::iter(chunks));

        assert_eq!(relay.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert!(relay.next().await.unwrap().is_err());
        assert_eq!(relay.outcome, RelayOutcome::Failed);
        assert!(relay.next().await.is_none());
        assert_eq!(relay.relayed(), 7);
    }

    #[tokio::test]
    async fn test_fetch_unreachable_host() {
        let addr = closed_addr().await;

        let proxy = AssetProxy::new(reqwest::Client::new(), &format!("http://{}", addr)).unwrap();
        let asset = proxy.resolve_asset("acme", &request(None), "v1.2.3").unwrap();
        let err = proxy.fetch(&asset).await.err().unwrap();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_fetch_logs_transport_failure_with_url() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let addr = closed_addr().await;
        let proxy = AssetProxy::new(reqwest::Client::new(), &format!("http://{}", addr)).unwrap();
        let asset = proxy.resolve_asset("acme", &request(None), "v1.2.3").unwrap();
        assert!(proxy.fetch(&asset).await.is_err());

        let output = logs.contents();
        assert!(output.contains("ERROR"), "{}", output);
        assert!(output.contains("error: "), "{}", output);
        assert!(output.contains(&format!("url={}", asset.upstream_url)), "{}", output);
    }
}
