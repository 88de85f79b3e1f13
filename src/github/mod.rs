// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! GitHub release listing
//!
//! Fetches the release list of a repository through the GitHub REST API.
//! Only the first page is read; GitHub returns it newest first, which is
//! the order the resolver relies on.
//!
//! # Example
//!
//! ```no_run
//! use gh_download::github::GitHubClient;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = GitHubClient::new().with_token("ghp_...");
//! let releases = client.list_releases("acme", "tool").await?;
//! println!("newest: {}", releases[0].tag);
//! # Ok(())
//! # }
//! ```

use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

use crate::types::ReleaseRef;

/// Default GitHub API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Default timeout for listing requests (in seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

const USER_AGENT: &str = concat!("gh-download/", env!("CARGO_PKG_VERSION"));

/// Error types specific to the release-listing API.
#[derive(Debug, Clone)]
pub enum GitHubError {
    /// Transport failure: DNS, refused connection, timeout.
    Network(String),
    /// The API answered with a non-success status.
    Api { status: u16, message: String },
    /// The API answered 2xx with a body we could not decode.
    Decode(String),
    /// The configured base URL cannot carry a path.
    InvalidUrl(String),
}

impl std::fmt::Display for GitHubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "{}", msg),
            Self::Api { status, message } if message.is_empty() => {
                write!(f, "GitHub API returned HTTP {}", status)
            }
            Self::Api { status, message } => {
                write!(f, "GitHub API returned HTTP {}: {}", status, message)
            }
            Self::Decode(msg) => write!(f, "failed to decode release listing: {}", msg),
            Self::InvalidUrl(url) => write!(f, "invalid GitHub API URL: {}", url),
        }
    }
}

impl std::error::Error for GitHubError {}

#[derive(Debug, Deserialize)]
struct ReleaseData {
    tag_name: Option<String>,
    #[serde(default)]
    assets: Vec<AssetData>,
}

#[derive(Debug, Deserialize)]
struct AssetData {
    browser_download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

/// Client for the release-listing API.
#[derive(Clone)]
pub struct GitHubClient {
    /// Access token, sent as a bearer credential when present.
    token: Option<String>,
    /// Base URL for the API.
    base_url: String,
    /// HTTP client with configured timeouts.
    client: reqwest::Client,
    /// Request timeout.
    timeout: Duration,
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitHubClient {
    /// Create an anonymous client against the public API.
    pub fn new() -> Self {
        Self {
            token: None,
            base_url: DEFAULT_API_URL.to_string(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    /// Share an existing HTTP client (and its connection pool).
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Set the access token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the API base URL (GitHub Enterprise, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if the client carries a token.
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `<base>/repos/<owner>/<repo>/releases`, with `owner` and `repo` each
    /// encoded as a single path segment.
    pub fn releases_url(&self, owner: &str, repo: &str) -> Result<Url, GitHubError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|_| GitHubError::InvalidUrl(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| GitHubError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["repos", owner, repo, "releases"]);
        Ok(url)
    }

    /// List the releases of `owner/repo`, newest first.
    ///
    /// Releases without a tag name are skipped.
    pub async fn list_releases(&self, owner: &str, repo: &str) -> Result<Vec<ReleaseRef>, GitHubError> {
        let url = self.releases_url(owner, repo)?;

        let mut request = self
            .client
            .get(url.clone())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .timeout(self.timeout);

        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(url = %url, "error: {}", e);
            if e.is_timeout() {
                GitHubError::Network(format!("request to {} timed out", url))
            } else {
                GitHubError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_default();
            tracing::error!(url = %url, "error: {} {}", status, message);
            return Err(GitHubError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let data: Vec<ReleaseData> = response
            .json()
            .await
            .map_err(|e| GitHubError::Decode(e.to_string()))?;

        let releases = into_release_refs(data);
        tracing::debug!(
            owner = owner,
            repo = repo,
            count = releases.len(),
            "Listed releases"
        );

        Ok(releases)
    }
}

fn into_release_refs(data: Vec<ReleaseData>) -> Vec<ReleaseRef> {
    data.into_iter()
        .filter_map(|r| {
            let tag = r.tag_name?;
            Some(ReleaseRef {
                tag,
                is_latest: false,
                asset_urls: r
                    .assets
                    .into_iter()
                    .filter_map(|a| a.browser_download_url)
                    .collect(),
            })
        })
        .enumerate()
        .map(|(i, mut r)| {
            r.is_latest = i == 0;
            r
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_configuration() {
        let client = GitHubClient::new();
        assert_eq!(client.base_url(), DEFAULT_API_URL);
        assert!(!client.is_authenticated());

        let client = client
            .with_base_url("http://127.0.0.1:9000/")
            .with_token("secret");
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
        assert!(client.is_authenticated());
        assert!(!format!("{:?}", client).contains("secret"));
    }

    #[test]
    fn test_releases_url_encodes_segments() {
        let client = GitHubClient::new();
        assert_eq!(
            client.releases_url("acme", "tool").unwrap().as_str(),
            "https://api.github.com/repos/acme/tool/releases"
        );
        assert_eq!(
            client.releases_url("acme", "../other").unwrap().as_str(),
            "https://api.github.com/repos/acme/..%2Fother/releases"
        );

        let enterprise = GitHubClient::new().with_base_url("https://ghe.local/api/v3/");
        assert_eq!(
            enterprise.releases_url("acme", "tool").unwrap().as_str(),
            "https://ghe.local/api/v3/repos/acme/tool/releases"
        );

        let broken = GitHubClient::new().with_base_url("not a url");
        assert!(matches!(broken.releases_url("acme", "tool"), Err(GitHubError::InvalidUrl(_))));
    }

    #[test]
    fn test_decode_listing() {
        let body = r#"[
            {"tag_name": "v2.0.0", "assets": [
                {"name": "tool_2.0.0_linux_amd64.zip",
                 "browser_download_url": "https://github.com/acme/tool/releases/download/v2.0.0/tool_2.0.0_linux_amd64.zip"}
            ]},
            {"tag_name": null, "assets": []},
            {"tag_name": "v1.0.0"}
        ]"#;
        let data: Vec<ReleaseData> = serde_json::from_str(body).unwrap();
        let releases = into_release_refs(data);

        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].tag, "v2.0.0");
        assert!(releases[0].is_latest);
        assert_eq!(releases[0].asset_urls.len(), 1);
        assert_eq!(releases[1].tag, "v1.0.0");
        assert!(!releases[1].is_latest);
        assert!(releases[1].asset_urls.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = GitHubError::Api {
            status: 401,
            message: "Bad credentials".to_string(),
        };
        assert_eq!(err.to_string(), "GitHub API returned HTTP 401: Bad credentials");

        let err = GitHubError::Api {
            status: 500,
            message: String::new(),
        };
        assert_eq!(err.to_string(), "GitHub API returned HTTP 500");
    }

    #[tokio::test]
    async fn test_unreachable_api_is_network_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = GitHubClient::new().with_base_url(format!("http://{}", addr));
        let err = client.list_releases("acme", "tool").await.unwrap_err();
        assert!(matches!(err, GitHubError::Network(_)));
    }
}
