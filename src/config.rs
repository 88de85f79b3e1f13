// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process configuration.
//!
//! Read once from the environment at startup. A missing or malformed value
//! is a startup error; nothing here is consulted again while serving.

use anyhow::{anyhow, bail, Context, Result};
use std::time::Duration;

use crate::analytics::{self, AnalyticsConfig};
use crate::github;
use crate::proxy;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default listen address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind to.
    pub bind_address: String,
    /// Owner (user or org) every route's repository belongs to.
    pub owner: String,
    /// Token for the release-listing API.
    pub github_token: Option<String>,
    /// Release-listing API base URL.
    pub github_api_url: String,
    /// Asset download base URL.
    pub download_url: String,
    /// Timeout for one release-listing call.
    pub api_timeout: Duration,
    /// Connect timeout for asset fetches.
    pub upstream_connect_timeout: Option<Duration>,
    /// Analytics settings; `None` disables analytics.
    pub analytics: Option<AnalyticsConfig>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("bind_address", &self.bind_address)
            .field("owner", &self.owner)
            .field("github_token", &self.github_token.as_deref().map(mask_sensitive))
            .field("github_api_url", &self.github_api_url)
            .field("download_url", &self.download_url)
            .field("api_timeout", &self.api_timeout)
            .field("upstream_connect_timeout", &self.upstream_connect_timeout)
            .field("analytics", &self.analytics)
            .finish()
    }
}

impl GatewayConfig {
    /// Configuration with defaults for everything but the owner.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            owner: owner.into(),
            github_token: None,
            github_api_url: github::DEFAULT_API_URL.to_string(),
            download_url: proxy::DEFAULT_DOWNLOAD_URL.to_string(),
            api_timeout: Duration::from_secs(github::REQUEST_TIMEOUT_SECS),
            upstream_connect_timeout: None,
            analytics: None,
        }
    }

    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let owner = get("GITHUB_OWNER").ok_or_else(|| anyhow!("GITHUB_OWNER must be set"))?;
        let mut config = Self::new(owner);

        if let Some(port) = get("PORT") {
            config.port = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {}", port))?;
        }
        if let Some(addr) = get("BIND_ADDRESS") {
            config.bind_address = addr;
        }
        config.github_token = get("GITHUB_ACCESS_TOKEN");
        if let Some(url) = get("GITHUB_API_URL") {
            config.github_api_url = url;
        }
        if let Some(url) = get("GITHUB_DOWNLOAD_URL") {
            config.download_url = url;
        }
        if let Some(secs) = get("GITHUB_API_TIMEOUT_SECS") {
            config.api_timeout = Duration::from_secs(parse_number("GITHUB_API_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = get("UPSTREAM_CONNECT_TIMEOUT_SECS") {
            config.upstream_connect_timeout = Some(Duration::from_secs(parse_number(
                "UPSTREAM_CONNECT_TIMEOUT_SECS",
                &secs,
            )?));
        }

        config.analytics = match (get("KEEN_PROJECT"), get("KEEN_WRITE_KEY")) {
            (Some(project_id), Some(write_key)) => {
                let flush_interval = match get("KEEN_FLUSH_INTERVAL_MS") {
                    Some(ms) => Duration::from_millis(parse_number("KEEN_FLUSH_INTERVAL_MS", &ms)?),
                    None => analytics::DEFAULT_FLUSH_INTERVAL,
                };
                if flush_interval.is_zero() {
                    bail!("KEEN_FLUSH_INTERVAL_MS must be greater than zero");
                }
                Some(AnalyticsConfig {
                    project_id,
                    write_key,
                    api_url: get("KEEN_API_URL").unwrap_or_else(|| analytics::DEFAULT_API_URL.to_string()),
                    flush_interval,
                })
            }
            (None, None) => None,
            _ => bail!("KEEN_PROJECT and KEEN_WRITE_KEY must be set together"),
        };

        Ok(config)
    }

    /// Socket address string to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("{} is not a valid number: {}", key, value))
}

/// Mask a secret for logging, keeping a short prefix.
fn mask_sensitive(input: &str) -> String {
    let prefix: String = input.chars().take(4).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<GatewayConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("GITHUB_OWNER", "acme")]).unwrap();
        assert_eq!(config.owner, "acme");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.github_api_url, "https://api.github.com");
        assert_eq!(config.download_url, "https://github.com");
        assert!(config.github_token.is_none());
        assert!(config.analytics.is_none());
        assert!(config.upstream_connect_timeout.is_none());
    }

    #[test]
    fn test_owner_required() {
        assert!(load(&[]).is_err());
        assert!(load(&[("GITHUB_OWNER", "  ")]).is_err());
    }

    #[test]
    fn test_invalid_port() {
        let err = load(&[("GITHUB_OWNER", "acme"), ("PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
        assert!(load(&[("GITHUB_OWNER", "acme"), ("PORT", "70000")]).is_err());
    }

    #[test]
    fn test_full_environment() {
        let config = load(&[
            ("GITHUB_OWNER", "acme"),
            ("PORT", "5000"),
            ("BIND_ADDRESS", "127.0.0.1"),
            ("GITHUB_ACCESS_TOKEN", "ghp_abcdefgh"),
            ("UPSTREAM_CONNECT_TIMEOUT_SECS", "5"),
            ("KEEN_PROJECT", "proj"),
            ("KEEN_WRITE_KEY", "key"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:5000");
        assert_eq!(config.github_token.as_deref(), Some("ghp_abcdefgh"));
        assert_eq!(config.upstream_connect_timeout, Some(Duration::from_secs(5)));

        let analytics = config.analytics.as_ref().unwrap();
        assert_eq!(analytics.project_id, "proj");
        assert_eq!(analytics.flush_interval, Duration::from_secs(1));
        assert_eq!(analytics.api_url, "https://api.keen.io/3.0");

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("ghp_abcdefgh"));
        assert!(rendered.contains("ghp_..."));
    }

    #[test]
    fn test_keen_credentials_come_in_pairs() {
        assert!(load(&[("GITHUB_OWNER", "acme"), ("KEEN_PROJECT", "proj")]).is_err());
        assert!(load(&[
            ("GITHUB_OWNER", "acme"),
            ("KEEN_PROJECT", "proj"),
            ("KEEN_WRITE_KEY", "key"),
            ("KEEN_FLUSH_INTERVAL_MS", "0"),
        ])
        .is_err());
    }
}
