// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! gh-download - release asset gateway library
//!
//! Serves stable download URLs for the release assets of every repository
//! under one GitHub owner:
//!
//! **Path** -> **Release listing** -> **Tag resolution** -> **Upstream asset** -> **Client**
//!
//! `GET /tool/latest/linux_amd64.zip` lists the releases of `owner/tool`,
//! picks the newest tag (say `v1.2.3`) and streams
//! `https://github.com/owner/tool/releases/download/v1.2.3/tool_1.2.3_linux_amd64.zip`
//! back to the client.
//!
//! # Core Modules
//!
//! - [`resolver`] - Tag selection and version normalization
//! - [`proxy`] - Asset filename/URL construction and streaming relay
//! - [`github`] - Release-listing API client
//! - [`analytics`] - Batched, best-effort download events
//! - [`server`] - HTTP routes and shared request context
//! - [`config`] - Environment configuration
//! - [`errors`] - Request-path errors and their HTTP mapping

pub mod analytics;
pub mod config;
pub mod errors;
pub mod github;
pub mod proxy;
pub mod resolver;
pub mod server;
pub mod types;

pub use analytics::{AnalyticsConfig, AnalyticsSink};
pub use config::GatewayConfig;
pub use errors::GatewayError;
pub use github::{GitHubClient, GitHubError};
pub use proxy::{asset_filename, asset_url, AssetProxy, ProxiedAsset};
pub use resolver::{normalize_version, resolve, ResolveError};
pub use server::{build_router, serve, AppState, Server};
pub use types::{DownloadEvent, DownloadRequest, ReleaseRef, ResolvedAsset};
