// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request-path error handling.
//!
//! Every failure on the download path ends up as one of three user-visible
//! outcomes:
//! - `502 Bad Gateway` when an upstream could not be reached (the body is the
//!   underlying error text)
//! - `404 Not found` when the tag does not resolve
//! - `404 Not found` when the platform token is malformed or the repository
//!   name is not one GitHub allows, indistinguishable from the previous case
//!   on the wire
//!
//! Upstream failures are logged where they happen, next to the URL involved.
//! Analytics failures never reach this module; the sink logs and drops them.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// Body used for both flavours of 404.
pub const NOT_FOUND_BODY: &str = "Not found";

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors produced while resolving or proxying an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Release listing or asset fetch failed at the transport level, or the
    /// listing API refused the request.
    UpstreamUnreachable(String),
    /// The selector matched no release, or `latest` was asked of an empty list.
    TagNotFound {
        repo: String,
        selector: String,
    },
    /// The platform token has no `{os}_{arch}` separator.
    MalformedPlatform(String),
    /// The repository path segment is outside GitHub's name charset.
    InvalidRepo(String),
}

impl GatewayError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::TagNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::MalformedPlatform(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRepo(_) => StatusCode::NOT_FOUND,
        }
    }

    /// Get the body sent to the client.
    pub fn body(&self) -> String {
        match self {
            GatewayError::UpstreamUnreachable(message) => message.clone(),
            GatewayError::TagNotFound { .. }
            | GatewayError::MalformedPlatform(_)
            | GatewayError::InvalidRepo(_) => NOT_FOUND_BODY.to_string(),
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamUnreachable(msg) => write!(f, "upstream unreachable: {}", msg),
            Self::TagNotFound { repo, selector } => {
                write!(f, "no release of {} matches '{}'", repo, selector)
            }
            Self::MalformedPlatform(platform) => {
                write!(f, "platform '{}' is not of the form os_arch", platform)
            }
            Self::InvalidRepo(repo) => write!(f, "'{}' is not a repository name", repo),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<crate::github::GitHubError> for GatewayError {
    fn from(err: crate::github::GitHubError) -> Self {
        GatewayError::UpstreamUnreachable(err.to_string())
    }
}

// =============================================================================
// RESPONSE CONVERSION
// =============================================================================

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::debug!(status = status.as_u16(), "{}", self);

        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.body(),
        )
            .into_response()
    }
}
