// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Release resolution.
//!
//! Maps a version selector onto a release tag from an upstream listing.
//! The listing is ordered newest first, so `latest` is simply its head.
//! Explicit selectors are compared byte-for-byte: no semver parsing, no
//! prefix tolerance, no case folding.
//!
//! # Example
//!
//! ```
//! use gh_download::resolver::{normalize_version, resolve};
//! use gh_download::types::ReleaseRef;
//!
//! let releases = ReleaseRef::listing(["v2.0.0", "v1.0.0"]);
//! let tag = resolve(&releases, "latest").unwrap();
//! assert_eq!(tag, "v2.0.0");
//! assert_eq!(normalize_version(tag), "2.0.0");
//! ```

use crate::types::{ReleaseRef, LATEST};

/// Error returned when no release matches a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The selector names a tag the listing does not contain.
    NotFound,
    /// `latest` was requested but the listing is empty.
    UpstreamEmpty,
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "no release matches the selector"),
            Self::UpstreamEmpty => write!(f, "release listing is empty"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Resolve `selector` against `releases` and return the canonical tag.
///
/// The returned tag always borrows from an element of `releases`.
pub fn resolve<'a>(releases: &'a [ReleaseRef], selector: &str) -> Result<&'a str, ResolveError> {
    if selector == LATEST {
        return releases
            .first()
            .map(|r| r.tag.as_str())
            .ok_or(ResolveError::UpstreamEmpty);
    }

    releases
        .iter()
        .find(|r| r.tag == selector)
        .map(|r| r.tag.as_str())
        .ok_or(ResolveError::NotFound)
}

/// Strip exactly one leading `v` from a tag.
pub fn normalize_version(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}
