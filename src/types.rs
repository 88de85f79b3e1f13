// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types used across gh-download.
//!
//! Everything here lives for at most one request. Nothing is persisted.

use serde::{Deserialize, Serialize};

/// Selector that resolves to the newest release.
pub const LATEST: &str = "latest";

/// One upstream release, as returned by the release-listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRef {
    /// Tag exactly as recorded upstream (e.g. `v1.2.3`).
    pub tag: String,
    /// True for the first (newest) entry of a listing.
    pub is_latest: bool,
    /// Download URLs of the attached assets, if the listing carried them.
    #[serde(default)]
    pub asset_urls: Vec<String>,
}

impl ReleaseRef {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            is_latest: false,
            asset_urls: Vec::new(),
        }
    }

    /// Build an ordered listing from tags given newest first.
    pub fn listing<I, S>(tags: I) -> Vec<ReleaseRef>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        tags.into_iter()
            .enumerate()
            .map(|(i, tag)| ReleaseRef {
                is_latest: i == 0,
                ..ReleaseRef::new(tag)
            })
            .collect()
    }
}

/// A download request decomposed from the inbound path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub repo: String,
    /// `latest` or an explicit tag.
    pub tag_selector: String,
    /// Platform token as written by the client (not lower-cased).
    pub platform: Option<String>,
    pub extension: String,
}

impl DownloadRequest {
    /// Parse `/{repo}/{tag}.{ext}`.
    ///
    /// Segments arrive percent-decoded, so anything that would not stay a
    /// single upstream path segment is refused.
    pub fn plain(repo: &str, file: &str) -> Option<Self> {
        if !is_valid_repo_name(repo) || !is_single_segment(file) {
            return None;
        }
        let (tag, ext) = split_extension(file)?;
        if !is_single_segment(tag) {
            return None;
        }
        Some(Self {
            repo: repo.to_string(),
            tag_selector: tag.to_string(),
            platform: None,
            extension: ext.to_string(),
        })
    }

    /// Parse `/{repo}/{tag}/{platform}.{ext}`.
    pub fn with_platform(repo: &str, tag: &str, file: &str) -> Option<Self> {
        if !is_valid_repo_name(repo) || !is_single_segment(tag) || !is_single_segment(file) {
            return None;
        }
        let (platform, ext) = split_extension(file)?;
        Some(Self {
            repo: repo.to_string(),
            tag_selector: tag.to_string(),
            platform: Some(platform.to_string()),
            extension: ext.to_string(),
        })
    }
}

/// GitHub repository names are limited to `[A-Za-z0-9._-]`; `.` and `..`
/// are not names at all.
pub fn is_valid_repo_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// True when a decoded segment cannot address a different upstream path.
pub fn is_single_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".." && !segment.contains(['/', '\\'])
}

/// Split a path segment into `(stem, extension)` at the last dot that
/// leaves both sides non-empty.
///
/// `tool-v1.2.3.zip` splits into `("tool-v1.2.3", "zip")`; `a.b.` splits into
/// `("a", "b.")`; a segment without such a dot yields `None`.
pub fn split_extension(segment: &str) -> Option<(&str, &str)> {
    segment
        .rmatch_indices('.')
        .map(|(idx, _)| idx)
        .find(|&idx| idx > 0 && idx + 1 < segment.len())
        .map(|idx| (&segment[..idx], &segment[idx + 1..]))
}

/// The asset a request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub canonical_tag: String,
    pub normalized_version: String,
    pub asset_filename: String,
    pub upstream_url: String,
}

/// Analytics record for one proxied download.
///
/// Field names on the wire match the existing `downloads` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadEvent {
    #[serde(rename = "Repo")]
    pub repo: String,
    #[serde(rename = "Tag")]
    pub requested_tag: String,
    #[serde(rename = "ExpandedVersion")]
    pub resolved_version: String,
    #[serde(rename = "Extension")]
    pub extension: String,
    /// Lower-cased platform token, empty when the request had none.
    #[serde(rename = "Platform")]
    pub platform: String,
    #[serde(rename = "ClientAddress")]
    pub client_address: String,
}
