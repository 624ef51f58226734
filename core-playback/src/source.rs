//! # Media Source Resolution
//!
//! Maps a raw source identifier to a media-source strategy and a cache
//! decision.
//!
//! The strategy comes from an explicit format hint or, absent one, from the
//! trailing path segment of the URL. Cache eligibility is an explicit
//! [`CacheMode`]; `CacheMode::Auto` keeps backward compatibility with the
//! reserved `.cachevideo` URL suffix, which is stripped before the URL is
//! used anywhere else.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};

/// Reserved URL suffix marking a source as cache-eligible.
pub const CACHE_SUFFIX: &str = ".cachevideo";

/// Explicit format hint supplied at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatHint {
    /// Segmented-index adaptive streaming (HLS-style manifest).
    SegmentedIndex,
    /// Smooth-streaming manifest.
    SmoothStreaming,
    /// Generic progressive download.
    Progressive,
    /// Infer the strategy from the URL.
    #[default]
    Auto,
}

impl FormatHint {
    /// Parse the external string form of a hint.
    ///
    /// Accepts both the legacy short names (`hls`, `ss`, `other`) and the
    /// descriptive ones. An unrecognized hint is a fatal construction error.
    pub fn parse(hint: &str) -> Result<Self, SessionError> {
        match hint {
            "hls" | "segmented-index" => Ok(FormatHint::SegmentedIndex),
            "ss" | "smooth-streaming" => Ok(FormatHint::SmoothStreaming),
            "other" | "progressive" => Ok(FormatHint::Progressive),
            "auto" => Ok(FormatHint::Auto),
            other => Err(SessionError::Construction(format!(
                "unknown format hint: {other}"
            ))),
        }
    }
}

/// The media-source strategy a session runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaSourceKind {
    /// Manifest-based adaptive streaming over a segmented index.
    SegmentedIndex,
    /// Smooth-streaming manifest.
    SmoothStreaming,
    /// Generic progressive download.
    Progressive,
}

impl MediaSourceKind {
    /// Infer the strategy from the URL's trailing path segment.
    ///
    /// Anything that is not a recognized manifest is progressive.
    pub fn infer(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let segment = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();

        if segment.ends_with(".m3u8") {
            MediaSourceKind::SegmentedIndex
        } else if segment.ends_with(".ism")
            || segment.ends_with(".isml")
            || segment == "manifest"
        {
            MediaSourceKind::SmoothStreaming
        } else {
            MediaSourceKind::Progressive
        }
    }

    fn from_hint(hint: FormatHint, url: &str) -> Self {
        match hint {
            FormatHint::SegmentedIndex => MediaSourceKind::SegmentedIndex,
            FormatHint::SmoothStreaming => MediaSourceKind::SmoothStreaming,
            FormatHint::Progressive => MediaSourceKind::Progressive,
            FormatHint::Auto => Self::infer(url),
        }
    }
}

/// Whether a source may be routed through the cache proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Detect eligibility from the reserved `.cachevideo` suffix.
    #[default]
    Auto,
    /// Always cache-eligible.
    Enabled,
    /// Never proxied.
    Disabled,
}

/// A resolved source: the clean origin URL, the strategy, and the cache
/// decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    /// Origin URL with any cache marker stripped.
    pub origin_url: String,
    /// Selected media-source strategy.
    pub kind: MediaSourceKind,
    /// Whether the source may go through the cache proxy.
    pub cache_eligible: bool,
}

/// Resolve a raw source identifier against a hint and cache mode.
pub fn resolve_source(raw_url: &str, hint: FormatHint, mode: CacheMode) -> ResolvedSource {
    let (origin_url, suffix_tagged) = match raw_url.strip_suffix(CACHE_SUFFIX) {
        Some(stripped) => (stripped.to_string(), true),
        None => (raw_url.to_string(), false),
    };

    let cache_eligible = match mode {
        CacheMode::Auto => suffix_tagged,
        CacheMode::Enabled => true,
        CacheMode::Disabled => false,
    };

    ResolvedSource {
        kind: MediaSourceKind::from_hint(hint, &origin_url),
        origin_url,
        cache_eligible,
    }
}
