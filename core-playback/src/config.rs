//! # Session Configuration

use crate::source::{CacheMode, FormatHint};
use std::collections::HashMap;
use std::time::Duration;

/// Fixed delay between load retries for the progressive strategy.
pub const PROGRESSIVE_RETRY_DELAY: Duration = Duration::from_secs(6);

/// Retry policy for transient load errors.
///
/// `delay == None` means no automatic retry. `max_attempts == None` retries
/// forever, the intentional default for the progressive strategy,
/// reproduced from the original system and kept as an explicit parameter so
/// deployments can cap it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRetryPolicy {
    /// Delay before re-attempting a failed load, or `None` to not retry.
    pub delay: Option<Duration>,
    /// Maximum retry attempts; `None` is unlimited.
    pub max_attempts: Option<u32>,
}

impl LoadRetryPolicy {
    /// The progressive-strategy default: fixed 6-second delay, unlimited
    /// attempts.
    pub fn progressive() -> Self {
        Self {
            delay: Some(PROGRESSIVE_RETRY_DELAY),
            max_attempts: None,
        }
    }

    /// No automatic retry (manifest-based strategies).
    pub fn none() -> Self {
        Self {
            delay: None,
            max_attempts: None,
        }
    }

    /// Whether retry number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        if self.delay.is_none() {
            return false;
        }
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}

/// Construction parameters for a playback session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Explicit format hint; `Auto` infers from the URL.
    pub format_hint: FormatHint,
    /// Request headers handed to the engine's data source.
    pub headers: HashMap<String, String>,
    /// Mix audio with other sessions instead of taking audio focus.
    pub mix_with_others: bool,
    /// Cache-eligibility decision.
    pub cache_mode: CacheMode,
    /// Override of the load-retry policy; by default the policy follows the
    /// selected strategy (progressive retries, manifests do not).
    pub load_retry: Option<LoadRetryPolicy>,
}

impl SessionOptions {
    /// Set the format hint.
    pub fn with_format_hint(mut self, hint: FormatHint) -> Self {
        self.format_hint = hint;
        self
    }

    /// Set request headers for the engine's data source.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Mix audio with other sessions.
    pub fn with_mix_with_others(mut self, mix: bool) -> Self {
        self.mix_with_others = mix;
        self
    }

    /// Set the cache-eligibility mode.
    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    /// Override the load-retry policy.
    pub fn with_load_retry(mut self, policy: LoadRetryPolicy) -> Self {
        self.load_retry = Some(policy);
        self
    }
}
