//! # Origin Fetcher
//!
//! The single in-flight download for a cache entry.
//!
//! A fetcher issues a ranged GET resuming from the entry's watermark and
//! streams the response body into the store, republishing the watermark to
//! every waiting reader as chunks land. Transport-level failures are
//! transient: the fetcher retries after a fixed delay, resuming from
//! wherever the watermark stands, for as many attempts as the
//! [`FetchRetryPolicy`] allows. Authorization failures (403) and other
//! non-success statuses are terminal and fail the entry for every current
//! and future reader.

use crate::error::{CacheError, FetchFailure, Result};
use crate::proxy::ListenerRegistry;
use crate::store::CacheEntry;
use bytes::Buf;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Fixed delay between transient-failure retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(6);

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry policy for transient download failures.
///
/// The default reproduces the intentionally unlimited policy of the original
/// system: a fixed 6-second delay and no attempt cap. Deployments that want
/// a bound set `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRetryPolicy {
    /// Fixed delay before each retry.
    pub delay: Duration,
    /// Maximum retry attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for FetchRetryPolicy {
    fn default() -> Self {
        Self::unlimited(DEFAULT_RETRY_DELAY)
    }
}

impl FetchRetryPolicy {
    /// Retry forever with a fixed delay.
    pub fn unlimited(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Retry at most `attempts` times with a fixed delay.
    pub fn capped(delay: Duration, attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(attempts),
        }
    }

    /// Whether retry number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}

// ============================================================================
// Origin Fetcher
// ============================================================================

enum FetchOutcome {
    Complete,
    Cancelled,
}

/// Spawns and drives origin downloads. At most one fetcher runs per cache
/// key; the proxy registry enforces that.
pub struct OriginFetcher;

impl OriginFetcher {
    /// Spawn the download task for `entry`.
    ///
    /// The task owns the entry's write side until it completes, fails the
    /// entry terminally, or is cancelled. Progress and terminal errors are
    /// reported to the listeners registered for `url`.
    pub fn spawn(
        client: reqwest::Client,
        entry: CacheEntry,
        url: String,
        headers: HeaderMap,
        listeners: ListenerRegistry,
        policy: FetchRetryPolicy,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(run(client, entry, url, headers, listeners, policy, cancel))
    }
}

#[instrument(skip_all, fields(url = %url))]
async fn run(
    client: reqwest::Client,
    entry: CacheEntry,
    url: String,
    headers: HeaderMap,
    listeners: ListenerRegistry,
    policy: FetchRetryPolicy,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        match fetch_once(&client, &entry, &url, &headers, &listeners, &cancel).await {
            Ok(FetchOutcome::Complete) => {
                info!(available = entry.available_bytes(), "Origin fetch complete");
                return;
            }
            Ok(FetchOutcome::Cancelled) => {
                debug!("Origin fetch cancelled");
                entry.fail(FetchFailure::Network("fetch cancelled".to_string()));
                return;
            }
            Err(err) if err.is_transient() => {
                attempt += 1;
                if policy.allows(attempt) {
                    warn!(attempt, delay = ?policy.delay, "Transient fetch error, retrying: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            entry.fail(FetchFailure::Network("fetch cancelled".to_string()));
                            return;
                        }
                        _ = tokio::time::sleep(policy.delay) => {}
                    }
                } else {
                    let failure = FetchFailure::Network(err.to_string());
                    entry.fail(failure.clone());
                    listeners.notify_error(&url, &failure);
                    return;
                }
            }
            Err(err) => {
                let failure = match err {
                    CacheError::Forbidden => FetchFailure::Forbidden,
                    CacheError::Fetch { status } => FetchFailure::Fetch { status },
                    CacheError::Failed(failure) => failure,
                    other => FetchFailure::Store(other.to_string()),
                };
                entry.fail(failure.clone());
                listeners.notify_error(&url, &failure);
                return;
            }
        }
    }
}

async fn fetch_once(
    client: &reqwest::Client,
    entry: &CacheEntry,
    url: &str,
    headers: &HeaderMap,
    listeners: &ListenerRegistry,
    cancel: &CancellationToken,
) -> Result<FetchOutcome> {
    if entry.is_complete() {
        return Ok(FetchOutcome::Complete);
    }

    let resume = entry.available_bytes();
    let mut request = client.get(url).headers(headers.clone());
    if resume > 0 {
        request = request.header(RANGE, format!("bytes={resume}-"));
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
        result = request.send() => result.map_err(|e| CacheError::Network(e.to_string()))?,
    };

    let status = response.status();
    if status == StatusCode::FORBIDDEN {
        return Err(CacheError::Forbidden);
    }
    if !status.is_success() {
        return Err(CacheError::Fetch {
            status: status.as_u16(),
        });
    }

    if entry.total_bytes().is_none() {
        if let Some(total) = total_from_response(&response, status) {
            entry.set_total(total).await?;
        }
    }

    if entry.total_bytes() == Some(0) {
        entry.complete().await?;
        listeners.notify_available(url, 100);
        return Ok(FetchOutcome::Complete);
    }

    // An origin that ignored the Range header restarts the body at zero;
    // the first `resume` bytes are already on disk and must be skipped.
    let mut skip = if status == StatusCode::PARTIAL_CONTENT {
        0
    } else {
        resume
    };

    debug!(resume, total = ?entry.total_bytes(), "Streaming origin response");
    let mut last_percent = percent_of(entry);
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(mut bytes)) => {
                if skip > 0 {
                    let drop_len = (skip as usize).min(bytes.len());
                    bytes.advance(drop_len);
                    skip -= drop_len as u64;
                    if bytes.is_empty() {
                        continue;
                    }
                }
                let offset = entry.available_bytes();
                entry.append(offset, &bytes).await?;

                let percent = percent_of(entry);
                if percent != last_percent {
                    last_percent = percent;
                    if let Some(percent) = percent {
                        listeners.notify_available(url, percent);
                    }
                }
            }
            Some(Err(e)) => return Err(CacheError::Network(e.to_string())),
            None => {
                if let Some(total) = entry.total_bytes() {
                    if entry.available_bytes() < total {
                        return Err(CacheError::Network(
                            "origin closed the connection early".to_string(),
                        ));
                    }
                }
                entry.complete().await?;
                if last_percent != Some(100) {
                    listeners.notify_available(url, 100);
                }
                return Ok(FetchOutcome::Complete);
            }
        }
    }
}

fn percent_of(entry: &CacheEntry) -> Option<u32> {
    let total = entry.total_bytes()?;
    if total == 0 {
        return Some(100);
    }
    Some((entry.available_bytes() * 100 / total) as u32)
}

/// Total resource length from a response, when the origin reports one.
///
/// A 206 carries it in `Content-Range: bytes a-b/total`; a full 200 carries
/// it as `Content-Length` (the body is the whole resource).
fn total_from_response(response: &reqwest::Response, status: StatusCode) -> Option<u64> {
    if status == StatusCode::PARTIAL_CONTENT {
        let header = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
        let total = header.rsplit('/').next()?;
        return total.trim().parse().ok();
    }
    // A 200 body is the whole resource, even after a Range request the
    // origin chose to ignore.
    response.content_length()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_unlimited_six_seconds() {
        let policy = FetchRetryPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(6));
        assert_eq!(policy.max_attempts, None);
        assert!(policy.allows(1));
        assert!(policy.allows(1_000_000));
    }

    #[test]
    fn test_capped_policy_stops_allowing() {
        let policy = FetchRetryPolicy::capped(Duration::from_millis(10), 2);
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }
}
