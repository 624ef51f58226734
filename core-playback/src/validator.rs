//! # Access Validator
//!
//! Out-of-band authorization probe.
//!
//! Playback engines surface a 403 from the origin as a generic source error,
//! indistinguishable from a corrupt stream. Whenever the session enters a
//! loading phase it fires an independent probe at the original URL; a 403
//! response produces a verdict message marshaled back onto the session's
//! owning task. Every other outcome, including transport failures of
//! the probe itself, is silently ignored: the probe is best-effort and only
//! ever asserts a positive finding.

use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A positive probe finding: the URL answered 403.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeVerdict {
    /// The probed URL.
    pub url: String,
}

/// Issues authorization probes off the session's event-processing path.
#[derive(Clone)]
pub struct AccessValidator {
    client: reqwest::Client,
}

impl Default for AccessValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessValidator {
    /// Create a validator with a default HTTP client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a validator reusing an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Spawn a fire-and-forget probe of `url`.
    ///
    /// Sends a [`ProbeVerdict`] on `verdicts` iff the response status is
    /// 403. Cancelling `cancel` abandons the probe; its verdict is then
    /// never delivered.
    pub fn probe(
        &self,
        url: String,
        verdicts: mpsc::UnboundedSender<ProbeVerdict>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                result = client.get(&url).send() => result,
            };

            match response {
                Ok(response) if response.status() == StatusCode::FORBIDDEN => {
                    debug!(%url, "Access probe found 403");
                    if !cancel.is_cancelled() {
                        let _ = verdicts.send(ProbeVerdict { url });
                    }
                }
                Ok(response) => {
                    trace!(%url, status = %response.status(), "Access probe passed");
                }
                Err(e) => {
                    // Best-effort: a failing probe proves nothing.
                    trace!(%url, "Access probe failed: {e}");
                }
            }
        })
    }
}
