//! # Cache Proxy Server
//!
//! The local-only HTTP listener between the playback engine and the origin.
//!
//! Each origin URL maps to a deterministic local URL
//! (`http://127.0.0.1:<port>/<encoded-origin-url>`). A GET against that URL
//! opens (or attaches to) the cache entry for the origin, starts the single
//! origin fetch for the key if the entry is incomplete, and streams bytes to
//! the client from the growing cache file, waiting (not polling) whenever
//! the client is ahead of the download. Range requests get standard
//! partial-content semantics once the total length is known, and open-ended
//! delivery while it is not.
//!
//! Hosts observe downloads through [`CacheListener`] callbacks registered
//! per origin URL: periodic progress percentages and terminal failures
//! carrying an error code that distinguishes authorization failures from
//! generic ones.

use crate::error::{CacheError, FetchFailure, Result};
use crate::fetcher::{FetchRetryPolicy, OriginFetcher};
use crate::store::{CacheEntry, CacheKey, CacheStore};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderMap as OriginHeaderMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// Cache Listener
// ============================================================================

/// Callbacks observing the download of one origin URL.
///
/// No callback fires before a fetch has attached to the entry.
pub trait CacheListener: Send + Sync {
    /// Download progress for `url` as an integer percent of the known total.
    fn on_cache_available(&self, url: &str, percent: u32);

    /// Terminal origin or store failure for `url`. `failure.error_code()`
    /// distinguishes authorization failures (`"403"`) from generic ones.
    fn on_cache_error(&self, url: &str, failure: &FetchFailure);
}

/// Listener registrations keyed by origin URL. Clone shares the registry.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RwLock<HashMap<String, Vec<Arc<dyn CacheListener>>>>>,
}

impl ListenerRegistry {
    fn register(&self, url: &str, listener: Arc<dyn CacheListener>) {
        self.inner
            .write()
            .entry(url.to_string())
            .or_default()
            .push(listener);
    }

    fn unregister(&self, url: &str, listener: &Arc<dyn CacheListener>) {
        let mut map = self.inner.write();
        if let Some(listeners) = map.get_mut(url) {
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
            if listeners.is_empty() {
                map.remove(url);
            }
        }
    }

    pub(crate) fn notify_available(&self, url: &str, percent: u32) {
        let listeners = self.snapshot(url);
        for listener in listeners {
            listener.on_cache_available(url, percent);
        }
    }

    pub(crate) fn notify_error(&self, url: &str, failure: &FetchFailure) {
        let listeners = self.snapshot(url);
        for listener in listeners {
            listener.on_cache_error(url, failure);
        }
    }

    fn snapshot(&self, url: &str) -> Vec<Arc<dyn CacheListener>> {
        self.inner.read().get(url).cloned().unwrap_or_default()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the cache proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Directory holding cache entries.
    pub cache_dir: PathBuf,
    /// Port to bind on 127.0.0.1; `0` picks an ephemeral port.
    pub port: u16,
    /// Retry policy for transient origin failures.
    pub retry: FetchRetryPolicy,
    /// Chunk size for streaming cache bytes to clients.
    pub read_chunk_bytes: usize,
    /// Extra headers sent with every origin request.
    pub origin_headers: OriginHeaderMap,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("media_cache"),
            port: 0,
            retry: FetchRetryPolicy::default(),
            read_chunk_bytes: crate::store::DEFAULT_READ_CHUNK_BYTES,
            origin_headers: OriginHeaderMap::new(),
        }
    }
}

impl ProxyConfig {
    /// Set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Set a fixed listen port instead of an ephemeral one.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the retry policy for transient origin failures.
    pub fn with_retry(mut self, retry: FetchRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set extra headers for origin requests.
    pub fn with_origin_headers(mut self, headers: OriginHeaderMap) -> Self {
        self.origin_headers = headers;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err("cache_dir cannot be empty".to_string());
        }
        if self.read_chunk_bytes == 0 {
            return Err("read_chunk_bytes must be greater than 0".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Proxy Server
// ============================================================================

struct ProxyState {
    store: CacheStore,
    client: reqwest::Client,
    listeners: ListenerRegistry,
    fetches: Mutex<HashMap<String, JoinHandle<()>>>,
    config: ProxyConfig,
    cancel: CancellationToken,
}

/// Local caching proxy between a playback engine and the origin server.
pub struct ProxyCacheServer {
    state: Arc<ProxyState>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyCacheServer {
    /// Initialize storage, bind `127.0.0.1:<port>`, and start serving.
    ///
    /// An `Err` here means proxying is unavailable; callers fall back to
    /// direct origin access.
    #[instrument(skip(config), fields(cache_dir = %config.cache_dir.display()))]
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        config
            .validate()
            .map_err(CacheError::Internal)?;

        let store = CacheStore::open(&config.cache_dir).await?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CacheError::Internal(format!("http client: {e}")))?;

        let listener =
            tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], config.port))).await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let state = Arc::new(ProxyState {
            store,
            client,
            listeners: ListenerRegistry::default(),
            fetches: Mutex::new(HashMap::new()),
            config,
            cancel: cancel.clone(),
        });

        let router = Router::new()
            .route("/{*origin}", get(serve_media))
            .with_state(state.clone());

        let shutdown = cancel.clone().cancelled_owned();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Proxy server terminated: {e}");
            }
        });

        info!(addr = %local_addr, "Cache proxy listening");
        Ok(Self {
            state,
            local_addr,
            cancel,
            server: Mutex::new(Some(server)),
        })
    }

    /// Whether proxying is currently available.
    pub fn can_cache(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Address the proxy is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The deterministic local URL serving `origin_url`.
    pub fn proxy_url(&self, origin_url: &str) -> String {
        format!(
            "http://{}/{}",
            self.local_addr,
            urlencoding::encode(origin_url)
        )
    }

    /// Register a listener for download progress and errors of `origin_url`.
    pub fn register_listener(&self, listener: Arc<dyn CacheListener>, origin_url: &str) {
        self.state.listeners.register(origin_url, listener);
    }

    /// Remove a previously registered listener.
    pub fn unregister_listener(&self, listener: &Arc<dyn CacheListener>, origin_url: &str) {
        self.state.listeners.unregister(origin_url, listener);
    }

    /// Stop serving and cancel every in-flight fetch.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let server = self.server.lock().take();
        if let Some(server) = server {
            let _ = server.await;
        }
        let fetches: Vec<_> = {
            let mut map = self.state.fetches.lock();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for fetch in fetches {
            let _ = fetch.await;
        }
        info!("Cache proxy stopped");
    }
}

impl ProxyState {
    /// Open the entry for `origin` and make sure its single fetcher is
    /// running unless the entry is complete or terminally failed.
    async fn ensure_entry(&self, origin: &str) -> Result<CacheEntry> {
        let key = CacheKey::from_url(origin);
        let entry = self.store.open_entry(&key).await?;

        if entry.is_complete() {
            debug!(key = %key, "Serving fully cached entry");
            return Ok(entry);
        }
        if entry.failure().is_some() {
            return Ok(entry);
        }

        let mut fetches = self.fetches.lock();
        let running = fetches
            .get(key.as_str())
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if !running {
            debug!(key = %key, origin, "Starting origin fetch");
            let handle = OriginFetcher::spawn(
                self.client.clone(),
                entry.clone(),
                origin.to_string(),
                self.config.origin_headers.clone(),
                self.listeners.clone(),
                self.config.retry.clone(),
                self.cancel.child_token(),
            );
            fetches.insert(key.as_str().to_string(), handle);
        }
        Ok(entry)
    }
}

// ============================================================================
// Request Handling
// ============================================================================

async fn serve_media(
    State(state): State<Arc<ProxyState>>,
    Path(origin): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, StatusCode> {
    let entry = state.ensure_entry(&origin).await.map_err(|e| {
        error!("Failed to open cache entry: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    // A terminally failed entry rejects every current and future reader.
    if let Some(failure) = entry.failure() {
        warn!(%origin, %failure, "Rejecting request for failed entry");
        return Err(match failure {
            FetchFailure::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_GATEWAY,
        });
    }

    let total = entry.total_bytes();
    let range_header = headers.get(header::RANGE).and_then(|h| h.to_str().ok());
    let content_type = content_type_for(&origin);

    let (status, start, end) = match (range_header, total) {
        (Some(spec), Some(total)) => match parse_range_header(spec, total) {
            Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, Some(end + 1)),
            None => (StatusCode::OK, 0, Some(total)),
        },
        (Some(spec), None) => match parse_open_range(spec) {
            Some(start) => (StatusCode::PARTIAL_CONTENT, start, None),
            None => (StatusCode::OK, 0, None),
        },
        (None, Some(total)) => (StatusCode::OK, 0, Some(total)),
        (None, None) => (StatusCode::OK, 0, None),
    };

    let reader = entry
        .reader(start, end)
        .with_chunk_size(state.config.read_chunk_bytes);
    let stream = futures::stream::try_unfold(reader, |mut reader| async move {
        match reader.next_chunk().await {
            Ok(Some(bytes)) => Ok(Some((bytes, reader))),
            Ok(None) => Ok(None),
            Err(e) => Err(std::io::Error::other(e.to_string())),
        }
    });

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes");

    if let (Some(total), Some(end)) = (total, end) {
        response = response.header(header::CONTENT_LENGTH, (end - start).to_string());
        if status == StatusCode::PARTIAL_CONTENT {
            response = response.header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end - 1, total),
            );
        }
    }

    response
        .body(Body::from_stream(stream))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Parse an HTTP Range header against a known total length.
///
/// Supports `bytes=a-b`, `bytes=a-`, and the suffix form `bytes=-n`.
/// Returns the inclusive `(start, end)` pair, or `None` for unusable specs
/// (then the whole resource is served).
fn parse_range_header(header: &str, total: u64) -> Option<(u64, u64)> {
    let header = header.strip_prefix("bytes=")?;

    let (start, end) = header.split_once('-')?;
    let start = start.trim();
    let end = end.trim();

    match (start.is_empty(), end.is_empty()) {
        // bytes=-n (last n bytes)
        (true, false) => {
            let suffix_len: u64 = end.parse().ok()?;
            if suffix_len == 0 || total == 0 {
                return None;
            }
            Some((total.saturating_sub(suffix_len), total - 1))
        }
        // bytes=a- (from a to end)
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            if start >= total {
                return None;
            }
            Some((start, total - 1))
        }
        // bytes=a-b
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start >= total {
                return None;
            }
            let end = end.min(total - 1);
            if start > end {
                return None;
            }
            Some((start, end))
        }
        // bytes=- (invalid)
        (true, true) => None,
    }
}

/// Parse only the `bytes=a-` form, for responses whose total is unknown.
fn parse_open_range(header: &str) -> Option<u64> {
    let header = header.strip_prefix("bytes=")?;
    let (start, end) = header.split_once('-')?;
    if !end.trim().is_empty() {
        return None;
    }
    start.trim().parse().ok()
}

/// Guess a content type from the origin URL's extension.
fn content_type_for(origin: &str) -> &'static str {
    let path = origin.split(['?', '#']).next().unwrap_or(origin);
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ts" | "m2ts" => "video/mp2t",
        "m3u8" => "application/vnd.apple.mpegurl",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

// ============================================================================
// Tests
// ============================================================================
