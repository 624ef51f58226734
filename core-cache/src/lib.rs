//! # Local Media Cache
//!
//! A local caching proxy for streamed media. The proxy sits between a
//! playback engine and the origin HTTP server: origin bytes are streamed to
//! disk exactly once per resource while one or more readers are served from
//! the growing cache file, so repeated or partial plays never re-fetch bytes
//! already downloaded.
//!
//! ## Components
//!
//! - [`store`]: per-URL on-disk cache entries with a monotonic "bytes
//!   available" watermark and async wait-for-data semantics.
//! - [`fetcher`]: the single in-flight origin download per entry, resuming
//!   from the watermark and retrying transient network failures.
//! - [`proxy`]: the local-only HTTP listener mapping origin URLs to cache
//!   entries and serving range requests with standard partial-content
//!   semantics.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use core_cache::proxy::{ProxyCacheServer, ProxyConfig};
//!
//! # async fn example() -> core_cache::Result<()> {
//! let config = ProxyConfig::default().with_cache_dir("/tmp/media_cache");
//! let server = ProxyCacheServer::start(config).await?;
//!
//! let local = server.proxy_url("https://cdn.example.com/clip.mp4");
//! // Hand `local` to the playback engine instead of the origin URL.
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fetcher;
pub mod proxy;
pub mod store;

pub use error::{CacheError, FetchFailure, Result};
pub use fetcher::FetchRetryPolicy;
pub use proxy::{CacheListener, ProxyCacheServer, ProxyConfig};
pub use store::{CacheEntry, CacheKey, CacheStore, EntryReader, WaitOutcome};
