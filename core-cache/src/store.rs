//! # Cache Store
//!
//! Per-URL on-disk representation of a partially or fully downloaded
//! resource.
//!
//! Each entry is a pair of files under the store root: `<key>.media` holds
//! the raw bytes, `<key>.meta.json` holds what is known about the resource
//! (total length, completion). Bytes are appended strictly sequentially, so
//! the data-file length *is* the watermark of available bytes. Reopening a
//! store resumes from wherever the previous session stopped instead of
//! re-fetching from zero.
//!
//! Entry state is published through a `tokio::sync::watch` channel: the
//! single writer (the origin fetcher) advances the watermark, and any number
//! of readers wait on it without polling. Watermarks only ever grow; no
//! reader observes a regression.

use crate::error::{CacheError, FetchFailure, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Default chunk size for entry readers (64 KiB).
pub const DEFAULT_READ_CHUNK_BYTES: usize = 64 * 1024;

// ============================================================================
// Cache Key
// ============================================================================

/// Deterministic identity of a cached resource.
///
/// Derived from the origin URL only (never from request headers), so two
/// requests for the same URL always share one entry and at most one
/// in-flight download.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for an origin URL (lowercase hex of SHA-256).
    pub fn from_url(url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// The key as a filesystem-safe string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Entry State
// ============================================================================

/// Outcome of waiting for a byte offset to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one byte at the requested offset is readable now.
    Ready,
    /// The offset is at or past the end of the resource.
    Eof,
}

/// Sidecar metadata persisted next to the data file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EntryMeta {
    total_len: Option<u64>,
    complete: bool,
}

#[derive(Debug, Clone)]
struct EntryState {
    available: u64,
    total: Option<u64>,
    complete: bool,
    failed: Option<FetchFailure>,
}

impl EntryState {
    fn past_eof(&self, offset: u64) -> bool {
        if let Some(total) = self.total {
            return offset >= total;
        }
        self.complete && offset >= self.available
    }
}

// ============================================================================
// Cache Entry
// ============================================================================

struct EntryInner {
    key: CacheKey,
    data_path: PathBuf,
    meta_path: PathBuf,
    file: Mutex<File>,
    state: watch::Sender<EntryState>,
}

/// A single cached resource shared by its writer and N readers.
///
/// Clone is cheap; all clones refer to the same entry.
#[derive(Clone)]
pub struct CacheEntry {
    inner: Arc<EntryInner>,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow().clone();
        f.debug_struct("CacheEntry")
            .field("key", &self.inner.key)
            .field("path", &self.inner.data_path)
            .field("available", &state.available)
            .field("total", &state.total)
            .field("complete", &state.complete)
            .finish_non_exhaustive()
    }
}

impl CacheEntry {
    /// Key identifying this entry.
    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    /// Bytes available so far (the watermark). Monotonically non-decreasing.
    pub fn available_bytes(&self) -> u64 {
        self.inner.state.borrow().available
    }

    /// Total length of the resource, once the origin has reported it.
    pub fn total_bytes(&self) -> Option<u64> {
        self.inner.state.borrow().total
    }

    /// Whether every byte of the resource is on disk.
    pub fn is_complete(&self) -> bool {
        self.inner.state.borrow().complete
    }

    /// The recorded terminal failure, if the download failed for good.
    pub fn failure(&self) -> Option<FetchFailure> {
        self.inner.state.borrow().failed.clone()
    }

    /// Record the total resource length and persist it.
    pub async fn set_total(&self, total: u64) -> Result<()> {
        self.inner.state.send_modify(|s| s.total = Some(total));
        self.write_meta().await
    }

    /// Append bytes at `offset`, advancing the watermark.
    ///
    /// `offset` must equal the current watermark; anything else is a
    /// [`CacheError::StoreInconsistency`], fatal to the entry. Returns the
    /// new watermark.
    pub async fn append(&self, offset: u64, data: &[u8]) -> Result<u64> {
        let mut file = self.inner.file.lock().await;

        {
            let state = self.inner.state.borrow();
            if let Some(failure) = &state.failed {
                return Err(CacheError::Failed(failure.clone()));
            }
            if state.complete {
                return Err(CacheError::EntryComplete);
            }
            if offset != state.available {
                return Err(CacheError::StoreInconsistency {
                    expected: state.available,
                    got: offset,
                });
            }
        }

        if data.is_empty() {
            return Ok(offset);
        }

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let new_watermark = offset + data.len() as u64;
        self.inner
            .state
            .send_modify(|s| s.available = new_watermark);
        Ok(new_watermark)
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes when the range crosses the watermark or the known
    /// end of the resource, and an empty buffer when nothing at `offset` is
    /// available yet. Does not wait; combine with [`CacheEntry::wait_for`].
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let end = {
            let state = self.inner.state.borrow();
            let mut end = state.available;
            if let Some(total) = state.total {
                end = end.min(total);
            }
            end
        };

        if offset >= end || len == 0 {
            return Ok(Bytes::new());
        }
        let want = ((end - offset) as usize).min(len);

        let mut file = self.inner.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Mark the download finished and persist completion.
    ///
    /// If no total was ever reported, the current watermark becomes the
    /// total.
    pub async fn complete(&self) -> Result<()> {
        self.inner.state.send_modify(|s| {
            if s.total.is_none() {
                s.total = Some(s.available);
            }
            s.complete = true;
        });
        debug!(key = %self.inner.key, "Cache entry complete");
        self.write_meta().await
    }

    /// Record a terminal failure, waking every waiter.
    ///
    /// Current and future readers of this entry fail with the given
    /// classification. Sticky for the lifetime of the process.
    pub fn fail(&self, failure: FetchFailure) {
        warn!(key = %self.inner.key, %failure, "Cache entry failed");
        self.inner.state.send_modify(|s| {
            if s.failed.is_none() {
                s.failed = Some(failure);
            }
        });
    }

    /// Wait until `offset` is readable, proven past EOF, or the entry fails.
    ///
    /// Suspends on watermark advances; never polls. A failed entry rejects
    /// waiters immediately, whatever their offset.
    pub async fn wait_for(&self, offset: u64) -> Result<WaitOutcome> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| s.failed.is_some() || offset < s.available || s.past_eof(offset))
            .await
            .map_err(|_| CacheError::Internal("entry state channel closed".to_string()))?;

        if let Some(failure) = &state.failed {
            return Err(CacheError::Failed(failure.clone()));
        }
        if offset < state.available {
            Ok(WaitOutcome::Ready)
        } else {
            Ok(WaitOutcome::Eof)
        }
    }

    /// Create a reader over `[start, end)`; `end == None` reads to EOF.
    pub fn reader(&self, start: u64, end: Option<u64>) -> EntryReader {
        EntryReader {
            entry: self.clone(),
            position: start,
            end,
            chunk_size: DEFAULT_READ_CHUNK_BYTES,
        }
    }

    async fn write_meta(&self) -> Result<()> {
        let meta = {
            let state = self.inner.state.borrow();
            EntryMeta {
                total_len: state.total,
                complete: state.complete,
            }
        };
        let json = serde_json::to_vec(&meta)
            .map_err(|e| CacheError::Internal(format!("meta serialization failed: {e}")))?;
        tokio::fs::write(&self.inner.meta_path, json).await?;
        Ok(())
    }
}

// ============================================================================
// Entry Reader
// ============================================================================

/// A cursor over a cache entry with blocking-read-until-available semantics.
///
/// Each call to [`EntryReader::next_chunk`] waits for the watermark to cover
/// the cursor, then returns the next chunk. `Ok(None)` signals end-of-stream:
/// a reader over `[0, total)` has then delivered exactly `total` bytes,
/// regardless of how the origin chunked the download.
pub struct EntryReader {
    entry: CacheEntry,
    position: u64,
    end: Option<u64>,
    chunk_size: usize,
}

impl EntryReader {
    /// Override the maximum chunk size returned per call.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next chunk of bytes, or `Ok(None)` at end-of-stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(end) = self.end {
                if self.position >= end {
                    return Ok(None);
                }
            }

            match self.entry.wait_for(self.position).await? {
                WaitOutcome::Eof => return Ok(None),
                WaitOutcome::Ready => {
                    let mut want = self.chunk_size as u64;
                    if let Some(end) = self.end {
                        want = want.min(end - self.position);
                    }
                    let bytes = self.entry.read_at(self.position, want as usize).await?;
                    if bytes.is_empty() {
                        // Lost a race with a concurrent state change; wait again.
                        continue;
                    }
                    self.position += bytes.len() as u64;
                    return Ok(Some(bytes));
                }
            }
        }
    }
}

// ============================================================================
// Cache Store
// ============================================================================

/// Directory-backed store of cache entries, one in-memory entry per key.
///
/// `open_entry` is create-if-absent / attach-if-present: concurrent calls
/// for the same key share a single [`CacheEntry`] (and therefore a single
/// watermark and at most one in-flight download).
pub struct CacheStore {
    root: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Cache store opened");
        Ok(Self {
            root,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open or attach to the entry for `key`.
    ///
    /// An entry left on disk by an earlier session resumes from its
    /// persisted watermark and sidecar metadata.
    pub async fn open_entry(&self, key: &CacheKey) -> Result<CacheEntry> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key.as_str()) {
            return Ok(entry.clone());
        }

        let data_path = self.root.join(format!("{key}.media"));
        let meta_path = self.root.join(format!("{key}.meta.json"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)
            .await?;
        let available = file.metadata().await?.len();

        let meta = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice::<EntryMeta>(&bytes).unwrap_or_else(|e| {
                warn!(key = %key, "Discarding unreadable cache metadata: {e}");
                EntryMeta::default()
            }),
            Err(_) => EntryMeta::default(),
        };

        // Trust the sidecar only while it agrees with the bytes on disk.
        let mut total = meta.total_len;
        let mut complete = meta.complete && total == Some(available);
        if let Some(t) = total {
            if available > t {
                warn!(key = %key, "Data file longer than recorded total; ignoring sidecar");
                total = None;
                complete = false;
            }
        }

        let (state_tx, _) = watch::channel(EntryState {
            available,
            total,
            complete,
            failed: None,
        });

        let entry = CacheEntry {
            inner: Arc::new(EntryInner {
                key: key.clone(),
                data_path,
                meta_path,
                file: Mutex::new(file),
                state: state_tx,
            }),
        };
        debug!(key = %key, available, ?total, complete, "Cache entry opened");
        entries.insert(key.as_str().to_string(), entry.clone());
        Ok(entry)
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
