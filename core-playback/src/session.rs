//! # Playback Session Controller
//!
//! Owns one playback engine instance and runs the session state machine.
//!
//! ## Ownership model
//!
//! All session state lives inside a single owning task. The public
//! [`VideoSession`] handle posts commands over a channel; engine
//! notifications, cache-listener callbacks, access-validator verdicts, and
//! retry-timer firings arrive as messages on the same loop. Nothing outside
//! that loop mutates session state or emits events, so the event stream the
//! consumer sees is ordered exactly as it was generated.
//!
//! ## State machine
//!
//! `Idle → Loading → Ready → (Playing | Paused) → Ended`, with an orthogonal
//! buffering flag and a terminal `Failed` state reachable from anywhere.
//! `initialized` is emitted exactly once per session, on the first ready
//! transition.

use crate::config::{LoadRetryPolicy, SessionOptions};
use crate::engine::{EngineNotification, EngineSource, EngineState, PlaybackEngine};
use crate::error::{Result, SessionError};
use crate::source::{resolve_source, MediaSourceKind};
use crate::validator::{AccessValidator, ProbeVerdict};
use core_cache::{CacheListener, FetchFailure, ProxyCacheServer};
use core_runtime::events::{EventReceiver, EventSink, PlayerEvent};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// Public Types
// ============================================================================

/// Coarse session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Constructed, nothing loaded yet.
    Idle,
    /// A load is in flight.
    Loading,
    /// Media ready; playback not requested.
    Ready,
    /// Playing.
    Playing,
    /// Paused by the host.
    Paused,
    /// The terminal playback position was reached.
    Ended,
    /// Terminal failure.
    Failed,
}

/// Snapshot of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Coarse state.
    pub state: SessionState,
    /// Orthogonal buffering flag.
    pub buffering: bool,
}

// ============================================================================
// Messages
// ============================================================================

enum Command {
    Play,
    Pause,
    SetLooping(bool),
    SetVolume(f64),
    SetSpeed(f64),
    SeekTo(u64),
    Position(oneshot::Sender<u64>),
    Status(oneshot::Sender<SessionStatus>),
}

enum InternalMsg {
    CacheAvailable { url: String, percent: u32 },
    CacheError { url: String, failure: FetchFailure },
    RetryLoad,
}

/// Forwards cache callbacks onto the session loop.
struct SessionCacheListener {
    tx: mpsc::UnboundedSender<InternalMsg>,
}

impl CacheListener for SessionCacheListener {
    fn on_cache_available(&self, url: &str, percent: u32) {
        let _ = self.tx.send(InternalMsg::CacheAvailable {
            url: url.to_string(),
            percent,
        });
    }

    fn on_cache_error(&self, url: &str, failure: &FetchFailure) {
        let _ = self.tx.send(InternalMsg::CacheError {
            url: url.to_string(),
            failure: failure.clone(),
        });
    }
}

// ============================================================================
// Session Handle
// ============================================================================

/// Handle to a playback session.
///
/// Cheap operations post commands to the owning task; `dispose` tears the
/// session down and is safe to call from any state, any number of times.
pub struct VideoSession {
    commands: mpsc::UnboundedSender<Command>,
    events: EventSink,
    cancel: CancellationToken,
    owner: Mutex<Option<JoinHandle<()>>>,
    origin_url: String,
    proxied_url: Option<String>,
    kind: MediaSourceKind,
}

impl VideoSession {
    /// Create a session around `engine` for `raw_url`.
    ///
    /// Resolves the source strategy (an unrecognized explicit hint has
    /// already failed in [`crate::source::FormatHint::parse`]; inference
    /// never fails), decides cache eligibility, configures the engine, and
    /// starts the owning task.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Engine`] when the engine rejects the source
    /// during setup.
    #[instrument(skip(engine, options, proxy), fields(url = raw_url))]
    pub async fn create(
        mut engine: Box<dyn PlaybackEngine>,
        raw_url: &str,
        options: SessionOptions,
        proxy: Option<Arc<ProxyCacheServer>>,
    ) -> Result<VideoSession> {
        let resolved = resolve_source(raw_url, options.format_hint, options.cache_mode);
        let retry = options.load_retry.unwrap_or(match resolved.kind {
            MediaSourceKind::Progressive => LoadRetryPolicy::progressive(),
            _ => LoadRetryPolicy::none(),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let events = EventSink::new();

        // Cache routing: eligible sources go through the proxy when it is
        // available; everything else feeds the engine directly.
        let mut proxied_url = None;
        let mut cache_registration = None;
        if resolved.cache_eligible {
            if let Some(proxy) = proxy.filter(|p| p.can_cache()) {
                let listener: Arc<dyn CacheListener> = Arc::new(SessionCacheListener {
                    tx: internal_tx.clone(),
                });
                proxy.register_listener(listener.clone(), &resolved.origin_url);
                proxied_url = Some(proxy.proxy_url(&resolved.origin_url));
                info!(proxied = proxied_url.as_deref().unwrap_or(""), "Source routed through cache proxy");
                cache_registration = Some((proxy, listener));
            }
        }

        let engine_source = EngineSource {
            uri: proxied_url
                .clone()
                .unwrap_or_else(|| resolved.origin_url.clone()),
            kind: resolved.kind,
            headers: options.headers.clone(),
        };

        let setup = async {
            engine.set_audio_mixing(options.mix_with_others).await?;
            engine.set_source(&engine_source).await?;
            engine.prepare().await?;
            Ok::<_, SessionError>(())
        };
        if let Err(e) = setup.await {
            if let Some((proxy, listener)) = &cache_registration {
                proxy.unregister_listener(listener, &resolved.origin_url);
            }
            return Err(e);
        }
        let engine_rx = engine.notifications();

        let owner = Owner {
            engine,
            events: events.clone(),
            state: SessionState::Loading,
            buffering: false,
            engine_state: EngineState::Idle,
            initialized: false,
            forbidden: HashSet::new(),
            origin_url: resolved.origin_url.clone(),
            retry,
            retry_state: RetryState::default(),
            validator: AccessValidator::new(),
            cancel: cancel.clone(),
            internal_tx,
            verdict_tx,
            cache_registration,
        };
        let handle = tokio::spawn(owner.run(command_rx, engine_rx, internal_rx, verdict_rx));

        Ok(VideoSession {
            commands: command_tx,
            events,
            cancel,
            owner: Mutex::new(Some(handle)),
            origin_url: resolved.origin_url,
            proxied_url,
            kind: resolved.kind,
        })
    }

    /// Begin or resume playback.
    pub fn play(&self) -> Result<()> {
        self.send(Command::Play)
    }

    /// Pause playback.
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Loop at the end of the media instead of ending.
    pub fn set_looping(&self, looping: bool) -> Result<()> {
        self.send(Command::SetLooping(looping))
    }

    /// Set the volume; values outside `[0, 1]` are clamped.
    pub fn set_volume(&self, volume: f64) -> Result<()> {
        self.send(Command::SetVolume(volume))
    }

    /// Set the playback speed (rate only, no pitch correction).
    pub fn set_playback_speed(&self, speed: f64) -> Result<()> {
        self.send(Command::SetSpeed(speed))
    }

    /// Seek to an absolute position.
    pub fn seek_to(&self, position_ms: u64) -> Result<()> {
        self.send(Command::SeekTo(position_ms))
    }

    /// Current playback position in milliseconds.
    pub async fn position(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Position(tx))?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    /// Snapshot of the session state machine.
    pub async fn status(&self) -> Result<SessionStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    /// Attach the single event consumer, flushing queued events in order.
    pub fn attach_events(&self) -> EventReceiver {
        self.events.attach()
    }

    /// Detach the event consumer; later events queue again.
    pub fn detach_events(&self) {
        self.events.detach()
    }

    /// The original (non-proxied) source URL.
    pub fn origin_url(&self) -> &str {
        &self.origin_url
    }

    /// The local proxy URL, when the source is cache-routed.
    pub fn proxied_url(&self) -> Option<&str> {
        self.proxied_url.as_deref()
    }

    /// The selected media-source strategy.
    pub fn source_kind(&self) -> MediaSourceKind {
        self.kind
    }

    /// Tear the session down.
    ///
    /// The single cancellation point: pending validator probes and retry
    /// timers are cancelled, the engine is stopped and released, and the
    /// event sink closes so any event produced afterwards is dropped.
    /// Idempotent and safe to call from any state, including mid-failure.
    pub async fn dispose(&self) {
        self.events.close();
        self.cancel.cancel();
        let handle = self.owner.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Disposed)
    }
}

// ============================================================================
// Owning Task
// ============================================================================

#[derive(Default)]
struct RetryState {
    attempts: u32,
    pending: bool,
}

struct Owner {
    engine: Box<dyn PlaybackEngine>,
    events: EventSink,
    state: SessionState,
    buffering: bool,
    engine_state: EngineState,
    initialized: bool,
    /// URLs known to be forbidden. Owned by this task only; read by error
    /// classification, written by cache callbacks and validator verdicts.
    forbidden: HashSet<String>,
    origin_url: String,
    retry: LoadRetryPolicy,
    retry_state: RetryState,
    validator: AccessValidator,
    cancel: CancellationToken,
    internal_tx: mpsc::UnboundedSender<InternalMsg>,
    verdict_tx: mpsc::UnboundedSender<ProbeVerdict>,
    cache_registration: Option<(Arc<ProxyCacheServer>, Arc<dyn CacheListener>)>,
}

impl Owner {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut engine_rx: mpsc::UnboundedReceiver<EngineNotification>,
        mut internal_rx: mpsc::UnboundedReceiver<InternalMsg>,
        mut verdict_rx: mpsc::UnboundedReceiver<ProbeVerdict>,
    ) {
        debug!(url = %self.origin_url, "Session loop started");
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(note) = engine_rx.recv() => self.handle_notification(note).await,
                Some(msg) = internal_rx.recv() => self.handle_internal(msg).await,
                Some(verdict) = verdict_rx.recv() => self.handle_verdict(verdict),
                else => break,
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Play => {
                if let Err(e) = self.engine.play().await {
                    warn!("Engine play failed: {e}");
                } else if matches!(self.state, SessionState::Ready | SessionState::Paused) {
                    self.transition(SessionState::Playing);
                }
            }
            Command::Pause => {
                if let Err(e) = self.engine.pause().await {
                    warn!("Engine pause failed: {e}");
                } else if self.state == SessionState::Playing {
                    self.transition(SessionState::Paused);
                }
            }
            Command::SetLooping(looping) => {
                if let Err(e) = self.engine.set_looping(looping).await {
                    warn!("Engine set_looping failed: {e}");
                }
            }
            Command::SetVolume(volume) => {
                let clamped = volume.clamp(0.0, 1.0);
                if let Err(e) = self.engine.set_volume(clamped).await {
                    warn!("Engine set_volume failed: {e}");
                }
            }
            Command::SetSpeed(speed) => {
                if let Err(e) = self.engine.set_rate(speed).await {
                    warn!("Engine set_rate failed: {e}");
                }
            }
            Command::SeekTo(position_ms) => {
                if let Err(e) = self.engine.seek_to(position_ms).await {
                    warn!("Engine seek failed: {e}");
                }
            }
            Command::Position(reply) => {
                let _ = reply.send(self.engine.position_ms());
            }
            Command::Status(reply) => {
                let _ = reply.send(SessionStatus {
                    state: self.state,
                    buffering: self.buffering,
                });
            }
        }
    }

    async fn handle_notification(&mut self, note: EngineNotification) {
        match note {
            EngineNotification::StateChanged(engine_state) => {
                self.engine_state = engine_state;
                match engine_state {
                    EngineState::Buffering => {
                        self.set_buffering(true);
                        self.send_buffering_update();
                    }
                    EngineState::Ready => {
                        if !self.initialized {
                            self.initialized = true;
                            self.send_initialized();
                        }
                        if matches!(self.state, SessionState::Loading) {
                            self.transition(SessionState::Ready);
                        }
                    }
                    EngineState::Ended => {
                        self.transition(SessionState::Ended);
                        self.events.emit(PlayerEvent::Completed);
                    }
                    EngineState::Idle => {}
                }
                if engine_state != EngineState::Buffering {
                    self.set_buffering(false);
                }
            }
            EngineNotification::LoadingChanged(true) => {
                self.set_buffering(true);
                // Out-of-band authorization check for the original URL; the
                // verdict, if any, comes back as a message on this loop.
                self.validator.probe(
                    self.origin_url.clone(),
                    self.verdict_tx.clone(),
                    self.cancel.child_token(),
                );
            }
            EngineNotification::LoadingChanged(false) => {
                if self.engine_state != EngineState::Buffering {
                    self.set_buffering(false);
                }
            }
            EngineNotification::LoadError { transient, message } => {
                self.handle_load_error(transient, message);
            }
            EngineNotification::PlaybackError(message) => {
                self.fail(&message);
            }
        }
    }

    fn handle_load_error(&mut self, transient: bool, message: String) {
        if transient {
            let next = self.retry_state.attempts + 1;
            if self.retry.allows(next) && !self.retry_state.pending {
                self.retry_state.attempts = next;
                self.retry_state.pending = true;
                // Retry delay is always present when allows() passes.
                let delay = self.retry.delay.unwrap_or_default();
                warn!(attempt = next, ?delay, "Transient load error, retrying: {message}");

                let tx = self.internal_tx.clone();
                let cancel = self.cancel.child_token();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx.send(InternalMsg::RetryLoad);
                        }
                    }
                });
                return;
            }
        }
        self.fail(&message);
    }

    async fn handle_internal(&mut self, msg: InternalMsg) {
        match msg {
            InternalMsg::CacheAvailable { url, percent } => {
                // Informational only; no state transition.
                debug!(%url, percent, "Cache progress");
            }
            InternalMsg::CacheError { url, failure } => {
                if failure.is_forbidden() {
                    warn!(%url, "Cache reported authorization failure");
                    self.forbidden.insert(url);
                    self.buffering = false;
                    self.events.emit(PlayerEvent::BufferingEnd);
                    self.events.emit(PlayerEvent::Error {
                        code: "403".to_string(),
                        message: format!("Video player had error {failure}"),
                    });
                    self.transition(SessionState::Failed);
                } else {
                    warn!(%url, %failure, "Cache error");
                }
            }
            InternalMsg::RetryLoad => {
                self.retry_state.pending = false;
                debug!(attempt = self.retry_state.attempts, "Re-attempting load");
                self.transition(SessionState::Loading);
                if let Err(e) = self.engine.prepare().await {
                    warn!("Retry prepare failed: {e}");
                }
            }
        }
    }

    fn handle_verdict(&mut self, verdict: ProbeVerdict) {
        warn!(url = %verdict.url, "Access validator found 403");
        self.forbidden.insert(verdict.url);
        self.set_buffering(false);
        self.events.emit(PlayerEvent::Error {
            code: "403".to_string(),
            message: "Video player had error".to_string(),
        });
        self.transition(SessionState::Failed);
    }

    fn fail(&mut self, message: &str) {
        self.set_buffering(false);
        let code = if self.forbidden.contains(&self.origin_url) {
            "403"
        } else {
            "VideoError"
        };
        self.events.emit(PlayerEvent::Error {
            code: code.to_string(),
            message: format!("Video player had error {message}"),
        });
        self.transition(SessionState::Failed);
    }

    fn set_buffering(&mut self, value: bool) {
        if self.buffering != value {
            self.buffering = value;
            self.events.emit(if value {
                PlayerEvent::BufferingStart
            } else {
                PlayerEvent::BufferingEnd
            });
        }
    }

    fn send_initialized(&mut self) {
        let duration_ms = self.engine.duration_ms().unwrap_or(0);
        let upright = self.engine.video_dimensions().map(|d| d.upright());
        self.events.emit(PlayerEvent::Initialized {
            duration_ms,
            width: upright.map(|(w, _)| w),
            height: upright.map(|(_, h)| h),
        });
    }

    fn send_buffering_update(&mut self) {
        self.events.emit(PlayerEvent::BufferingUpdate {
            buffered_ranges: vec![[0, self.engine.buffered_position_ms()]],
        });
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Session state");
            self.state = next;
        }
    }

    async fn shutdown(mut self) {
        debug!(url = %self.origin_url, "Disposing session");
        if self.initialized {
            self.engine.stop().await;
        }
        self.engine.release().await;
        if let Some((proxy, listener)) = &self.cache_registration {
            proxy.unregister_listener(listener, &self.origin_url);
        }
        self.events.close();
    }
}
