//! Integration tests for the playback session controller, driven through a
//! scripted fake engine.

use async_trait::async_trait;
use core_playback::engine::{
    EngineNotification, EngineSource, EngineState, PlaybackEngine, VideoDimensions,
};
use core_playback::{
    CacheMode, FormatHint, LoadRetryPolicy, MediaSourceKind, SessionOptions, SessionState,
    VideoSession,
};
use core_runtime::events::PlayerEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Fake Engine
// ============================================================================

#[derive(Default)]
struct EngineRecord {
    volumes: Mutex<Vec<f64>>,
    rates: Mutex<Vec<f64>>,
    seeks: Mutex<Vec<u64>>,
    looping: Mutex<Vec<bool>>,
    sources: Mutex<Vec<EngineSource>>,
    prepare_count: AtomicUsize,
    release_count: AtomicUsize,
    position_ms: AtomicU64,
}

struct FakeEngine {
    record: Arc<EngineRecord>,
    duration_ms: Option<u64>,
    dimensions: Option<VideoDimensions>,
    buffered_ms: u64,
    rx: Option<mpsc::UnboundedReceiver<EngineNotification>>,
}

/// Test-side driver: pushes notifications and inspects recorded calls.
struct EngineDriver {
    tx: mpsc::UnboundedSender<EngineNotification>,
    record: Arc<EngineRecord>,
}

impl EngineDriver {
    fn notify(&self, note: EngineNotification) {
        let _ = self.tx.send(note);
    }
}

fn fake_engine(
    duration_ms: Option<u64>,
    dimensions: Option<VideoDimensions>,
) -> (Box<dyn PlaybackEngine>, EngineDriver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let record = Arc::new(EngineRecord::default());
    let engine = FakeEngine {
        record: record.clone(),
        duration_ms,
        dimensions,
        buffered_ms: 1500,
        rx: Some(rx),
    };
    (Box::new(engine), EngineDriver { tx, record })
}

#[async_trait]
impl PlaybackEngine for FakeEngine {
    async fn set_source(&mut self, source: &EngineSource) -> core_playback::Result<()> {
        self.record.sources.lock().push(source.clone());
        Ok(())
    }

    async fn prepare(&mut self) -> core_playback::Result<()> {
        self.record.prepare_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn play(&mut self) -> core_playback::Result<()> {
        Ok(())
    }

    async fn pause(&mut self) -> core_playback::Result<()> {
        Ok(())
    }

    async fn seek_to(&mut self, position_ms: u64) -> core_playback::Result<()> {
        self.record.seeks.lock().push(position_ms);
        self.record.position_ms.store(position_ms, Ordering::SeqCst);
        Ok(())
    }

    async fn set_volume(&mut self, volume: f64) -> core_playback::Result<()> {
        self.record.volumes.lock().push(volume);
        Ok(())
    }

    async fn set_rate(&mut self, rate: f64) -> core_playback::Result<()> {
        self.record.rates.lock().push(rate);
        Ok(())
    }

    async fn set_looping(&mut self, looping: bool) -> core_playback::Result<()> {
        self.record.looping.lock().push(looping);
        Ok(())
    }

    async fn set_audio_mixing(&mut self, _mix_with_others: bool) -> core_playback::Result<()> {
        Ok(())
    }

    fn position_ms(&self) -> u64 {
        self.record.position_ms.load(Ordering::SeqCst)
    }

    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    fn video_dimensions(&self) -> Option<VideoDimensions> {
        self.dimensions
    }

    fn buffered_position_ms(&self) -> u64 {
        self.buffered_ms
    }

    fn notifications(&mut self) -> mpsc::UnboundedReceiver<EngineNotification> {
        self.rx.take().expect("notifications taken twice")
    }

    async fn stop(&mut self) {}

    async fn release(&mut self) {
        self.record.release_count.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn recv_event(rx: &mut core_runtime::events::EventReceiver) -> PlayerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Origin that answers every request with the given status.
async fn spawn_status_origin(status: u16) -> String {
    use axum::{http::StatusCode, routing::get, Router};
    let code = StatusCode::from_u16(status).unwrap();
    let router = Router::new().route("/{*path}", get(move || async move { code }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/clip.mp4")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn initialized_fires_once_with_upright_dimensions() {
    let dims = VideoDimensions {
        width: 1920,
        height: 1080,
        rotation_degrees: 90,
    };
    let (engine, driver) = fake_engine(Some(90_000), Some(dims));
    let session = VideoSession::create(
        engine,
        "https://a/portrait.mp4",
        SessionOptions::default(),
        None,
    )
    .await
    .unwrap();
    let mut events = session.attach_events();

    driver.notify(EngineNotification::StateChanged(EngineState::Ready));
    assert_eq!(
        recv_event(&mut events).await,
        PlayerEvent::Initialized {
            duration_ms: 90_000,
            width: Some(1080),
            height: Some(1920),
        }
    );

    // A second ready transition must not re-emit initialized.
    driver.notify(EngineNotification::StateChanged(EngineState::Buffering));
    driver.notify(EngineNotification::StateChanged(EngineState::Ready));
    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingStart);

    session.dispose().await;
}

#[tokio::test]
async fn landscape_rotation_keeps_dimensions() {
    let dims = VideoDimensions {
        width: 1920,
        height: 1080,
        rotation_degrees: 180,
    };
    let (engine, driver) = fake_engine(Some(1_000), Some(dims));
    let session =
        VideoSession::create(engine, "https://a/clip.mp4", SessionOptions::default(), None)
            .await
            .unwrap();
    let mut events = session.attach_events();

    driver.notify(EngineNotification::StateChanged(EngineState::Ready));
    assert_eq!(
        recv_event(&mut events).await,
        PlayerEvent::Initialized {
            duration_ms: 1_000,
            width: Some(1920),
            height: Some(1080),
        }
    );
    session.dispose().await;
}

#[tokio::test]
async fn buffering_events_are_edge_triggered_and_ordered() {
    let (engine, driver) = fake_engine(Some(1_000), None);
    let session =
        VideoSession::create(engine, "https://a/clip.mp4", SessionOptions::default(), None)
            .await
            .unwrap();
    let mut events = session.attach_events();

    driver.notify(EngineNotification::StateChanged(EngineState::Buffering));
    driver.notify(EngineNotification::StateChanged(EngineState::Ready));

    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingStart);
    assert_eq!(
        recv_event(&mut events).await,
        PlayerEvent::BufferingUpdate {
            buffered_ranges: vec![[0, 1500]],
        }
    );
    assert!(matches!(
        recv_event(&mut events).await,
        PlayerEvent::Initialized { .. }
    ));
    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingEnd);

    session.dispose().await;
}

#[tokio::test]
async fn completed_is_emitted_on_ended() {
    let (engine, driver) = fake_engine(Some(1_000), None);
    let session =
        VideoSession::create(engine, "https://a/clip.mp4", SessionOptions::default(), None)
            .await
            .unwrap();
    let mut events = session.attach_events();

    driver.notify(EngineNotification::StateChanged(EngineState::Ready));
    driver.notify(EngineNotification::StateChanged(EngineState::Ended));

    assert!(matches!(
        recv_event(&mut events).await,
        PlayerEvent::Initialized { .. }
    ));
    assert_eq!(recv_event(&mut events).await, PlayerEvent::Completed);
    assert_eq!(session.status().await.unwrap().state, SessionState::Ended);

    session.dispose().await;
}

#[tokio::test]
async fn volume_is_clamped_before_reaching_the_engine() {
    let (engine, driver) = fake_engine(None, None);
    let session =
        VideoSession::create(engine, "https://a/clip.mp4", SessionOptions::default(), None)
            .await
            .unwrap();

    session.set_volume(-0.5).unwrap();
    session.set_volume(1.7).unwrap();
    session.set_volume(0.25).unwrap();
    // Commands are processed in order; a status round-trip flushes them.
    session.status().await.unwrap();

    assert_eq!(*driver.record.volumes.lock(), vec![0.0, 1.0, 0.25]);
    session.dispose().await;
}

#[tokio::test]
async fn generic_engine_error_is_classified_video_error() {
    let (engine, driver) = fake_engine(None, None);
    let session =
        VideoSession::create(engine, "https://a/clip.mp4", SessionOptions::default(), None)
            .await
            .unwrap();
    let mut events = session.attach_events();

    driver.notify(EngineNotification::StateChanged(EngineState::Buffering));
    driver.notify(EngineNotification::PlaybackError("decoder died".into()));

    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingStart);
    // Buffering update precedes the error path.
    assert!(matches!(
        recv_event(&mut events).await,
        PlayerEvent::BufferingUpdate { .. }
    ));
    // Buffering is cleared before the error is reported.
    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingEnd);
    match recv_event(&mut events).await {
        PlayerEvent::Error { code, message } => {
            assert_eq!(code, "VideoError");
            assert!(message.contains("decoder died"));
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(session.status().await.unwrap().state, SessionState::Failed);

    session.dispose().await;
}

#[tokio::test]
async fn probe_403_reclassifies_the_next_engine_error() {
    let origin_url = spawn_status_origin(403).await;
    let (engine, driver) = fake_engine(None, None);
    let session = VideoSession::create(
        engine,
        &origin_url,
        SessionOptions::default(),
        None,
    )
    .await
    .unwrap();
    let mut events = session.attach_events();

    // Entering a loading phase fires the out-of-band probe.
    driver.notify(EngineNotification::LoadingChanged(true));

    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingStart);
    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingEnd);
    match recv_event(&mut events).await {
        PlayerEvent::Error { code, .. } => assert_eq!(code, "403"),
        other => panic!("expected synthetic 403, got {other:?}"),
    }

    // The engine's own (generic) error now classifies as 403 too.
    driver.notify(EngineNotification::PlaybackError("source error".into()));
    match recv_event(&mut events).await {
        PlayerEvent::Error { code, message } => {
            assert_eq!(code, "403");
            assert!(message.contains("source error"));
        }
        other => panic!("expected 403 error, got {other:?}"),
    }

    session.dispose().await;
}

#[tokio::test]
async fn probe_200_stays_silent() {
    let origin_url = spawn_status_origin(200).await;
    let (engine, driver) = fake_engine(None, None);
    let session = VideoSession::create(engine, &origin_url, SessionOptions::default(), None)
        .await
        .unwrap();
    let mut events = session.attach_events();

    driver.notify(EngineNotification::LoadingChanged(true));
    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingStart);

    tokio::time::sleep(Duration::from_millis(200)).await;
    driver.notify(EngineNotification::PlaybackError("boom".into()));
    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingEnd);
    match recv_event(&mut events).await {
        PlayerEvent::Error { code, .. } => assert_eq!(code, "VideoError"),
        other => panic!("expected VideoError, got {other:?}"),
    }

    session.dispose().await;
}

#[tokio::test]
async fn transient_load_error_schedules_exactly_one_retry() {
    let (engine, driver) = fake_engine(None, None);
    let options = SessionOptions::default().with_load_retry(LoadRetryPolicy {
        delay: Some(Duration::from_millis(50)),
        max_attempts: Some(3),
    });
    let session = VideoSession::create(engine, "https://a/clip.mp4", options, None)
        .await
        .unwrap();

    assert_eq!(driver.record.prepare_count.load(Ordering::SeqCst), 1);
    driver.notify(EngineNotification::LoadError {
        transient: true,
        message: "connection reset".into(),
    });

    // One retry fires after the fixed delay, and only one.
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(driver.record.prepare_count.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(driver.record.prepare_count.load(Ordering::SeqCst), 2);

    session.dispose().await;
}

#[tokio::test]
async fn non_transient_load_error_is_not_retried() {
    let (engine, driver) = fake_engine(None, None);
    let options = SessionOptions::default().with_load_retry(LoadRetryPolicy {
        delay: Some(Duration::from_millis(20)),
        max_attempts: Some(3),
    });
    let session = VideoSession::create(engine, "https://a/clip.mp4", options, None)
        .await
        .unwrap();
    let mut events = session.attach_events();

    driver.notify(EngineNotification::LoadError {
        transient: false,
        message: "unsupported container".into(),
    });

    match recv_event(&mut events).await {
        PlayerEvent::Error { code, .. } => assert_eq!(code, "VideoError"),
        other => panic!("expected error, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.record.prepare_count.load(Ordering::SeqCst), 1);

    session.dispose().await;
}

#[tokio::test]
async fn manifest_strategies_do_not_retry_by_default() {
    let (engine, driver) = fake_engine(None, None);
    let session = VideoSession::create(
        engine,
        "https://a/master.m3u8",
        SessionOptions::default(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(session.source_kind(), MediaSourceKind::SegmentedIndex);
    let mut events = session.attach_events();

    driver.notify(EngineNotification::LoadError {
        transient: true,
        message: "reset".into(),
    });
    match recv_event(&mut events).await {
        PlayerEvent::Error { code, .. } => assert_eq!(code, "VideoError"),
        other => panic!("expected error, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(driver.record.prepare_count.load(Ordering::SeqCst), 1);

    session.dispose().await;
}

#[tokio::test]
async fn dispose_is_idempotent_and_silences_events() {
    let (engine, driver) = fake_engine(None, None);
    let options = SessionOptions::default().with_load_retry(LoadRetryPolicy {
        delay: Some(Duration::from_secs(3600)),
        max_attempts: None,
    });
    let session = VideoSession::create(engine, "https://a/clip.mp4", options, None)
        .await
        .unwrap();
    let mut events = session.attach_events();

    // Leave a retry timer and a probe pending, then dispose.
    driver.notify(EngineNotification::LoadingChanged(true));
    driver.notify(EngineNotification::LoadError {
        transient: true,
        message: "reset".into(),
    });
    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingStart);

    session.dispose().await;
    session.dispose().await;

    assert_eq!(driver.record.release_count.load(Ordering::SeqCst), 1);
    // The closed sink delivers nothing after dispose.
    assert!(tokio::time::timeout(Duration::from_millis(100), events.recv())
        .await
        .map(|e| e.is_none())
        .unwrap_or(true));

    // Commands after dispose fail cleanly instead of panicking.
    assert!(session.play().is_err());
    assert!(session.position().await.is_err());
}

#[tokio::test]
async fn cache_eligible_source_is_routed_through_the_proxy() {
    use core_cache::{ProxyCacheServer, ProxyConfig};

    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(
        ProxyCacheServer::start(ProxyConfig::default().with_cache_dir(dir.path()))
            .await
            .unwrap(),
    );

    let (engine, driver) = fake_engine(None, None);
    let session = VideoSession::create(
        engine,
        "https://a/video.mp4.cachevideo",
        SessionOptions::default(),
        Some(proxy.clone()),
    )
    .await
    .unwrap();

    assert_eq!(session.origin_url(), "https://a/video.mp4");
    assert_eq!(session.source_kind(), MediaSourceKind::Progressive);
    let proxied = session.proxied_url().expect("expected a proxy url");
    assert!(proxied.starts_with("http://127.0.0.1:"));

    // The engine was handed the proxied URL, not the origin.
    let sources = driver.record.sources.lock().clone();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].uri, proxied);
    assert_eq!(sources[0].kind, MediaSourceKind::Progressive);

    session.dispose().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn plain_source_bypasses_the_proxy() {
    use core_cache::{ProxyCacheServer, ProxyConfig};

    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(
        ProxyCacheServer::start(ProxyConfig::default().with_cache_dir(dir.path()))
            .await
            .unwrap(),
    );

    let (engine, _driver) = fake_engine(None, None);
    let session = VideoSession::create(
        engine,
        "https://a/video.mp4",
        SessionOptions::default(),
        Some(proxy.clone()),
    )
    .await
    .unwrap();

    assert!(session.proxied_url().is_none());
    session.dispose().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn cache_authorization_error_emits_buffering_end_then_403() {
    use core_cache::{FetchRetryPolicy, ProxyCacheServer, ProxyConfig};

    let origin_url = spawn_status_origin(403).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(
        ProxyCacheServer::start(
            ProxyConfig::default()
                .with_cache_dir(dir.path())
                .with_retry(FetchRetryPolicy::capped(Duration::from_millis(20), 1)),
        )
        .await
        .unwrap(),
    );

    let (engine, _driver) = fake_engine(None, None);
    let session = VideoSession::create(
        engine,
        &format!("{origin_url}.cachevideo"),
        SessionOptions::default(),
        Some(proxy.clone()),
    )
    .await
    .unwrap();
    let mut events = session.attach_events();

    // Simulate the engine pulling from the proxy, which triggers the fetch.
    let _ = reqwest::get(session.proxied_url().unwrap()).await;

    assert_eq!(recv_event(&mut events).await, PlayerEvent::BufferingEnd);
    match recv_event(&mut events).await {
        PlayerEvent::Error { code, .. } => assert_eq!(code, "403"),
        other => panic!("expected 403, got {other:?}"),
    }

    session.dispose().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn explicit_cache_mode_enables_proxying_without_suffix() {
    use core_cache::{ProxyCacheServer, ProxyConfig};

    let dir = tempfile::tempdir().unwrap();
    let proxy = Arc::new(
        ProxyCacheServer::start(ProxyConfig::default().with_cache_dir(dir.path()))
            .await
            .unwrap(),
    );

    let (engine, _driver) = fake_engine(None, None);
    let session = VideoSession::create(
        engine,
        "https://a/video.mp4",
        SessionOptions::default().with_cache_mode(CacheMode::Enabled),
        Some(proxy.clone()),
    )
    .await
    .unwrap();
    assert!(session.proxied_url().is_some());

    session.dispose().await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn position_and_seek_roundtrip() {
    let (engine, driver) = fake_engine(Some(60_000), None);
    let session = VideoSession::create(
        engine,
        "https://a/clip.mp4",
        SessionOptions::default().with_format_hint(FormatHint::Progressive),
        None,
    )
    .await
    .unwrap();

    session.seek_to(42_000).unwrap();
    assert_eq!(session.position().await.unwrap(), 42_000);
    assert_eq!(*driver.record.seeks.lock(), vec![42_000]);

    session.set_looping(true).unwrap();
    session.set_playback_speed(1.5).unwrap();
    session.status().await.unwrap();
    assert_eq!(*driver.record.looping.lock(), vec![true]);
    assert_eq!(*driver.record.rates.lock(), vec![1.5]);

    session.dispose().await;
}
