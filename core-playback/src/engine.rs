//! # Playback Engine Seam
//!
//! The trait boundary between the session controller and the decoding /
//! rendering engine. The engine is an external collaborator: the controller
//! only configures it, forwards commands, and observes its state-change
//! notifications. Implementations wrap a platform player; tests use a
//! scripted fake.

use crate::error::Result;
use crate::source::MediaSourceKind;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Raw video format of a prepared source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoDimensions {
    /// Encoded frame width in pixels.
    pub width: u32,
    /// Encoded frame height in pixels.
    pub height: u32,
    /// Rotation the display must apply, in degrees (0, 90, 180, 270).
    pub rotation_degrees: u32,
}

impl VideoDimensions {
    /// Upright display dimensions.
    ///
    /// Sources recorded in portrait carry 90°/270° rotation metadata with
    /// landscape-encoded frames; the width/height are swapped so reported
    /// dimensions always reflect the upright orientation.
    pub fn upright(&self) -> (u32, u32) {
        if self.rotation_degrees == 90 || self.rotation_degrees == 270 {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

/// Coarse engine playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No source prepared or playback stopped.
    Idle,
    /// The engine is buffering before it can (re)start playback.
    Buffering,
    /// Enough media buffered; playback can run.
    Ready,
    /// The terminal playback position was reached.
    Ended,
}

/// Notifications the engine posts to its single state-change listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    /// The coarse playback state changed.
    StateChanged(EngineState),
    /// The engine started or stopped loading data from its source.
    LoadingChanged(bool),
    /// A source load failed. `transient` marks transport-level failures
    /// that a retry may fix.
    LoadError { transient: bool, message: String },
    /// A fatal engine error; playback cannot continue.
    PlaybackError(String),
}

/// The source configuration handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSource {
    /// URI the engine reads from (origin or local proxy URL).
    pub uri: String,
    /// Selected media-source strategy.
    pub kind: MediaSourceKind,
    /// Request headers for HTTP sources.
    pub headers: HashMap<String, String>,
}

/// Contract consumed from the playback engine.
///
/// All methods are called from the session's owning task only; the engine
/// reports back through the receiver returned by
/// [`PlaybackEngine::notifications`].
#[async_trait]
pub trait PlaybackEngine: Send {
    /// Configure the media source. Called once before [`PlaybackEngine::prepare`].
    async fn set_source(&mut self, source: &EngineSource) -> Result<()>;

    /// Start (or re-start, after a load error) loading the configured source.
    async fn prepare(&mut self) -> Result<()>;

    /// Begin or resume playback.
    async fn play(&mut self) -> Result<()>;

    /// Pause playback.
    async fn pause(&mut self) -> Result<()>;

    /// Seek to an absolute position.
    async fn seek_to(&mut self, position_ms: u64) -> Result<()>;

    /// Set the volume. The caller clamps to `[0, 1]`.
    async fn set_volume(&mut self, volume: f64) -> Result<()>;

    /// Set the playback rate (no pitch correction).
    async fn set_rate(&mut self, rate: f64) -> Result<()>;

    /// Loop at the end of the media instead of ending.
    async fn set_looping(&mut self, looping: bool) -> Result<()>;

    /// Mix audio with other sessions instead of taking audio focus.
    async fn set_audio_mixing(&mut self, mix_with_others: bool) -> Result<()>;

    /// Current playback position in milliseconds.
    fn position_ms(&self) -> u64;

    /// Media duration in milliseconds, once known.
    fn duration_ms(&self) -> Option<u64>;

    /// Raw video format of the prepared source, if it carries video.
    fn video_dimensions(&self) -> Option<VideoDimensions>;

    /// End of the buffered region in milliseconds.
    fn buffered_position_ms(&self) -> u64;

    /// Take the engine's notification stream.
    ///
    /// Called exactly once, before the session loop starts.
    fn notifications(&mut self) -> mpsc::UnboundedReceiver<EngineNotification>;

    /// Stop playback, keeping resources.
    async fn stop(&mut self);

    /// Release every engine resource. The engine is unusable afterwards.
    async fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upright_swaps_for_portrait_rotations() {
        let dims = VideoDimensions {
            width: 1920,
            height: 1080,
            rotation_degrees: 90,
        };
        assert_eq!(dims.upright(), (1080, 1920));

        let dims = VideoDimensions {
            rotation_degrees: 270,
            ..dims
        };
        assert_eq!(dims.upright(), (1080, 1920));
    }

    #[test]
    fn test_upright_keeps_landscape_rotations() {
        let dims = VideoDimensions {
            width: 1920,
            height: 1080,
            rotation_degrees: 0,
        };
        assert_eq!(dims.upright(), (1920, 1080));

        let dims = VideoDimensions {
            rotation_degrees: 180,
            ..dims
        };
        assert_eq!(dims.upright(), (1920, 1080));
    }
}
