//! # Playback Session Core
//!
//! The playback session controller for the video platform: owns one playback
//! engine instance, picks a media-source strategy, optionally routes the
//! source through the local cache proxy, applies a retry policy to transient
//! load errors, and reports an ordered event stream to the host.
//!
//! An out-of-band access validator probes the original URL whenever the
//! engine enters a loading phase, so authorization failures (403) can be
//! distinguished from generic playback errors the engine cannot classify
//! itself.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use core_playback::{SessionOptions, VideoSession};
//! # use core_playback::engine::PlaybackEngine;
//!
//! # async fn example(engine: Box<dyn PlaybackEngine>) -> core_playback::Result<()> {
//! let options = SessionOptions::default();
//! let session = VideoSession::create(
//!     engine,
//!     "https://cdn.example.com/clip.mp4.cachevideo",
//!     options,
//!     None, // or Some(proxy) to enable caching
//! )
//! .await?;
//!
//! let mut events = session.attach_events();
//! session.play()?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod source;
pub mod validator;

pub use config::{LoadRetryPolicy, SessionOptions};
pub use engine::{EngineNotification, EngineState, PlaybackEngine, VideoDimensions};
pub use error::{Result, SessionError};
pub use session::{SessionState, VideoSession};
pub use source::{CacheMode, FormatHint, MediaSourceKind};
pub use validator::AccessValidator;
