//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the video platform core:
//! - Logging and tracing infrastructure
//! - Player event types and the queuing event sink
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the other crates depend on. It
//! establishes the logging conventions and the event-delivery contract used
//! throughout the system: a session produces an ordered stream of
//! [`events::PlayerEvent`]s into an [`events::EventSink`], and a single
//! downstream consumer attaches to drain them. Events produced while no
//! consumer is attached are queued, never dropped.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
