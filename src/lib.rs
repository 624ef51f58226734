//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (e.g., `core-cache`, `core-playback`). Host applications
//! can depend on `vpc-workspace` and enable the documented features without
//! needing to wire each crate individually.
//!
//! Features:
//! - `playback` (default): the full playback stack: session controller,
//!   access validator, and the local caching proxy.
//! - `cache-proxy`: only the caching proxy and its store, for hosts that
//!   bring their own player integration.

#[cfg(any(feature = "playback", feature = "cache-proxy"))]
pub use core_cache;
#[cfg(feature = "playback")]
pub use core_playback;
#[cfg(any(feature = "playback", feature = "cache-proxy"))]
pub use core_runtime;
