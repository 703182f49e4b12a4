//! # SMUSH Core
//!
//! Demuxer and playback engine for SMUSH (`ANIM`) cutscene containers.
//! The host supplies a [`host::Display`], an [`host::AudioMixer`] and an
//! [`host::AssetSource`]; a [`player::PlaybackSession`] does the rest.

// ============================================================================
// Container
// ============================================================================
pub mod chunk;
pub mod probe;

// ============================================================================
// Video
// ============================================================================
pub mod codec;
pub mod palette;
pub mod text;

// ============================================================================
// Audio
// ============================================================================
pub mod channel;
pub mod mixer;

// ============================================================================
// Playback
// ============================================================================
pub mod config;
pub mod host;
pub mod player;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::PlaybackConfig;
pub use player::{PlaybackError, PlaybackSession, PresentationCommand};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
