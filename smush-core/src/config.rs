// ============================================================================
// Playback configuration
// ============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How `IACT` audio is laid out in the containers being played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioLayout {
    /// Numbered iMUS tracks
    Tracked,
    /// One compressed stereo stream
    Interleaved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub screen_width: usize,
    pub screen_height: usize,
    pub default_fps: u32,
    pub subtitles: bool,
    /// Decode frame objects smaller than the screen (sprite overlays)
    pub permissive_sizes: bool,
    pub audio_layout: AudioLayout,
    pub strings_file: Option<String>,
    pub compressed_audio_extensions: Vec<String>,
    pub max_channels: usize,
    pub skip_streak_limit: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            screen_width: 320,
            screen_height: 200,
            default_fps: 15,
            subtitles: true,
            permissive_sizes: false,
            audio_layout: AudioLayout::Tracked,
            strings_file: None,
            compressed_audio_extensions: vec!["ogg".into(), "mp3".into(), "flac".into()],
            max_channels: 16,
            skip_streak_limit: 10,
        }
    }
}

impl PlaybackConfig {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file; a missing file yields the defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.screen_width == 0 || self.screen_height == 0 {
            return Err(ConfigError::Invalid("screen size must be non-zero".into()));
        }
        if self.default_fps == 0 {
            return Err(ConfigError::Invalid("default_fps must be non-zero".into()));
        }
        if self.max_channels == 0 {
            return Err(ConfigError::Invalid("max_channels must be non-zero".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
