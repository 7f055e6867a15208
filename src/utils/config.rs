//! Configuration management for syncplay
//!
//! This module handles loading and managing configuration from config
//! files and environment variables, layered over built-in defaults.

use crate::audio::{FrameDropPolicy, SyncType};
use crate::decoder::ReorderPts;
use crate::utils::error::{IntoPlayerError, PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Playback behavior
    pub playback: PlaybackConfig,

    /// Decoder configuration
    pub decoder: DecoderConfig,

    /// Audio configuration
    pub audio: AudioConfig,

    /// Video and subtitle configuration
    pub video: VideoConfig,

    /// General application settings
    pub general: GeneralConfig,
}

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Number of times to play the source, 0 loops forever
    pub loop_count: i32,

    /// Frame drop policy when video falls behind
    pub frame_drop: FrameDropPolicy,

    /// Stop reading and report the end as soon as playback finishes
    pub autoexit: bool,

    /// Preferred master clock
    pub sync: SyncType,

    /// Log a periodic status line while playing
    pub show_status: bool,
}

/// Decoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Try hardware decoding first
    pub hardware_acceleration: bool,

    /// Video timestamp source
    pub reorder_pts: ReorderPts,

    /// Number of codec threads (0 = auto-detect)
    pub thread_count: usize,
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Initial volume (0.0 - 1.0)
    pub volume: f32,

    /// Start muted
    pub muted: bool,

    /// Device buffer size in sample frames
    pub buffer_samples: usize,

    /// Ignore audio streams entirely
    pub disabled: bool,
}

/// Video configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Ignore subtitle streams
    pub subtitles_disabled: bool,
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            loop_count: 1,
            frame_drop: FrameDropPolicy::Auto,
            autoexit: false,
            sync: SyncType::Audio,
            show_status: false,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            hardware_acceleration: true,
            reorder_pts: ReorderPts::Auto,
            thread_count: 0,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
            buffer_samples: 1024,
            disabled: false,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            subtitles_disabled: false,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. System config file (/etc/syncplay/config.toml on Linux)
    /// 3. User config file (~/.config/syncplay/config.toml on Linux)
    /// 4. Environment variables (SYNCPLAY_* prefix)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(system_path) = Self::system_config_path() {
            if system_path.exists() {
                config.merge_from_file(&system_path)?;
            }
        }

        if let Some(user_path) = Self::user_config_path() {
            if user_path.exists() {
                config.merge_from_file(&user_path)?;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load defaults overlaid with a single file, then environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.merge_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to user config file
    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()
            .ok_or_else(|| PlayerError::Config("Cannot determine user config path".to_string()))?;
        self.save_to(&path)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).config_err("Failed to create config directory")?;
        }

        let toml = toml::to_string_pretty(self).config_err("Failed to serialize config")?;
        std::fs::write(path, toml).config_err("Failed to write config file")?;

        Ok(())
    }

    /// Merge configuration from a TOML file; keys absent from the file keep
    /// their current value
    fn merge_from_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path).config_err("Failed to read config file")?;
        let overlay: toml::Value = toml::from_str(&contents).config_err("Failed to parse config file")?;

        let mut base = toml::Value::try_from(&*self).config_err("Failed to serialize config")?;
        merge_values(&mut base, overlay);
        *self = base.try_into().config_err("Invalid config file")?;

        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(count) = std::env::var("SYNCPLAY_LOOP") {
            self.playback.loop_count = count
                .parse()
                .map_err(|_| PlayerError::Config("Invalid SYNCPLAY_LOOP".to_string()))?;
        }

        if let Ok(volume) = std::env::var("SYNCPLAY_AUDIO_VOLUME") {
            self.audio.volume = volume
                .parse()
                .map_err(|_| PlayerError::Config("Invalid SYNCPLAY_AUDIO_VOLUME".to_string()))?;
        }

        if let Ok(hw) = std::env::var("SYNCPLAY_HW_ACCEL") {
            self.decoder.hardware_acceleration = hw
                .parse()
                .map_err(|_| PlayerError::Config("Invalid SYNCPLAY_HW_ACCEL".to_string()))?;
        }

        if let Ok(log_level) = std::env::var("SYNCPLAY_LOG_LEVEL") {
            self.general.log_level = log_level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.playback.loop_count < 0 {
            return Err(PlayerError::Config("Loop count must be 0 (forever) or positive".to_string()));
        }

        if !(0.0..=1.0).contains(&self.audio.volume) {
            return Err(PlayerError::Config("Audio volume must be between 0.0 and 1.0".to_string()));
        }

        if self.audio.buffer_samples == 0 {
            return Err(PlayerError::Config("Audio buffer must hold at least one sample".to_string()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.general.log_level.as_str()) {
            return Err(PlayerError::Config(format!(
                "Invalid log level '{}', must be one of: {:?}",
                self.general.log_level, valid_log_levels
            )));
        }

        Ok(())
    }

    /// Get system config file path
    fn system_config_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        return Some(PathBuf::from("/etc/syncplay/config.toml"));

        #[cfg(target_os = "windows")]
        return std::env::var("PROGRAMDATA")
            .ok()
            .map(|p| PathBuf::from(p).join("syncplay").join("config.toml"));

        #[cfg(target_os = "macos")]
        return Some(PathBuf::from("/Library/Application Support/syncplay/config.toml"));

        #[allow(unreachable_code)]
        None
    }

    /// Get user config file path
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("syncplay").join("config.toml"))
    }
}

fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.playback.loop_count, 1);
        assert_eq!(config.playback.frame_drop, FrameDropPolicy::Auto);
        assert!(config.decoder.hardware_acceleration);
        assert_eq!(config.audio.volume, 1.0);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.playback.loop_count = -2;
        assert!(config.validate().is_err());

        config.playback.loop_count = 0;
        config.audio.volume = 1.5;
        assert!(config.validate().is_err());

        config.audio.volume = 0.5;
        config.general.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[playback]\nloop_count = 3\nframe_drop = \"always\"\n").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.playback.loop_count, 3);
        assert_eq!(config.playback.frame_drop, FrameDropPolicy::Always);
        assert!(config.decoder.hardware_acceleration);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.playback.sync = SyncType::External;
        config.audio.muted = true;
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.playback.sync, SyncType::External);
        assert!(reloaded.audio.muted);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[audio]\nvolume = \"loud\"").unwrap();

        match Config::load_from(file.path()) {
            Err(PlayerError::Config(_)) => {}
            other => panic!("Expected Config error, got {:?}", other),
        }
    }
}
