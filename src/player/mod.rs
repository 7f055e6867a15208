//! Player module for syncplay
//!
//! This module orchestrates playback: a single event-loop thread owns the
//! player state machine and serializes every command, a demuxer thread
//! feeds the packet queues, and the decoders and presentation paths share
//! one [`state::PlaybackContext`] per opened source.

pub mod controller;
pub mod demuxer;
mod media_player;
pub mod state;

pub use controller::{PlayerCommand, PlayerController};
pub use media_player::{EventSubscription, MediaPlayer, MediaPlayerBuilder};
pub use state::{PlaybackContext, PlaybackSettings, SelectedStreams};

use crate::audio::{FrameDropPolicy, SyncType};
use crate::decoder::{PacketQueueStats, ReorderPts};
use crate::utils::config::Config;
use serde::{Deserialize, Serialize};

/// Player state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerState {
    /// Nothing opened
    Closed,

    /// Opened, presentation not started or rewound by `stop`
    Stoped,

    /// Presenting
    Playing,

    /// Presentation frozen, clocks held
    Paused,

    /// Every stream drained and no loop left
    Ended,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlayerState::Closed => "closed",
            PlayerState::Stoped => "stopped",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Notification raised by the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The state machine moved
    StateChanged { old: PlayerState, new: PlayerState },

    /// `open` failed; the player is closed
    OpenFailed { source: String, message: String },
}

/// Player event handler trait
///
/// Handlers run on the event-loop thread and must not block.
pub trait PlayerEventHandler: Send + Sync {
    /// Handle player event
    ///
    /// # Arguments
    ///
    /// * `event` - Player event
    fn handle_event(&mut self, event: PlayerEvent);
}

/// Runtime knobs handed to the player
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Times to play the source, 0 loops forever
    pub loop_count: i32,

    /// Frame drop policy when video falls behind
    pub frame_drop: FrameDropPolicy,

    /// Stop reading once playback has ended
    pub autoexit: bool,

    /// Preferred master clock
    pub sync: SyncType,

    /// Log a status line every second while playing
    pub show_status: bool,

    /// Try hardware decoding first
    pub hardware_acceleration: bool,

    /// Video timestamp source
    pub reorder_pts: ReorderPts,

    /// Codec worker threads, 0 lets the codec decide
    pub decoder_threads: usize,

    /// Initial volume (0.0 to 1.0)
    pub volume: f32,

    pub muted: bool,

    /// Device buffer size in sample frames
    pub audio_buffer_samples: usize,

    /// Ignore audio streams
    pub audio_disabled: bool,

    /// Ignore subtitle streams
    pub subtitles_disabled: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PlayerConfig {
    fn from(config: &Config) -> Self {
        Self {
            loop_count: config.playback.loop_count,
            frame_drop: config.playback.frame_drop,
            autoexit: config.playback.autoexit,
            sync: config.playback.sync,
            show_status: config.playback.show_status,
            hardware_acceleration: config.decoder.hardware_acceleration,
            reorder_pts: config.decoder.reorder_pts,
            decoder_threads: config.decoder.thread_count,
            volume: config.audio.volume,
            muted: config.audio.muted,
            audio_buffer_samples: config.audio.buffer_samples,
            audio_disabled: config.audio.disabled,
            subtitles_disabled: config.video.subtitles_disabled,
        }
    }
}

/// Playback statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackStats {
    /// Master clock in seconds, NaN before anything was presented
    pub position: f64,

    /// Audio minus video clock, 0 when unknown
    pub av_diff: f64,

    /// Pictures dropped before they were queued
    pub frame_drops_early: u64,

    /// Pictures dropped by the refresh tick
    pub frame_drops_late: u64,

    pub video_queue: PacketQueueStats,
    pub audio_queue: PacketQueueStats,
    pub subtitle_queue: PacketQueueStats,

    /// Decoded pictures waiting to be shown
    pub pictures_queued: usize,

    /// Decoded audio frames waiting for the device
    pub samples_queued: usize,
}

impl PlaybackStats {
    /// Early plus late drops
    pub fn frame_drops(&self) -> u64 {
        self.frame_drops_early + self.frame_drops_late
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_config_from_config() {
        let mut config = Config::default();
        config.playback.loop_count = 0;
        config.audio.muted = true;
        config.decoder.hardware_acceleration = false;

        let player = PlayerConfig::from(&config);
        assert_eq!(player.loop_count, 0);
        assert!(player.muted);
        assert!(!player.hardware_acceleration);
        assert_eq!(player.sync, SyncType::Audio);
    }

    #[test]
    fn test_stats_drop_total() {
        let stats = PlaybackStats {
            frame_drops_early: 2,
            frame_drops_late: 3,
            ..Default::default()
        };
        assert_eq!(stats.frame_drops(), 5);
    }
}
