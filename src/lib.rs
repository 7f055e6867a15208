//! syncplay - a real-time audio/video playback engine
//!
//! A demuxer thread reads compressed packets into serial-tagged packet
//! queues, one decoder thread per stream fills bounded frame queues, and
//! the audio device callback and the video refresh tick present frames
//! against a master clock. Seeking bumps the queue serials so stale data
//! in flight is recognised and dropped everywhere downstream.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use syncplay::media::{SyntheticBackend, SyntheticConfig};
//! use syncplay::{MediaPlayerBuilder, PlayerState};
//!
//! let player = MediaPlayerBuilder::new()
//!     .with_backend(Arc::new(SyntheticBackend::new(SyntheticConfig::default())))
//!     .build()?;
//! player.open("tone")?;
//! player.wait_for_state(PlayerState::Stoped, Duration::from_secs(1));
//! player.play()?;
//! # Ok::<(), syncplay::PlayerError>(())
//! ```

pub mod audio;
pub mod decoder;
pub mod media;
pub mod player;
pub mod renderer;
pub mod utils;

pub use player::{
    EventSubscription, MediaPlayer, MediaPlayerBuilder, PlaybackStats, PlayerConfig, PlayerEvent, PlayerEventHandler,
    PlayerState,
};
pub use utils::error::{PlayerError, Result};
