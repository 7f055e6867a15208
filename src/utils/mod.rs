//! Utility module for syncplay
//!
//! This module provides common utilities used throughout the engine:
//! - Error handling with custom error types
//! - Configuration management
//! - The monotonic time base shared by every clock

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{AudioConfig, Config, DecoderConfig, PlaybackConfig, VideoConfig};
pub use error::{PlayerError, Result};

use once_cell::sync::Lazy;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds elapsed on the process-wide monotonic clock
///
/// All presentation clocks, frame timers and the audio callback time are
/// measured against this single time base.
pub fn now_seconds() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// Format a position in seconds for display
///
/// Returns "HH:MM:SS" or "MM:SS" for positions under an hour, and "--:--"
/// when the position is unknown.
pub fn format_position(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "--:--".to_string();
    }

    let total_secs = seconds as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
