//! Audio/video synchronization logic for syncplay
//!
//! Master clock selection, the audio sample-count correction used when
//! audio follows another clock, and the per-frame video delay that decides
//! whether a picture is shown early, late, repeated or dropped.

use crate::decoder::frame::FrameTiming;
use serde::{Deserialize, Serialize};

/// No A/V correction below this delay threshold (seconds)
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// A/V correction always applies above this threshold (seconds)
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are not duplicated to catch up
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// No correction at all beyond this difference; treated as a desync
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;
/// Maximum audio speed change, in percent
pub const SAMPLE_CORRECTION_PERCENT_MAX: i32 = 10;
/// Measurements averaged before audio correction starts
pub const AUDIO_DIFF_AVG_NB: u32 = 20;
/// Video refresh tick when nothing is due earlier (seconds)
pub const REFRESH_RATE: f64 = 0.01;

/// Clock the other streams follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Audio,
    Video,
    External,
}

impl SyncType {
    /// Sync type chosen at open: audio-master needs an audio stream,
    /// otherwise video drives playback
    pub fn for_streams(requested: SyncType, has_audio: bool, has_video: bool) -> SyncType {
        match requested {
            SyncType::Audio if !has_audio && has_video => SyncType::Video,
            other => other,
        }
    }

    /// Effective master given which streams are open
    pub fn resolve(self, has_audio: bool, has_video: bool) -> SyncType {
        match self {
            SyncType::Video if has_video => SyncType::Video,
            SyncType::Video | SyncType::Audio if has_audio => SyncType::Audio,
            _ => SyncType::External,
        }
    }
}

impl std::str::FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(SyncType::Audio),
            "video" => Ok(SyncType::Video),
            "ext" | "external" => Ok(SyncType::External),
            other => Err(format!("unknown sync source '{}'", other)),
        }
    }
}

/// When video frames may be dropped to keep up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDropPolicy {
    Never,
    Always,
    /// Only while video is not the master clock
    Auto,
}

impl FrameDropPolicy {
    pub fn allows_drop(self, master: SyncType) -> bool {
        match self {
            FrameDropPolicy::Never => false,
            FrameDropPolicy::Always => true,
            FrameDropPolicy::Auto => master != SyncType::Video,
        }
    }
}

impl std::str::FromStr for FrameDropPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" | "no" => Ok(FrameDropPolicy::Never),
            "always" | "yes" => Ok(FrameDropPolicy::Always),
            "auto" => Ok(FrameDropPolicy::Auto),
            other => Err(format!("unknown frame drop policy '{}'", other)),
        }
    }
}

/// Running A-V difference filter for the audio sample correction
#[derive(Debug, Clone)]
pub struct AudioSyncState {
    diff_cum: f64,
    avg_coef: f64,
    threshold: f64,
    avg_count: u32,
}

impl AudioSyncState {
    /// `threshold` is the device buffer length in seconds; smaller
    /// average differences are not corrected
    pub fn new(threshold: f64) -> Self {
        Self {
            diff_cum: 0.0,
            avg_coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            threshold,
            avg_count: 0,
        }
    }

    /// Sample count to produce for a frame of `nb_samples`, given the
    /// current `diff = audio_clock - master_clock`
    pub fn wanted_samples(&mut self, nb_samples: usize, diff: f64, sample_rate: u32) -> usize {
        let mut wanted = nb_samples as i64;

        if !diff.is_nan() && diff.abs() < AV_NOSYNC_THRESHOLD {
            self.diff_cum = diff + self.avg_coef * self.diff_cum;
            if self.avg_count < AUDIO_DIFF_AVG_NB {
                self.avg_count += 1;
            } else {
                let avg_diff = self.diff_cum * (1.0 - self.avg_coef);
                if avg_diff.abs() >= self.threshold {
                    let nb = nb_samples as i64;
                    let min = nb * (100 - SAMPLE_CORRECTION_PERCENT_MAX as i64) / 100;
                    let max = nb * (100 + SAMPLE_CORRECTION_PERCENT_MAX as i64) / 100;
                    wanted = (nb + (diff * sample_rate as f64) as i64).clamp(min, max);
                }
                log::trace!(
                    "diff={:.6} adiff={:.6} sample_diff={} thr={:.3}",
                    diff,
                    avg_diff,
                    wanted - nb_samples as i64,
                    self.threshold
                );
            }
        } else {
            // too big a difference: initial pts errors, restart the filter
            self.avg_count = 0;
            self.diff_cum = 0.0;
        }

        wanted.max(0) as usize
    }

    pub fn reset(&mut self) {
        self.avg_count = 0;
        self.diff_cum = 0.0;
    }
}

/// Delay before showing the next frame, nudged toward the master clock
///
/// `diff` is `video_clock - master_clock` and is ignored when video is the
/// master.
pub fn compute_target_delay(delay: f64, video_is_master: bool, diff: f64, max_frame_duration: f64) -> f64 {
    if video_is_master {
        return delay;
    }

    let sync_threshold = AV_SYNC_THRESHOLD_MIN.max(AV_SYNC_THRESHOLD_MAX.min(delay));
    let mut delay = delay;
    if !diff.is_nan() && diff.abs() < max_frame_duration {
        if diff <= -sync_threshold {
            delay = (delay + diff).max(0.0);
        } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
            delay += diff;
        } else if diff >= sync_threshold {
            delay *= 2.0;
        }
    }

    log::trace!("video: delay={:.3} A-V={:.3}", delay, -diff);
    delay
}

/// Display duration of `vp` given the frame after it
pub fn vp_duration(vp: &FrameTiming, next: &FrameTiming, max_frame_duration: f64) -> f64 {
    if vp.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - vp.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        vp.duration
    } else {
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn timing(serial: i32, pts: f64, duration: f64) -> FrameTiming {
        FrameTiming { serial, pts, duration, pos: -1 }
    }

    #[test]
    fn test_target_delay_catches_up_to_zero() {
        let delay = compute_target_delay(0.033, false, -5.0, 3600.0);
        assert_eq!(delay, 0.0);
    }

    #[test]
    fn test_target_delay_stretches_long_frames() {
        let delay = compute_target_delay(0.15, false, 5.0, 3600.0);
        assert!((delay - 5.15).abs() < 1e-9);
    }

    #[test]
    fn test_target_delay_doubles_short_frames() {
        let delay = compute_target_delay(0.04, false, 0.05, 3600.0);
        assert!((delay - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_target_delay_untouched() {
        // video master
        assert_eq!(compute_target_delay(0.04, true, -3.0, 3600.0), 0.04);
        // inside the threshold
        assert_eq!(compute_target_delay(0.04, false, 0.01, 3600.0), 0.04);
        // unknown difference
        assert_eq!(compute_target_delay(0.04, false, f64::NAN, 3600.0), 0.04);
        // beyond the trusted frame duration
        assert_eq!(compute_target_delay(0.04, false, -20.0, 10.0), 0.04);
    }

    #[test]
    fn test_vp_duration() {
        let a = timing(1, 1.0, 0.04);
        assert!((vp_duration(&a, &timing(1, 1.033, 0.04), 3600.0) - 0.033).abs() < 1e-9);
        // non-increasing pts falls back to the estimated duration
        assert_eq!(vp_duration(&a, &timing(1, 0.5, 0.04), 3600.0), 0.04);
        // too long for a discontinuous source
        assert_eq!(vp_duration(&a, &timing(1, 20.0, 0.04), 10.0), 0.04);
        // across a discontinuity
        assert_eq!(vp_duration(&a, &timing(2, 1.04, 0.04), 3600.0), 0.0);
    }

    #[test]
    fn test_audio_correction_waits_for_measurements() {
        let mut sync = AudioSyncState::new(0.02);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(sync.wanted_samples(1024, 0.5, 48_000), 1024);
        }
        assert_eq!(sync.wanted_samples(1024, 0.5, 48_000), 1126);
        // the average is still positive, the instantaneous diff sets the direction
        assert_eq!(sync.wanted_samples(1024, -0.5, 48_000), 921);
    }

    #[test]
    fn test_audio_correction_resets_on_desync() {
        let mut sync = AudioSyncState::new(0.02);
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            sync.wanted_samples(1024, 0.5, 48_000);
        }
        assert_eq!(sync.wanted_samples(1024, 30.0, 48_000), 1024);
        // filter restarted: needs a fresh warm-up
        assert_eq!(sync.wanted_samples(1024, 0.5, 48_000), 1024);
    }

    #[test]
    fn test_sync_type_resolution() {
        assert_eq!(SyncType::for_streams(SyncType::Audio, false, true), SyncType::Video);
        assert_eq!(SyncType::for_streams(SyncType::Audio, true, true), SyncType::Audio);

        assert_eq!(SyncType::Video.resolve(true, false), SyncType::Audio);
        assert_eq!(SyncType::Video.resolve(false, false), SyncType::External);
        assert_eq!(SyncType::Audio.resolve(false, true), SyncType::External);
        assert_eq!(SyncType::External.resolve(true, true), SyncType::External);
    }

    #[test]
    fn test_frame_drop_policy() {
        assert!(!FrameDropPolicy::Never.allows_drop(SyncType::Audio));
        assert!(FrameDropPolicy::Always.allows_drop(SyncType::Video));
        assert!(FrameDropPolicy::Auto.allows_drop(SyncType::Audio));
        assert!(!FrameDropPolicy::Auto.allows_drop(SyncType::Video));
        assert_eq!("yes".parse::<FrameDropPolicy>().unwrap(), FrameDropPolicy::Always);
    }

    proptest! {
        #[test]
        fn audio_correction_stays_within_ten_percent(
            warmup in -9.9f64..9.9,
            diff in -1.0e6f64..1.0e6,
            rate in 8_000u32..192_000,
        ) {
            let mut sync = AudioSyncState::new(0.0);
            for _ in 0..AUDIO_DIFF_AVG_NB {
                sync.wanted_samples(1024, warmup, rate);
            }
            let wanted = sync.wanted_samples(1024, diff, rate);
            prop_assert!((921..=1127).contains(&wanted));
        }

        #[test]
        fn target_delay_is_never_negative(
            delay in 0.0f64..1.0,
            diff in -100.0f64..100.0,
        ) {
            prop_assert!(compute_target_delay(delay, false, diff, 3600.0) >= 0.0);
        }
    }
}
