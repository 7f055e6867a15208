//! Video decoder thread

use crate::audio::sync::AV_NOSYNC_THRESHOLD;
use crate::decoder::{queue_frame, DecodeOutcome, DecoderCore};
use crate::media::StreamDescriptor;
use crate::player::state::PlaybackContext;
use log::{debug, error, trace};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Whether a picture that is already late should be dropped before it is
/// queued. `diff` is `pts - master_clock`.
pub fn should_drop_early(diff: f64, pkt_serial: i32, clock_serial: i32, queued_packets: usize) -> bool {
    !diff.is_nan()
        && diff.abs() < AV_NOSYNC_THRESHOLD
        && diff < 0.0
        && pkt_serial == clock_serial
        && queued_packets > 0
}

/// Decode pictures into `ctx.pictq` until the video queue is aborted
pub fn run(ctx: Arc<PlaybackContext>, mut core: DecoderCore, stream: StreamDescriptor) {
    let tb = stream.time_base.to_f64();
    let frame_duration = stream
        .frame_rate
        .filter(|rate| rate.is_valid())
        .map(|rate| rate.invert().to_f64())
        .unwrap_or(0.0);

    loop {
        let decoded = match core.decode_frame() {
            DecodeOutcome::Frame(frame) => frame,
            DecodeOutcome::Finished => continue,
            DecodeOutcome::Aborted => break,
            DecodeOutcome::Fatal(msg) => {
                error!("video decoder stopped: {}", msg);
                ctx.videoq.abort();
                ctx.pictq.signal();
                break;
            }
        };

        let pts = decoded.pts.map_or(f64::NAN, |pts| pts as f64 * tb);

        if decoded.pts.is_some() && ctx.frame_drop_policy().allows_drop(ctx.master_sync_type()) {
            let diff = pts - ctx.master_clock();
            if should_drop_early(diff, core.pkt_serial(), ctx.vidclk.serial(), ctx.videoq.nb_packets()) {
                ctx.frame_drops_early.fetch_add(1, Ordering::Relaxed);
                trace!("early drop pts={:.3} diff={:.3}", pts, diff);
                continue;
            }
        }

        let queued = queue_frame(&core, &ctx.pictq, |slot| {
            slot.pts = pts;
            slot.duration = frame_duration;
            slot.pos = decoded.pos;
            slot.uploaded = false;
            slot.payload.copy_from(&decoded.payload);
        });
        if !queued {
            break;
        }
    }

    debug!("video decoder exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_drop_window() {
        // slightly late, same epoch, more input waiting
        assert!(should_drop_early(-0.2, 3, 3, 4));
        // ahead of the master
        assert!(!should_drop_early(0.2, 3, 3, 4));
        // too far off to trust
        assert!(!should_drop_early(-12.0, 3, 3, 4));
        // clock still on an older epoch
        assert!(!should_drop_early(-0.2, 3, 2, 4));
        // last queued picture is always kept
        assert!(!should_drop_early(-0.2, 3, 3, 0));
        assert!(!should_drop_early(f64::NAN, 3, 3, 4));
    }
}
