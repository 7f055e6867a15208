//! Audio decoder thread

use crate::decoder::{queue_frame, DecodeOutcome, DecoderCore};
use crate::player::state::PlaybackContext;
use log::{debug, error, warn};
use std::sync::Arc;

/// Decode sample frames into `ctx.sampq` until the audio queue is aborted
pub fn run(ctx: Arc<PlaybackContext>, mut core: DecoderCore) {
    loop {
        let decoded = match core.decode_frame() {
            DecodeOutcome::Frame(frame) => frame,
            DecodeOutcome::Finished => continue,
            DecodeOutcome::Aborted => break,
            DecodeOutcome::Fatal(msg) => {
                error!("audio decoder stopped: {}", msg);
                ctx.audioq.abort();
                ctx.sampq.signal();
                break;
            }
        };

        let (sample_rate, nb_samples) = match decoded.payload.as_audio() {
            Some(samples) if samples.sample_rate > 0 => (samples.sample_rate as f64, samples.nb_samples as f64),
            _ => {
                warn!("audio decoder produced a frame without samples");
                continue;
            }
        };

        let queued = queue_frame(&core, &ctx.sampq, |slot| {
            // normalized pts is in 1/sample_rate units
            slot.pts = decoded.pts.map_or(f64::NAN, |pts| pts as f64 / sample_rate);
            slot.duration = nb_samples / sample_rate;
            slot.pos = decoded.pos;
            slot.payload.copy_from(&decoded.payload);
        });
        if !queued {
            break;
        }
    }

    debug!("audio decoder exiting");
}
