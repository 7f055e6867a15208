//! Subtitle decoder thread

use crate::decoder::{queue_frame, DecodeOutcome, DecoderCore};
use crate::media::StreamDescriptor;
use crate::player::state::PlaybackContext;
use log::{debug, error};
use std::sync::Arc;

/// Decode subtitle events into `ctx.subpq` until the subtitle queue is
/// aborted
pub fn run(ctx: Arc<PlaybackContext>, mut core: DecoderCore, stream: StreamDescriptor) {
    let tb = stream.time_base.to_f64();

    loop {
        let decoded = match core.decode_frame() {
            DecodeOutcome::Frame(frame) => frame,
            DecodeOutcome::Finished => continue,
            DecodeOutcome::Aborted => break,
            DecodeOutcome::Fatal(msg) => {
                error!("subtitle decoder stopped: {}", msg);
                ctx.subtitleq.abort();
                ctx.subpq.signal();
                break;
            }
        };

        let Some(window) = decoded
            .payload
            .as_subtitle()
            .map(|sub| (sub.start_display_ms, sub.end_display_ms))
        else {
            continue;
        };

        let queued = queue_frame(&core, &ctx.subpq, |slot| {
            slot.pts = decoded.pts.map_or(0.0, |pts| pts as f64 * tb);
            slot.duration = (window.1 as f64 - window.0 as f64) / 1000.0;
            slot.pos = decoded.pos;
            slot.uploaded = false;
            slot.payload.copy_from(&decoded.payload);
        });
        if !queued {
            break;
        }
    }

    debug!("subtitle decoder exiting");
}
