//! Sample-rate, channel and length conversion
//!
//! Linear interpolation is enough here: the correction applied for A/V
//! sync never exceeds 10% and device rate mismatches are rare.

use crate::audio::AudioParams;
use crate::decoder::frame::AudioSamples;

/// Converts decoded frames to the device format
#[derive(Debug, Default)]
pub struct Resampler {
    last_input: Option<AudioParams>,
}

impl Resampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert `input` to `target`, stretched or squeezed so it lasts
    /// `wanted_samples` input frames. Appends to `out` after clearing it,
    /// applying `volume`.
    ///
    /// Returns the number of output sample frames.
    pub fn convert(
        &mut self,
        input: &AudioSamples,
        wanted_samples: usize,
        target: AudioParams,
        volume: f32,
        out: &mut Vec<f32>,
    ) -> usize {
        out.clear();
        let src_channels = input.channels.max(1) as usize;
        let dst_channels = target.channels.max(1) as usize;
        let nb_samples = input.nb_samples.min(input.data.len() / src_channels);
        if nb_samples == 0 || input.sample_rate == 0 {
            return 0;
        }

        let input_params = AudioParams::new(input.sample_rate, input.channels);
        if self.last_input != Some(input_params) {
            log::debug!("audio conversion {:?} -> {:?}", input_params, target);
            self.last_input = Some(input_params);
        }

        let out_frames =
            ((wanted_samples as u64 * target.sample_rate as u64 + input.sample_rate as u64 / 2) / input.sample_rate as u64) as usize;
        if out_frames == 0 {
            return 0;
        }
        out.reserve(out_frames * dst_channels);

        let step = nb_samples as f64 / out_frames as f64;
        for frame in 0..out_frames {
            let position = frame as f64 * step;
            let index = (position as usize).min(nb_samples - 1);
            let next = (index + 1).min(nb_samples - 1);
            let fraction = (position - index as f64) as f32;

            let sample_at = |channel: usize| {
                let a = input.data[index * src_channels + channel];
                let b = input.data[next * src_channels + channel];
                a * (1.0 - fraction) + b * fraction
            };

            for channel in 0..dst_channels {
                let value = if dst_channels == 1 && src_channels > 1 {
                    (0..src_channels).map(sample_at).sum::<f32>() / src_channels as f32
                } else if channel < src_channels {
                    sample_at(channel)
                } else if src_channels == 1 {
                    sample_at(0)
                } else {
                    0.0
                };
                out.push(value * volume);
            }
        }

        out_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(channels: u16, nb_samples: usize, sample_rate: u32) -> AudioSamples {
        let data = (0..nb_samples)
            .flat_map(|i| std::iter::repeat(i as f32).take(channels as usize))
            .collect();
        AudioSamples {
            sample_rate,
            channels,
            nb_samples,
            data,
        }
    }

    #[test]
    fn test_passthrough() {
        let input = ramp(2, 8, 48_000);
        let mut out = Vec::new();
        let frames = Resampler::new().convert(&input, 8, AudioParams::new(48_000, 2), 1.0, &mut out);
        assert_eq!(frames, 8);
        assert_eq!(out, input.data);
    }

    #[test]
    fn test_sync_correction_changes_length() {
        let input = ramp(2, 1024, 48_000);
        let mut out = Vec::new();
        let mut resampler = Resampler::new();

        assert_eq!(resampler.convert(&input, 1126, AudioParams::new(48_000, 2), 1.0, &mut out), 1126);
        assert_eq!(out.len(), 1126 * 2);
        assert_eq!(resampler.convert(&input, 921, AudioParams::new(48_000, 2), 1.0, &mut out), 921);
    }

    #[test]
    fn test_rate_conversion() {
        let input = ramp(1, 441, 44_100);
        let mut out = Vec::new();
        let frames = Resampler::new().convert(&input, 441, AudioParams::new(48_000, 1), 1.0, &mut out);
        assert_eq!(frames, 480);
    }

    #[test]
    fn test_channel_mapping_and_volume() {
        let mono = ramp(1, 4, 48_000);
        let mut out = Vec::new();
        Resampler::new().convert(&mono, 4, AudioParams::new(48_000, 2), 0.5, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 1.0, 1.0, 1.5, 1.5]);

        let stereo = AudioSamples {
            sample_rate: 48_000,
            channels: 2,
            nb_samples: 2,
            data: vec![1.0, 3.0, 2.0, 4.0],
        };
        Resampler::new().convert(&stereo, 2, AudioParams::new(48_000, 1), 1.0, &mut out);
        assert_eq!(out, vec![2.0, 3.0]);
    }
}
