//! Sample rate conversion using rubato.

use playaudio_core::{Error, Result};
use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;

/// Input frames per resampler call.
const CHUNK_FRAMES: usize = 1024;

/// Converts interleaved audio from the source rate to the device rate.
///
/// Input is accumulated until a full chunk is available, so `process` may
/// return fewer frames than it was given; `flush` emits the rest.
pub struct Resampler {
    /// `None` when the rates already match.
    inner: Option<FftFixedIn<f32>>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Deinterleaved input waiting for a full chunk.
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 || channels == 0 {
            return Err(Error::InvalidArgument(format!(
                "cannot resample {input_rate}Hz -> {output_rate}Hz with {channels} channels"
            )));
        }

        let inner = if input_rate == output_rate {
            None
        } else {
            debug!(
                "Resampler created: {}Hz -> {}Hz, {} channels",
                input_rate, output_rate, channels
            );
            Some(
                FftFixedIn::new(
                    input_rate as usize,
                    output_rate as usize,
                    CHUNK_FRAMES,
                    2,
                    channels,
                )
                .map_err(|e| Error::AudioOutput(format!("Failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            input_rate,
            output_rate,
            channels,
            pending: vec![Vec::new(); channels],
        })
    }

    pub const fn needs_resampling(&self) -> bool {
        self.inner.is_some()
    }

    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Resample interleaved input, returning whatever output is ready.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };

        for frame in input.chunks_exact(self.channels) {
            for (ch, sample) in frame.iter().enumerate() {
                self.pending[ch].push(*sample);
            }
        }

        let mut output = Vec::new();
        while self.pending[0].len() >= CHUNK_FRAMES {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..CHUNK_FRAMES).collect())
                .collect();

            let resampled = inner
                .process(&chunk, None)
                .map_err(|e| Error::AudioOutput(format!("Resample failed: {e}")))?;
            interleave_into(&resampled, usize::MAX, &mut output);
        }

        Ok(output)
    }

    /// Emit the buffered tail at end of stream, padded with silence and
    /// trimmed to the proportional frame count.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };

        let remaining = self.pending[0].len();
        if remaining == 0 {
            return Ok(Vec::new());
        }

        let chunk: Vec<Vec<f32>> = self
            .pending
            .iter_mut()
            .map(|ch| {
                let mut data = std::mem::take(ch);
                data.resize(CHUNK_FRAMES, 0.0);
                data
            })
            .collect();

        let resampled = inner
            .process(&chunk, None)
            .map_err(|e| Error::AudioOutput(format!("Resample failed: {e}")))?;

        let frames = (remaining as f64 * f64::from(self.output_rate) / f64::from(self.input_rate))
            .round() as usize;
        let mut output = Vec::with_capacity(frames * self.channels);
        interleave_into(&resampled, frames, &mut output);
        Ok(output)
    }

    /// Drop buffered input and filter state.
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
        self.pending.iter_mut().for_each(Vec::clear);
    }
}

/// Append up to `max_frames` frames of planar `channels` to `output`, interleaved.
fn interleave_into(channels: &[Vec<f32>], max_frames: usize, output: &mut Vec<f32>) {
    let Some(first) = channels.first() else {
        return;
    };

    let frames = first.len().min(max_frames);
    output.reserve(frames * channels.len());
    for frame in 0..frames {
        for ch in channels {
            output.push(ch[frame]);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_passthrough_when_rates_match() {
        let mut resampler = Resampler::new(48000, 48000, 2).unwrap();
        assert!(!resampler.needs_resampling());

        let input = vec![0.5f32; 2048];
        assert_eq!(resampler.process(&input).unwrap(), input);
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_resampler_creation() {
        let resampler = Resampler::new(44100, 48000, 2).unwrap();
        assert!(resampler.needs_resampling());
        assert_eq!(resampler.input_rate(), 44100);
        assert_eq!(resampler.output_rate(), 48000);
        assert_eq!(resampler.channels(), 2);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(Resampler::new(0, 48000, 2).is_err());
        assert!(Resampler::new(44100, 48000, 0).is_err());
    }

    #[test]
    fn test_output_is_frame_aligned_and_proportional() {
        let mut resampler = Resampler::new(24000, 48000, 2).unwrap();

        // 3000 stereo frames, not a multiple of the chunk size.
        let input = vec![0.1f32; 6000];
        let mut output = resampler.process(&input).unwrap();
        output.extend(resampler.flush().unwrap());

        assert_eq!(output.len() % 2, 0);
        let frames = output.len() / 2;
        // 3000 frames doubled, allowing for the FFT resampler's delay.
        assert!(frames > 5000 && frames <= 6000, "got {frames} frames");
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut resampler = Resampler::new(44100, 48000, 2).unwrap();
        assert!(resampler.process(&[0.2f32; 200]).unwrap().is_empty());

        resampler.reset();
        assert!(resampler.flush().unwrap().is_empty());
    }
}
