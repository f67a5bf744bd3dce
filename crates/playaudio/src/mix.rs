//! Channel layout conversion and the stereo pan/gain transform.

use playaudio_core::{Error, Result};

/// Most channels a source may have. Anything wider is rejected.
pub const MAX_SOURCE_CHANNELS: u16 = 2;

/// Upper bound for the linear gain parameter.
pub const MAX_GAIN: f32 = 4.0;

/// Stereo transform applied to every output frame.
///
/// Built from the three floats callers pass to `playAudio`:
/// balance, crossfeed, and linear gain. `(0.0, 0.0, 1.0)` is the identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoTransform {
    /// Balance: -1.0 is left only, 0.0 is centre, 1.0 is right only.
    pub pan: f32,
    /// 0.0 leaves channels alone, 1.0 folds both to the mono sum.
    pub crossfeed: f32,
    /// Linear gain.
    pub gain: f32,
}

impl Default for StereoTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl StereoTransform {
    pub const IDENTITY: Self = Self {
        pan: 0.0,
        crossfeed: 0.0,
        gain: 1.0,
    };

    /// Build a transform from untrusted parameters.
    ///
    /// Non-finite values fall back to the identity value for that field;
    /// everything else is clamped into range.
    pub fn from_raw(pan: f32, crossfeed: f32, gain: f32) -> Self {
        let sanitize = |value: f32, fallback: f32, min: f32, max: f32| {
            if value.is_finite() {
                value.clamp(min, max)
            } else {
                fallback
            }
        };

        Self {
            pan: sanitize(pan, 0.0, -1.0, 1.0),
            crossfeed: sanitize(crossfeed, 0.0, 0.0, 1.0),
            gain: sanitize(gain, 1.0, 0.0, MAX_GAIN),
        }
    }

    /// Returns true if `apply` would leave samples untouched.
    #[allow(clippy::float_cmp)]
    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Per-channel gains `(left, right)` including balance and master gain.
    pub fn channel_gains(&self) -> (f32, f32) {
        let left = (1.0 - self.pan).min(1.0);
        let right = (1.0 + self.pan).min(1.0);
        (left * self.gain, right * self.gain)
    }

    /// Transform interleaved stereo samples in place.
    pub fn apply(&self, samples: &mut [f32]) {
        if self.is_identity() {
            return;
        }

        let (left_gain, right_gain) = self.channel_gains();
        let keep = 1.0 - self.crossfeed * 0.5;
        let bleed = self.crossfeed * 0.5;

        for frame in samples.chunks_exact_mut(2) {
            let (l, r) = (frame[0], frame[1]);
            frame[0] = (l * keep + r * bleed) * left_gain;
            frame[1] = (r * keep + l * bleed) * right_gain;
        }
    }
}

/// Convert interleaved samples with `channels` channels to interleaved stereo.
pub fn to_stereo(samples: Vec<f32>, channels: u16) -> Result<Vec<f32>> {
    match channels {
        2 => Ok(samples),
        1 => Ok(samples.iter().flat_map(|&s| [s, s]).collect()),
        n => Err(Error::UnsupportedFormat(format!("too many channels: {n}"))),
    }
}

/// Check a source channel count before decoding starts.
pub fn check_source_channels(channels: u16) -> Result<()> {
    if channels == 0 {
        return Err(Error::UnsupportedFormat("source has no channels".to_string()));
    }
    if channels > MAX_SOURCE_CHANNELS {
        return Err(Error::UnsupportedFormat(format!(
            "too many channels: {channels}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identity_from_call_site_defaults() {
        assert!(StereoTransform::from_raw(0.0, 0.0, 1.0).is_identity());
        assert!(!StereoTransform::from_raw(0.0, 0.0, 0.1).is_identity());
    }

    #[test]
    fn test_gain_only() {
        let mut samples = vec![0.5, -0.5, 1.0, -1.0];
        StereoTransform::from_raw(0.0, 0.0, 0.1).apply(&mut samples);
        let expected = [0.05, -0.05, 0.1, -0.1];
        for (got, want) in samples.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_hard_pan() {
        let mut samples = vec![0.5, 0.5];
        StereoTransform::from_raw(-1.0, 0.0, 1.0).apply(&mut samples);
        assert_eq!(samples, [0.5, 0.0]);

        let mut samples = vec![0.5, 0.5];
        StereoTransform::from_raw(1.0, 0.0, 1.0).apply(&mut samples);
        assert_eq!(samples, [0.0, 0.5]);
    }

    #[test]
    fn test_full_crossfeed_is_mono() {
        let mut samples = vec![1.0, 0.0];
        StereoTransform::from_raw(0.0, 1.0, 1.0).apply(&mut samples);
        assert_eq!(samples, [0.5, 0.5]);
    }

    #[test]
    fn test_sanitize_non_finite() {
        let t = StereoTransform::from_raw(f32::NAN, f32::INFINITY, f32::NEG_INFINITY);
        assert!(t.is_identity());

        let t = StereoTransform::from_raw(-7.0, 3.0, 100.0);
        assert_eq!(t.pan, -1.0);
        assert_eq!(t.crossfeed, 1.0);
        assert_eq!(t.gain, MAX_GAIN);
    }

    #[test]
    fn test_to_stereo() {
        assert_eq!(to_stereo(vec![0.1, 0.2], 1).unwrap(), [0.1, 0.1, 0.2, 0.2]);
        assert_eq!(to_stereo(vec![0.1, 0.2], 2).unwrap(), [0.1, 0.2]);
        assert!(matches!(
            to_stereo(vec![0.0; 6], 6),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_check_source_channels() {
        assert!(check_source_channels(1).is_ok());
        assert!(check_source_channels(2).is_ok());
        assert!(check_source_channels(0).is_err());
        assert!(check_source_channels(6).is_err());
    }

    proptest! {
        #[test]
        fn prop_output_bounded_by_gain(
            pan in -1.0f32..=1.0,
            crossfeed in 0.0f32..=1.0,
            gain in 0.0f32..=MAX_GAIN,
            l in -1.0f32..=1.0,
            r in -1.0f32..=1.0,
        ) {
            let t = StereoTransform::from_raw(pan, crossfeed, gain);
            let mut frame = [l, r];
            t.apply(&mut frame);
            let bound = gain * l.abs().max(r.abs()) + 1e-5;
            prop_assert!(frame[0].abs() <= bound);
            prop_assert!(frame[1].abs() <= bound);
        }

        #[test]
        fn prop_from_raw_always_in_range(pan: f32, crossfeed: f32, gain: f32) {
            let t = StereoTransform::from_raw(pan, crossfeed, gain);
            prop_assert!((-1.0..=1.0).contains(&t.pan));
            prop_assert!((0.0..=1.0).contains(&t.crossfeed));
            prop_assert!((0.0..=MAX_GAIN).contains(&t.gain));
        }

        #[test]
        fn prop_identity_is_noop(samples in proptest::collection::vec(-1.0f32..=1.0, 0..64)) {
            let mut out = samples.clone();
            StereoTransform::IDENTITY.apply(&mut out);
            prop_assert_eq!(out, samples);
        }
    }
}
