//! Engine configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `PLAYAUDIO_*` environment variables.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PLAYAUDIO_CONFIG";

const OUTPUT_ENV: &str = "PLAYAUDIO_OUTPUT";
const DEVICE_ENV: &str = "PLAYAUDIO_DEVICE";
const DECODER_ENV: &str = "PLAYAUDIO_DECODER";
const FFMPEG_ENV: &str = "PLAYAUDIO_FFMPEG";
const VOLUME_ENV: &str = "PLAYAUDIO_VOLUME";

/// Where decoded audio goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum OutputBackend {
    /// A real device through cpal. `None` picks the host default.
    Cpal {
        #[serde(default)]
        device: Option<String>,
    },
    /// No device. Samples are consumed by a background thread.
    Null {
        #[serde(default = "default_null_rate")]
        sample_rate: u32,
        #[serde(default = "default_null_channels")]
        channels: u16,
        /// Consume at playback speed instead of as fast as possible.
        #[serde(default = "default_true")]
        realtime: bool,
    },
}

impl Default for OutputBackend {
    fn default() -> Self {
        Self::Cpal { device: None }
    }
}

impl OutputBackend {
    /// Headless output paced like a real device.
    pub const fn null() -> Self {
        Self::Null {
            sample_rate: 48000,
            channels: 2,
            realtime: true,
        }
    }

    /// Headless output that drains immediately.
    pub const fn discard() -> Self {
        Self::Null {
            sample_rate: 48000,
            channels: 2,
            realtime: false,
        }
    }
}

const fn default_null_rate() -> u32 {
    48000
}

const fn default_null_channels() -> u16 {
    2
}

const fn default_true() -> bool {
    true
}

/// Which decoder handles a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderBackend {
    /// symphonia first, external ffmpeg if probing fails.
    #[default]
    Auto,
    Symphonia,
    Ffmpeg,
}

impl std::str::FromStr for DecoderBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "symphonia" => Ok(Self::Symphonia),
            "ffmpeg" => Ok(Self::Ffmpeg),
            other => Err(Error::Config(format!("unknown decoder backend: {other}"))),
        }
    }
}

/// Configuration for an audio engine session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output: OutputBackend,
    pub decoder: DecoderBackend,
    /// Explicit ffmpeg binary for the fallback decoder.
    pub ffmpeg_path: Option<PathBuf>,
    /// Ring buffer length in milliseconds of output audio.
    pub ring_buffer_ms: u32,
    /// Audio buffered before playback of a file starts.
    pub prefill_ms: u32,
    /// Session volume (0.0 to 1.0).
    pub volume: f32,
    /// Interval between position events.
    pub position_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: OutputBackend::default(),
            decoder: DecoderBackend::default(),
            ffmpeg_path: None,
            ring_buffer_ms: 2000,
            prefill_ms: 200,
            volume: 1.0,
            position_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Load the configuration from the default file location and environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(|| default_config_path().filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Parse a JSON config document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PLAYAUDIO_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(output) = lookup(OUTPUT_ENV) {
            self.output = match output.trim().to_ascii_lowercase().as_str() {
                "cpal" | "default" => OutputBackend::Cpal { device: None },
                "null" => OutputBackend::null(),
                "discard" => OutputBackend::discard(),
                other => {
                    return Err(Error::Config(format!("unknown output backend: {other}")));
                }
            };
        }

        if let Some(device) = lookup(DEVICE_ENV) {
            match &mut self.output {
                OutputBackend::Cpal { device: slot } => *slot = Some(device),
                OutputBackend::Null { .. } => {
                    debug!("{DEVICE_ENV} ignored for null output");
                }
            }
        }

        if let Some(decoder) = lookup(DECODER_ENV) {
            self.decoder = decoder.parse()?;
        }

        if let Some(ffmpeg) = lookup(FFMPEG_ENV) {
            self.ffmpeg_path = Some(PathBuf::from(ffmpeg));
        }

        if let Some(volume) = lookup(VOLUME_ENV) {
            self.volume = volume
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {VOLUME_ENV} {volume:?}: {e}")))?;
        }

        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::Config(format!(
                "volume must be within 0.0..=1.0, got {}",
                self.volume
            )));
        }
        if self.ring_buffer_ms == 0 {
            return Err(Error::Config("ring_buffer_ms must be positive".to_string()));
        }
        if self.prefill_ms > self.ring_buffer_ms {
            return Err(Error::Config(format!(
                "prefill_ms ({}) exceeds ring_buffer_ms ({})",
                self.prefill_ms, self.ring_buffer_ms
            )));
        }
        if let OutputBackend::Null {
            sample_rate,
            channels,
            ..
        } = self.output
        {
            if sample_rate == 0 || channels == 0 {
                return Err(Error::Config(
                    "null output needs a non-zero rate and channel count".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Ring buffer capacity in samples for a stereo stream at `sample_rate`.
    pub fn ring_buffer_samples(&self, sample_rate: u32) -> usize {
        ms_to_stereo_samples(self.ring_buffer_ms, sample_rate)
    }

    /// Prefill target in samples for a stereo stream at `sample_rate`.
    pub fn prefill_samples(&self, sample_rate: u32) -> usize {
        ms_to_stereo_samples(self.prefill_ms, sample_rate)
    }
}

fn ms_to_stereo_samples(ms: u32, sample_rate: u32) -> usize {
    (u64::from(ms) * u64::from(sample_rate) / 1000 * 2) as usize
}

/// Default config file location (`<config dir>/config.json`).
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "compsky", "playaudio").map(|d| d.config_dir().join("config.json"))
}

/// Directory the fallback decoder searches for a bundled ffmpeg.
pub fn cache_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "compsky", "playaudio").map(|d| d.cache_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.output, OutputBackend::Cpal { device: None });
        assert_eq!(config.decoder, DecoderBackend::Auto);
        assert_eq!(config.ring_buffer_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{ "prefill_ms": 50 }"#).unwrap();
        assert_eq!(config.prefill_ms, 50);
        assert_eq!(config.ring_buffer_ms, 2000);
        assert_eq!(config.output, OutputBackend::default());
    }

    #[test]
    fn test_null_output_json() {
        let config = EngineConfig::from_json(
            r#"{ "output": { "backend": "null", "sample_rate": 44100, "realtime": false } }"#,
        )
        .unwrap();
        assert_eq!(
            config.output,
            OutputBackend::Null {
                sample_rate: 44100,
                channels: 2,
                realtime: false
            }
        );
    }

    #[test]
    fn test_cpal_device_json() {
        let config =
            EngineConfig::from_json(r#"{ "output": { "backend": "cpal", "device": "pulse" } }"#)
                .unwrap();
        assert_eq!(
            config.output,
            OutputBackend::Cpal {
                device: Some("pulse".to_string())
            }
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(env(&[
                ("PLAYAUDIO_DEVICE", "hdmi"),
                ("PLAYAUDIO_DECODER", "FFmpeg"),
                ("PLAYAUDIO_VOLUME", "0.5"),
            ]))
            .unwrap();
        assert_eq!(
            config.output,
            OutputBackend::Cpal {
                device: Some("hdmi".to_string())
            }
        );
        assert_eq!(config.decoder, DecoderBackend::Ffmpeg);
        assert!((config.volume - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_env_output_discard() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(env(&[("PLAYAUDIO_OUTPUT", "discard")]))
            .unwrap();
        assert_eq!(config.output, OutputBackend::discard());
    }

    #[test]
    fn test_env_invalid_values() {
        let mut config = EngineConfig::default();
        assert!(config
            .apply_overrides(env(&[("PLAYAUDIO_OUTPUT", "alsa-raw")]))
            .is_err());
        assert!(config
            .apply_overrides(env(&[("PLAYAUDIO_VOLUME", "loud")]))
            .is_err());
    }

    #[test]
    fn test_validate_ranges() {
        let config = EngineConfig {
            volume: 1.5,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = EngineConfig {
            prefill_ms: 3000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_sizes() {
        let config = EngineConfig::default();
        assert_eq!(config.ring_buffer_samples(48000), 192_000);
        assert_eq!(config.prefill_samples(48000), 19_200);
    }
}
