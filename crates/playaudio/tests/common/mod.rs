//! Fixtures shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use compskyplayaudio::{EngineConfig, OutputBackend};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// A unique path in the temp dir, removed on drop.
pub struct TempFile(pub PathBuf);

impl TempFile {
    pub fn new(extension: &str) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("playaudio-test-{}-{id}.{extension}", std::process::id());
        Self(std::env::temp_dir().join(name))
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Write a 16-bit PCM WAV holding a 440 Hz sine at half scale.
pub fn sine_wav(sample_rate: u32, channels: u16, frames: u32) -> TempFile {
    let file = TempFile::new("wav");
    let data_len = frames * u32::from(channels) * 2;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * u32::from(channels) * 2).to_le_bytes());
    out.extend_from_slice(&(channels * 2).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    for frame in 0..frames {
        let t = f64::from(frame) / f64::from(sample_rate);
        let value = ((t * 440.0 * std::f64::consts::TAU).sin() * f64::from(i16::MAX) * 0.5) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    std::fs::write(&file.0, out).unwrap();
    file
}

/// Engine config with a headless output at `sample_rate`.
pub fn null_config(sample_rate: u32, realtime: bool) -> EngineConfig {
    EngineConfig {
        output: OutputBackend::Null {
            sample_rate,
            channels: 2,
            realtime,
        },
        prefill_ms: 20,
        position_interval_ms: 10,
        ..EngineConfig::default()
    }
}
