//! # playaudio
//!
//! Plays every file named on the command line, in order, through one engine.
//! With no arguments it lists the available output devices.

use anyhow::{Context, Result};
use compskyplayaudio::output::{default_device_name, list_output_devices};
use compskyplayaudio::{logging, AudioEngine, StereoTransform};
use playaudio_core::EngineConfig;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    logging::init();
    info!("Starting playaudio v{}", env!("CARGO_PKG_VERSION"));

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        return list_devices();
    }

    let config = EngineConfig::load().context("Failed to load configuration")?;
    let engine = AudioEngine::with_config(config).context("Failed to initialise audio engine")?;

    let mut failures = 0usize;
    for path in &paths {
        match engine.play_file(path, StereoTransform::IDENTITY) {
            Ok(report) if report.truncated => {
                warn!("{path}: decoding stopped after {:.2}s", report.seconds_played);
            }
            Ok(_) => {}
            // Already logged by the engine; keep going like the C driver does.
            Err(e) if e.is_per_file() => failures += 1,
            Err(e) => return Err(e).with_context(|| format!("Playback of {path} failed")),
        }
    }

    engine.shutdown().context("Audio engine did not shut down cleanly")?;

    if failures > 0 {
        error!("{failures} of {} files could not be played", paths.len());
    }
    Ok(())
}

fn list_devices() -> Result<()> {
    let default = default_device_name();
    let devices = list_output_devices().context("Failed to enumerate output devices")?;

    println!("usage: playaudio FILE...");
    println!();
    println!("Output devices:");
    for name in devices {
        let marker = if default.as_deref() == Some(name.as_str()) { "*" } else { " " };
        println!(" {marker} {name}");
    }
    Ok(())
}
