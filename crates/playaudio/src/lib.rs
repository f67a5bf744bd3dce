//! # playaudio
//!
//! Audio file playback engine, exported as `libcompskyplayaudio`.
//!
//! Features:
//! - symphonia decoding with an ffmpeg fallback
//! - rubato resampling to the device rate
//! - Balance/crossfeed/gain stereo transform
//! - Lock-free ring buffer between decode and cpal output
//! - C ABI (`initFFMPEG`/`playAudio` or `init_all`/`playAudio`)

pub mod buffer;
pub mod decode;
pub mod engine;
pub mod ffi;
pub mod ffmpeg_decode;
pub mod logging;
pub mod mix;
pub mod output;
pub mod resample;

pub use engine::{AudioEngine, EngineCommand, EngineEvent, PlaybackReport, PlaybackState};
pub use ffi::Session;
pub use mix::StereoTransform;
pub use playaudio_core::{DecoderBackend, EngineConfig, Error, OutputBackend, Result};
