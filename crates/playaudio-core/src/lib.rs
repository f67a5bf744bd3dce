//! # playaudio-core
//!
//! Error handling and engine configuration shared by the playaudio crates.

pub mod config;
pub mod error;

pub use config::{DecoderBackend, EngineConfig, OutputBackend};
pub use error::{Error, Result};
