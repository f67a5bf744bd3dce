//! Audio output: cpal devices and a headless null sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use parking_lot::{Mutex, RwLock};
use playaudio_core::{Error, OutputBackend, Result};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{RingBuffer, SharedRingBuffer};
use crate::PlaybackState;

/// Magnitude above which the soft limiter kicks in.
const LIMIT_THRESHOLD: f32 = 0.9;

/// Negotiated output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
        }
    }
}

/// State the output reads on every callback.
#[derive(Clone)]
pub struct OutputShared {
    /// Interleaved stereo frames produced by the engine worker.
    pub ring_buffer: SharedRingBuffer,
    pub volume: Arc<Mutex<f32>>,
    pub state: Arc<RwLock<PlaybackState>>,
}

enum Backend {
    Cpal(Stream),
    Null(NullSink),
}

/// An open output. Dropping it stops the stream.
pub struct AudioOutput {
    _backend: Backend,
    config: OutputConfig,
    device_name: String,
    ring_buffer: SharedRingBuffer,
}

impl AudioOutput {
    /// Open the output described by `backend`.
    ///
    /// `make_shared` runs once the device format is known, so buffers can
    /// be sized for the real sample rate.
    pub fn open<F>(backend: &OutputBackend, make_shared: F) -> Result<Self>
    where
        F: FnOnce(&OutputConfig) -> OutputShared,
    {
        match backend {
            OutputBackend::Cpal { device: None } => Self::new(make_shared),
            OutputBackend::Cpal { device: Some(name) } => {
                let device = find_output_device(name)?;
                Self::with_device(device, make_shared)
            }
            OutputBackend::Null {
                sample_rate,
                channels,
                realtime,
            } => {
                let config = OutputConfig {
                    sample_rate: *sample_rate,
                    channels: *channels,
                };
                let shared = make_shared(&config);
                Self::null(config, *realtime, shared)
            }
        }
    }

    /// Open the host's default output device.
    pub fn new<F>(make_shared: F) -> Result<Self>
    where
        F: FnOnce(&OutputConfig) -> OutputShared,
    {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("No output device found".to_string()))?;

        Self::with_device(device, make_shared)
    }

    /// Open a specific cpal device.
    pub fn with_device<F>(device: Device, make_shared: F) -> Result<Self>
    where
        F: FnOnce(&OutputConfig) -> OutputShared,
    {
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Using audio output device: {device_name}");

        let supported_config = device
            .default_output_config()
            .map_err(|e| Error::AudioOutput(format!("Failed to get output config: {e}")))?;

        debug!("Supported output config: {:?}", supported_config);

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        let output_config = OutputConfig {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };
        debug!(
            "Output config: {}Hz, {} channels",
            output_config.sample_rate, output_config.channels
        );

        let shared = make_shared(&output_config);
        let ring_buffer = shared.ring_buffer.clone();

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, shared)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, shared)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, shared)?,
            _ => {
                return Err(Error::AudioOutput(format!(
                    "Unsupported sample format: {sample_format:?}"
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {e}")))?;

        Ok(Self {
            _backend: Backend::Cpal(stream),
            config: output_config,
            device_name,
            ring_buffer,
        })
    }

    /// Headless output that consumes samples on a background thread.
    pub fn null(config: OutputConfig, realtime: bool, shared: OutputShared) -> Result<Self> {
        info!(
            "Using null audio output ({} Hz, realtime: {realtime})",
            config.sample_rate
        );
        let ring_buffer = shared.ring_buffer.clone();
        let sink = NullSink::spawn(
            std::thread::Builder::new().name("null-output".to_string()),
            config.sample_rate,
            realtime,
            shared,
        )?;

        Ok(Self {
            _backend: Backend::Null(sink),
            config,
            device_name: "null".to_string(),
            ring_buffer,
        })
    }

    pub const fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub const fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Buffer the output consumes stereo frames from.
    pub const fn ring_buffer(&self) -> &SharedRingBuffer {
        &self.ring_buffer
    }
}

fn build_stream<T>(device: &Device, config: &StreamConfig, shared: OutputShared) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let out_channels = usize::from(config.channels);
    let mut scratch: Vec<f32> = Vec::new();
    let mut errors = StreamErrorLog::default();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if *shared.state.read() != PlaybackState::Playing {
                    shared.ring_buffer.catch_up();
                    data.fill(T::from_sample(0.0f32));
                    return;
                }

                let volume = *shared.volume.lock();
                let missing = render(
                    &shared.ring_buffer,
                    volume,
                    out_channels,
                    &mut scratch,
                    data,
                );
                if missing > 0 {
                    trace!("Buffer underrun: {missing} frames of silence");
                }
            },
            move |err| {
                errors.record(&err.to_string());
            },
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {e}")))
}

/// Fill `data` (interleaved, `out_channels` wide) from stereo frames in `ring`.
///
/// Mono devices get the average of both channels; channels beyond the
/// second are silent. Returns the number of frames padded with silence.
fn render<T>(
    ring: &RingBuffer,
    volume: f32,
    out_channels: usize,
    scratch: &mut Vec<f32>,
    data: &mut [T],
) -> usize
where
    T: SizedSample + FromSample<f32>,
{
    let out_channels = out_channels.max(1);
    let frames = data.len() / out_channels;
    scratch.resize(frames * 2, 0.0);
    let read_frames = ring.read(&mut scratch[..frames * 2]) / 2;

    for (i, frame) in data.chunks_exact_mut(out_channels).enumerate() {
        let (left, right) = if i < read_frames {
            (
                soft_limit(scratch[2 * i] * volume),
                soft_limit(scratch[2 * i + 1] * volume),
            )
        } else {
            (0.0, 0.0)
        };

        if out_channels == 1 {
            frame[0] = T::from_sample((left + right) * 0.5);
        } else {
            frame[0] = T::from_sample(left);
            frame[1] = T::from_sample(right);
            for extra in &mut frame[2..] {
                *extra = T::from_sample(0.0f32);
            }
        }
    }

    frames - read_frames
}

/// Smooth limiting above `LIMIT_THRESHOLD` to avoid hard clipping.
fn soft_limit(sample: f32) -> f32 {
    if sample.abs() > LIMIT_THRESHOLD {
        sample.tanh()
    } else {
        sample
    }
}

/// Logs stream errors once, then a repeat count when a different error shows up.
#[derive(Default)]
struct StreamErrorLog {
    last: Option<String>,
    repeats: u32,
}

impl StreamErrorLog {
    /// Returns true if `message` was logged rather than counted.
    fn record(&mut self, message: &str) -> bool {
        if self.last.as_deref() == Some(message) {
            self.repeats += 1;
            return false;
        }

        self.flush();
        error!("Audio stream error: {message}");
        self.last = Some(message.to_string());
        true
    }

    /// Log any pending repeat count. Returns the count that was logged.
    fn flush(&mut self) -> u32 {
        let repeats = std::mem::take(&mut self.repeats);
        if repeats > 0 {
            warn!("Previous audio stream error repeated {repeats} times");
        }
        repeats
    }
}

impl Drop for StreamErrorLog {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Background consumer standing in for a device.
struct NullSink {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NullSink {
    fn spawn(
        builder: std::thread::Builder,
        sample_rate: u32,
        realtime: bool,
        shared: OutputShared,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = builder
            .spawn(move || {
                let samples_per_sec = f64::from(sample_rate) * 2.0;
                let mut owed = 0.0f64;
                let mut last_tick = Instant::now();

                while !stop_flag.load(Ordering::Acquire) {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_tick);
                    last_tick = now;

                    if *shared.state.read() == PlaybackState::Playing {
                        if realtime {
                            owed += elapsed.as_secs_f64() * samples_per_sec;
                            let whole_frames = (owed as usize) / 2 * 2;
                            let skipped = shared.ring_buffer.skip(whole_frames);
                            // Do not bank time spent with nothing to play.
                            owed = if skipped < whole_frames {
                                0.0
                            } else {
                                owed - skipped as f64
                            };
                        } else {
                            shared.ring_buffer.skip(shared.ring_buffer.available());
                        }
                    } else {
                        shared.ring_buffer.catch_up();
                        owed = 0.0;
                    }

                    std::thread::sleep(Duration::from_millis(if realtime { 5 } else { 1 }));
                }
            })
            .map_err(|e| {
                Error::AudioOutput(format!("Failed to spawn null output thread: {e}"))
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Find an output device by exact name.
pub fn find_output_device(name: &str) -> Result<Device> {
    let host = cpal::default_host();

    host.output_devices()
        .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
        .find(|d| d.name().is_ok_and(|n| n == name))
        .ok_or_else(|| Error::AudioOutput(format!("Output device not found: {name}")))
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Get the default output device name.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}
