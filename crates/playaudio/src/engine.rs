//! Audio playback engine coordinating decode, resample, and output.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use parking_lot::{Mutex, RwLock};
use playaudio_core::{DecoderBackend, EngineConfig, Error, Result};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{shared_ring_buffer, SharedRingBuffer};
use crate::decode::{AudioDecoder, SampleSource};
use crate::ffmpeg_decode::FfmpegDecoder;
use crate::mix::{check_source_channels, to_stereo, StereoTransform};
use crate::output::{AudioOutput, OutputConfig, OutputShared};
use crate::resample::Resampler;

/// Events are dropped once this many are waiting unread.
const EVENT_CAPACITY: usize = 256;

/// How long the worker waits for a command between buffer checks.
const TICK: Duration = Duration::from_millis(2);

/// Playback fails if the output consumes nothing for this long while playing.
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Playback state of the audio engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Buffering,
}

/// Commands to control the audio engine.
#[derive(Debug)]
pub enum EngineCommand {
    /// Queue a file. The report is sent on `reply` once it has finished.
    PlayFile {
        path: PathBuf,
        transform: StereoTransform,
        reply: Sender<Result<PlaybackReport>>,
    },
    /// Pause the current file.
    Pause,
    /// Resume after `Pause`.
    Resume,
    /// End the current file early.
    Stop,
    /// Set volume (0.0 to 1.0).
    SetVolume(f32),
    /// Shutdown the engine. Queued files are cancelled.
    Shutdown,
}

/// Events emitted by the audio engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(PlaybackState),
    /// Position in the current file, in seconds.
    PositionUpdate(f64),
    /// Duration of the current file, in seconds.
    DurationUpdate(f64),
    TrackLoaded,
    PlaybackFinished,
    Error(String),
}

/// Outcome of playing one file.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackReport {
    pub path: PathBuf,
    /// Output frames that reached the device.
    pub frames_played: u64,
    pub seconds_played: f64,
    pub source_sample_rate: u32,
    pub source_channels: u16,
    /// Ended by `Stop` or shutdown.
    pub stopped_early: bool,
    /// Decoding failed part way; everything decoded up to then was played.
    pub truncated: bool,
}

/// Audio playback engine.
///
/// A worker thread owns the output device and plays queued files one after
/// another. Dropping the engine shuts the worker down and releases the device.
pub struct AudioEngine {
    state: Arc<RwLock<PlaybackState>>,
    volume: Arc<Mutex<f32>>,
    position: Arc<RwLock<f64>>,
    duration: Arc<RwLock<Option<f64>>>,
    command_tx: Sender<EngineCommand>,
    event_rx: Receiver<EngineEvent>,
    ring_buffer: SharedRingBuffer,
    output_config: OutputConfig,
    device_name: String,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// What the worker reports once the output is open.
struct Ready {
    output_config: OutputConfig,
    device_name: String,
    ring_buffer: SharedRingBuffer,
}

impl AudioEngine {
    /// Create an engine on the default output device.
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine and wait until its output is running.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = bounded(EVENT_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<Ready>>(1);

        let state = Arc::new(RwLock::new(PlaybackState::Stopped));
        let volume = Arc::new(Mutex::new(config.volume));
        let position = Arc::new(RwLock::new(0.0f64));
        let duration = Arc::new(RwLock::new(None));

        let state_clone = state.clone();
        let volume_clone = volume.clone();
        let position_clone = position.clone();
        let duration_clone = duration.clone();

        let handle = std::thread::Builder::new()
            .name("audio-engine".to_string())
            .spawn(move || {
                // cpal::Stream is not Send, so the output lives on this thread.
                let output = AudioOutput::open(&config.output, |output_config| OutputShared {
                    ring_buffer: shared_ring_buffer(
                        config.ring_buffer_samples(output_config.sample_rate),
                    ),
                    volume: volume_clone.clone(),
                    state: state_clone.clone(),
                });

                let output = match output {
                    Ok(output) => output,
                    Err(e) => {
                        error!("Failed to initialize audio output: {e}");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                info!(
                    "Audio output initialized: {} Hz, {} channels, device: {}",
                    output.sample_rate(),
                    output.channels(),
                    output.device_name()
                );

                let _ = ready_tx.send(Ok(Ready {
                    output_config: output.config().clone(),
                    device_name: output.device_name().to_string(),
                    ring_buffer: output.ring_buffer().clone(),
                }));

                EngineWorker {
                    command_rx,
                    event_tx,
                    state: state_clone,
                    volume: volume_clone,
                    position: position_clone,
                    duration: duration_clone,
                    ring_buffer: output.ring_buffer().clone(),
                    output,
                    config,
                    queue: VecDeque::new(),
                    samples_written: 0,
                    shutdown: false,
                }
                .run();
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn engine thread: {e}")))?;

        let ready = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::EngineUnavailable(
                    "engine thread exited during startup".to_string(),
                ));
            }
        };

        Ok(Self {
            state,
            volume,
            position,
            duration,
            command_tx,
            event_rx,
            ring_buffer: ready.ring_buffer,
            output_config: ready.output_config,
            device_name: ready.device_name,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.read()
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    /// Ring buffer fill level (0.0 to 1.0).
    pub fn buffer_fill(&self) -> f32 {
        self.ring_buffer.available() as f32 / self.ring_buffer.capacity() as f32
    }

    /// Position in the current file, in seconds.
    pub fn position(&self) -> f64 {
        *self.position.read()
    }

    /// Duration of the current file, in seconds.
    pub fn duration(&self) -> Option<f64> {
        *self.duration.read()
    }

    pub const fn output_config(&self) -> &OutputConfig {
        &self.output_config
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Send a command to the engine.
    pub fn send_command(&self, command: EngineCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| Error::EngineUnavailable(format!("Failed to send command: {e}")))
    }

    /// Play a file and block until it has finished.
    pub fn play_file(
        &self,
        path: impl Into<PathBuf>,
        transform: StereoTransform,
    ) -> Result<PlaybackReport> {
        let reply = self.enqueue_file(path, transform)?;
        reply.recv().map_err(|_| {
            Error::EngineUnavailable("engine stopped before the file finished".to_string())
        })?
    }

    /// Queue a file behind anything already playing.
    ///
    /// The returned receiver yields the report once the file is done.
    pub fn enqueue_file(
        &self,
        path: impl Into<PathBuf>,
        transform: StereoTransform,
    ) -> Result<Receiver<Result<PlaybackReport>>> {
        let (reply, report_rx) = bounded(1);
        self.send_command(EngineCommand::PlayFile {
            path: path.into(),
            transform,
            reply,
        })?;
        Ok(report_rx)
    }

    pub fn pause(&self) -> Result<()> {
        self.send_command(EngineCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send_command(EngineCommand::Resume)
    }

    /// End the current file early.
    pub fn stop(&self) -> Result<()> {
        self.send_command(EngineCommand::Stop)
    }

    /// Set the volume (clamped to 0.0..=1.0).
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = if volume.is_finite() { volume } else { 1.0 };
        self.send_command(EngineCommand::SetVolume(volume.clamp(0.0, 1.0)))
    }

    /// Try to receive an event without blocking.
    pub fn try_recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive an event, blocking until one is available.
    pub fn recv_event(&self) -> Option<EngineEvent> {
        self.event_rx.recv().ok()
    }

    /// Stop the worker and wait for it to release the output.
    pub fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };

        // The worker may already be gone; joining is what matters.
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        handle
            .join()
            .map_err(|_| Error::Internal("audio engine thread panicked".to_string()))
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Audio engine shutdown failed: {e}");
        }
    }
}

/// A queued file.
struct PlayRequest {
    path: PathBuf,
    transform: StereoTransform,
    reply: Sender<Result<PlaybackReport>>,
}

/// What the play loop should do after a command.
enum Flow {
    Continue,
    Stop,
}

/// Internal worker that runs the audio processing loop.
struct EngineWorker {
    command_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
    state: Arc<RwLock<PlaybackState>>,
    volume: Arc<Mutex<f32>>,
    position: Arc<RwLock<f64>>,
    duration: Arc<RwLock<Option<f64>>>,
    ring_buffer: SharedRingBuffer,
    /// Kept alive for the lifetime of the worker.
    output: AudioOutput,
    config: EngineConfig,
    queue: VecDeque<PlayRequest>,
    /// Samples written for the current file (for position tracking).
    samples_written: u64,
    shutdown: bool,
}

impl EngineWorker {
    fn run(mut self) {
        info!("Audio engine worker started");

        while !self.shutdown {
            if let Some(request) = self.queue.pop_front() {
                self.play(request);
                continue;
            }

            match self.command_rx.recv() {
                Ok(command) => self.handle_idle_command(command),
                Err(_) => {
                    debug!("Command channel closed, shutting down");
                    break;
                }
            }
        }

        for request in self.queue.drain(..) {
            let _ = request.reply.send(Err(Error::Cancelled));
        }
        info!("Audio engine shutting down");
    }

    fn handle_idle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::PlayFile {
                path,
                transform,
                reply,
            } => self.queue.push_back(PlayRequest {
                path,
                transform,
                reply,
            }),
            EngineCommand::SetVolume(volume) => *self.volume.lock() = volume,
            EngineCommand::Shutdown => self.shutdown = true,
            EngineCommand::Pause | EngineCommand::Resume | EngineCommand::Stop => {
                debug!("Ignoring {command:?}: nothing is playing");
            }
        }
    }

    /// Returns whether the current file should keep playing.
    fn handle_playing_command(&mut self, command: EngineCommand, paused: &mut bool) -> Flow {
        match command {
            EngineCommand::PlayFile {
                path,
                transform,
                reply,
            } => {
                debug!("Queued {} behind current file", path.display());
                self.queue.push_back(PlayRequest {
                    path,
                    transform,
                    reply,
                });
                Flow::Continue
            }
            EngineCommand::Pause => {
                *paused = true;
                if *self.state.read() == PlaybackState::Playing {
                    self.set_state(PlaybackState::Paused);
                }
                Flow::Continue
            }
            EngineCommand::Resume => {
                *paused = false;
                if *self.state.read() == PlaybackState::Paused {
                    self.set_state(PlaybackState::Playing);
                }
                Flow::Continue
            }
            EngineCommand::SetVolume(volume) => {
                *self.volume.lock() = volume;
                Flow::Continue
            }
            EngineCommand::Stop => Flow::Stop,
            EngineCommand::Shutdown => {
                self.shutdown = true;
                Flow::Stop
            }
        }
    }

    fn play(&mut self, request: PlayRequest) {
        let PlayRequest {
            path,
            transform,
            reply,
        } = request;

        info!("Opening file {}", path.display());
        let result = self.play_file(&path, transform);

        match &result {
            Ok(report) => {
                info!(
                    "Finished {} ({:.2}s played{})",
                    path.display(),
                    report.seconds_played,
                    if report.stopped_early { ", stopped" } else { "" }
                );
                if !report.stopped_early {
                    self.emit(EngineEvent::PlaybackFinished);
                }
            }
            Err(e) => {
                error!("Failed to play {}: {e}", path.display());
                self.emit(EngineEvent::Error(format!(
                    "Failed to play {}: {e}",
                    path.display()
                )));
            }
        }

        self.reset();
        let _ = reply.send(result);
    }

    fn open_source(&self, path: &Path) -> Result<Box<dyn SampleSource>> {
        let ffmpeg = || {
            let binary = FfmpegDecoder::resolve_binary(self.config.ffmpeg_path.as_deref());
            FfmpegDecoder::open(&binary, path, self.output.sample_rate())
        };

        match self.config.decoder {
            DecoderBackend::Symphonia => Ok(Box::new(AudioDecoder::open(path)?)),
            DecoderBackend::Ffmpeg => Ok(Box::new(ffmpeg()?)),
            DecoderBackend::Auto => match AudioDecoder::open(path) {
                Ok(decoder) => Ok(Box::new(decoder)),
                Err(Error::UnsupportedFormat(reason)) => {
                    warn!("{reason}; falling back to ffmpeg for {}", path.display());
                    match ffmpeg() {
                        Ok(decoder) => Ok(Box::new(decoder)),
                        Err(e) => Err(Error::UnsupportedFormat(format!(
                            "{reason}; ffmpeg fallback failed: {e}"
                        ))),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }

    fn play_file(&mut self, path: &Path, transform: StereoTransform) -> Result<PlaybackReport> {
        self.set_state(PlaybackState::Buffering);

        let mut source = self.open_source(path)?;
        let source_rate = source.sample_rate();
        let mut source_channels = source.channels();
        check_source_channels(source_channels)?;

        let output_rate = self.output.sample_rate();
        let mut resampler = Resampler::new(source_rate, output_rate, 2)?;
        debug!(
            "Source {} Hz, {} channels -> output {} Hz, transform {:?}",
            source_rate, source_channels, output_rate, transform
        );

        let duration = source.duration();
        *self.duration.write() = duration;
        if let Some(duration) = duration {
            self.emit(EngineEvent::DurationUpdate(duration));
        }
        self.emit(EngineEvent::TrackLoaded);

        self.ring_buffer.clear();
        self.samples_written = 0;

        let prefill = self
            .config
            .prefill_samples(output_rate)
            .min(self.ring_buffer.capacity());
        let position_interval = Duration::from_millis(self.config.position_interval_ms);

        let mut pending: Vec<f32> = Vec::new();
        let mut pending_offset = 0usize;
        let mut decoding = true;
        let mut truncated = false;
        let mut started = false;
        let mut paused = false;
        let mut last_position = Instant::now();
        let mut last_consumed = 0u64;
        let mut last_progress = Instant::now();

        loop {
            loop {
                let command = match self.command_rx.try_recv() {
                    Ok(command) => command,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.shutdown = true;
                        EngineCommand::Shutdown
                    }
                };
                if matches!(
                    self.handle_playing_command(command, &mut paused),
                    Flow::Stop
                ) {
                    return Ok(self.report(path, source_rate, source_channels, true, truncated));
                }
            }

            // Fill: push pending samples, decoding more when they run out.
            let mut progressed = false;
            if pending_offset < pending.len() {
                let written = self.ring_buffer.write(&pending[pending_offset..]);
                pending_offset += written;
                self.samples_written += written as u64;
                progressed = written > 0;
                trace!("Wrote {} samples to ring buffer", written);
            } else if decoding {
                pending_offset = 0;
                pending = match next_stereo_chunk(source.as_mut(), &mut source_channels) {
                    Ok(Some(stereo)) => resampler.process(&stereo)?,
                    Ok(None) => {
                        decoding = false;
                        resampler.flush()?
                    }
                    Err(e @ Error::UnsupportedFormat(_)) => return Err(e),
                    Err(e) => {
                        warn!("Decoding {} stopped early: {e}", path.display());
                        self.emit(EngineEvent::Error(format!("Decode error: {e}")));
                        decoding = false;
                        truncated = true;
                        resampler.flush()?
                    }
                };
                transform.apply(&mut pending);
                progressed = true;
            }

            let all_written = !decoding && pending_offset >= pending.len();

            if !started && (self.ring_buffer.available() >= prefill || all_written) {
                started = true;
                last_progress = Instant::now();
                self.set_state(if paused {
                    PlaybackState::Paused
                } else {
                    PlaybackState::Playing
                });
            }

            let available = self.ring_buffer.available();
            if started {
                if all_written && available == 0 {
                    self.update_position();
                    return Ok(self.report(path, source_rate, source_channels, false, truncated));
                }

                let consumed = self.frames_consumed();
                if consumed > last_consumed || *self.state.read() != PlaybackState::Playing {
                    last_consumed = consumed;
                    last_progress = Instant::now();
                } else if available > 0 && last_progress.elapsed() > STALL_TIMEOUT {
                    return Err(Error::AudioOutput(
                        "output stopped consuming samples".to_string(),
                    ));
                }

                if last_position.elapsed() >= position_interval {
                    self.update_position();
                    last_position = Instant::now();
                }
            }

            if !progressed {
                match self.command_rx.recv_timeout(TICK) {
                    Ok(command) => {
                        if matches!(
                            self.handle_playing_command(command, &mut paused),
                            Flow::Stop
                        ) {
                            return Ok(self.report(
                                path,
                                source_rate,
                                source_channels,
                                true,
                                truncated,
                            ));
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        self.shutdown = true;
                        return Ok(self.report(path, source_rate, source_channels, true, truncated));
                    }
                }
            }
        }
    }

    /// Frames that have left the ring buffer for the current file.
    fn frames_consumed(&self) -> u64 {
        let buffered = self.ring_buffer.available() as u64;
        self.samples_written.saturating_sub(buffered) / 2
    }

    fn report(
        &self,
        path: &Path,
        source_sample_rate: u32,
        source_channels: u16,
        stopped_early: bool,
        truncated: bool,
    ) -> PlaybackReport {
        let frames_played = self.frames_consumed();
        PlaybackReport {
            path: path.to_path_buf(),
            frames_played,
            seconds_played: frames_played as f64 / f64::from(self.output.sample_rate()),
            source_sample_rate,
            source_channels,
            stopped_early,
            truncated,
        }
    }

    fn update_position(&self) {
        let position_secs = self.frames_consumed() as f64 / f64::from(self.output.sample_rate());
        *self.position.write() = position_secs;
        self.emit(EngineEvent::PositionUpdate(position_secs));
    }

    /// Return to idle after a file, whatever the outcome.
    fn reset(&mut self) {
        self.set_state(PlaybackState::Stopped);
        self.ring_buffer.clear();
        self.samples_written = 0;
        *self.position.write() = 0.0;
        *self.duration.write() = None;
    }

    fn emit(&self, event: EngineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => trace!("Event queue full, dropping {event:?}"),
        }
    }

    fn set_state(&self, new_state: PlaybackState) {
        let old_state = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state)
        };

        if old_state != new_state {
            debug!("State changed: {:?} -> {:?}", old_state, new_state);
            self.emit(EngineEvent::StateChanged(new_state));
        }
    }
}

/// Decode the next chunk and convert it to interleaved stereo.
///
/// Some containers leave the channel layout undeclared until the first packet
/// is decoded, so `channels` is re-read from the source after every chunk.
fn next_stereo_chunk(
    source: &mut dyn SampleSource,
    channels: &mut u16,
) -> Result<Option<Vec<f32>>> {
    let Some(samples) = source.decode_next()? else {
        return Ok(None);
    };

    let current = source.channels();
    if current != *channels {
        debug!("Source has {current} channels, not {channels}");
        check_source_channels(current)?;
        *channels = current;
    }
    to_stereo(samples, current).map(Some)
}
