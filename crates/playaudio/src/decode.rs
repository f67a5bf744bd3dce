//! Audio decoding using symphonia.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use playaudio_core::{Error, Result};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};
use tracing::{debug, trace, warn};

/// A source of interleaved `f32` samples.
pub trait SampleSource {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Total duration in seconds, if known up front.
    fn duration(&self) -> Option<f64>;

    /// Next chunk of interleaved samples, `None` at end of stream.
    fn decode_next(&mut self) -> Result<Option<Vec<f32>>>;
}

/// Audio decoder wrapping symphonia.
pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    /// False when the container did not declare a channel layout.
    channels_known: bool,
    sample_buf: Option<SampleBuffer<f32>>,
    /// Frames to drop after a seek landed before the requested time.
    skip_frames: u64,
}

impl AudioDecoder {
    /// Open a file, probing by extension and content.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        Self::probe(Box::new(file), &hint)
    }

    /// Create a decoder from an in-memory file.
    pub fn from_bytes(data: Bytes, mime_hint: Option<&str>) -> Result<Self> {
        let mut hint = Hint::new();
        if let Some(mime) = mime_hint {
            hint.mime_type(mime);
            if let Some(ext) = extension_for_mime(mime) {
                hint.with_extension(ext);
            }
        }

        Self::probe(Box::new(Cursor::new(data)), &hint)
    }

    fn probe(source: Box<dyn MediaSource>, hint: &Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, MediaSourceStreamOptions::default());

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = symphonia::default::get_probe()
            .format(hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::UnsupportedFormat(format!("Failed to probe format: {e}")))?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::UnsupportedFormat("No audio tracks found".to_string()))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::UnsupportedFormat("Unknown sample rate".to_string()))?;
        let declared_channels = track.codec_params.channels.map(|c| c.count() as u16);

        debug!(
            "Audio track: id={}, sample_rate={}, channels={:?}",
            track_id, sample_rate, declared_channels
        );

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::UnsupportedFormat(format!("Failed to create decoder: {e}")))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels: declared_channels.unwrap_or(2),
            channels_known: declared_channels.is_some(),
            sample_buf: None,
            skip_frames: 0,
        })
    }

    /// Seek to a position in seconds.
    ///
    /// The next chunk starts exactly at the requested frame, even when the
    /// container can only seek to a packet boundary before it.
    pub fn seek(&mut self, position_secs: f64) -> Result<()> {
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(position_secs),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::AudioDecode(format!("Seek failed: {e}")))?;

        self.decoder.reset();
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        debug!(
            "Seeked to {position_secs}s (ts {}, trimming {} frames)",
            seeked.actual_ts, self.skip_frames
        );
        Ok(())
    }
}

impl SampleSource for AudioDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn duration(&self) -> Option<f64> {
        let track = self
            .format
            .tracks()
            .iter()
            .find(|t| t.id == self.track_id)?;

        let n_frames = track.codec_params.n_frames?;
        match track.codec_params.time_base {
            Some(time_base) => {
                let time = time_base.calc_time(n_frames);
                Some(time.seconds as f64 + time.frac)
            }
            None => Some(n_frames as f64 / f64::from(self.sample_rate)),
        }
    }

    fn decode_next(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(symphonia::core::errors::Error::ResetRequired) => {
                    debug!("Stream reset required, treating as end of stream");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!("Failed to read packet: {e}")));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    warn!("Decode error (skipping packet): {e}");
                    continue;
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!("Decode failed: {e}")));
                }
            };

            if decoded.frames() == 0 {
                continue;
            }

            let decoded_frames = decoded.frames();
            let spec = *decoded.spec();
            let channels = spec.channels.count() as u16;
            if channels != self.channels {
                if self.channels_known {
                    return Err(Error::UnsupportedFormat(format!(
                        "channel count changed mid-stream: {} -> {channels}",
                        self.channels
                    )));
                }
                debug!("Channel count learned from first packet: {channels}");
                self.channels = channels;
            }
            self.channels_known = true;

            let needed = decoded.capacity() * spec.channels.count();
            let mut sample_buf = match self.sample_buf.take() {
                Some(buf) if buf.capacity() >= needed => buf,
                _ => SampleBuffer::new(decoded.capacity() as u64, spec),
            };
            sample_buf.copy_interleaved_ref(decoded);

            let width = usize::from(self.channels).max(1);
            let trim = (self.skip_frames as usize).min(decoded_frames) * width;
            self.skip_frames -= (trim / width) as u64;

            let samples = sample_buf.samples()[trim..].to_vec();
            self.sample_buf = Some(sample_buf);
            if samples.is_empty() {
                continue;
            }
            trace!("Decoded {} samples", samples.len());
            return Ok(Some(samples));
        }
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    if mime.contains("webm") || mime.contains("opus") {
        Some("webm")
    } else if mime.contains("mp4") || mime.contains("m4a") || mime.contains("aac") {
        Some("m4a")
    } else if mime.contains("mp3") || mime.contains("mpeg") {
        Some("mp3")
    } else if mime.contains("ogg") || mime.contains("vorbis") {
        Some("ogg")
    } else if mime.contains("flac") {
        Some("flac")
    } else if mime.contains("wav") {
        Some("wav")
    } else {
        None
    }
}
