//! Fallback decoding through an external ffmpeg binary.
//!
//! Used for containers symphonia cannot probe. ffmpeg converts the file to
//! interleaved stereo `f32le` at the output rate, so no resampling is needed
//! afterwards. PCM is read from the pipe one chunk at a time.

use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use playaudio_core::{config, Error, Result};
use tracing::{debug, info, warn};

use crate::decode::SampleSource;

/// Samples handed out per `decode_next` call (1024 stereo frames).
const CHUNK_SAMPLES: usize = 2048;

/// Decoder streaming PCM from a running ffmpeg process.
///
/// Dropping it kills ffmpeg if it is still running.
pub struct FfmpegDecoder {
    child: Child,
    stdout: BufReader<ChildStdout>,
    /// Read during `open` to catch files ffmpeg cannot decode.
    first_chunk: Option<Vec<f32>>,
    sample_rate: u32,
    finished: bool,
}

impl FfmpegDecoder {
    /// Pick the ffmpeg binary: explicit path, bundled copy in the cache
    /// directory, then whatever `ffmpeg` resolves to on `PATH`.
    pub fn resolve_binary(configured: Option<&Path>) -> PathBuf {
        if let Some(path) = configured {
            return path.to_path_buf();
        }

        config::cache_dir()
            .map(|dir| dir.join("ffmpeg"))
            .filter(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }

    /// Decode `path` with the ffmpeg at `ffmpeg` to stereo at `sample_rate`.
    pub fn open(ffmpeg: &Path, path: &Path, sample_rate: u32) -> Result<Self> {
        info!("Decoding {} with {}", path.display(), ffmpeg.display());

        let mut child = Command::new(ffmpeg)
            .args(["-v", "quiet", "-nostdin", "-i"])
            .arg(path)
            .args(["-vn", "-f", "f32le", "-acodec", "pcm_f32le", "-ac", "2", "-ar"])
            .arg(sample_rate.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::AudioDecode(format!("Failed to run ffmpeg: {e}")))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::AudioDecode("ffmpeg stdout was not captured".to_string()));
        };

        let mut decoder = Self {
            child,
            stdout: BufReader::new(stdout),
            first_chunk: None,
            sample_rate,
            finished: false,
        };

        match decoder.read_chunk()? {
            Some(chunk) => decoder.first_chunk = Some(chunk),
            None => return Err(Error::AudioDecode("ffmpeg produced no output".to_string())),
        }
        Ok(decoder)
    }

    /// Read the next chunk from the pipe, reaping ffmpeg at end of stream.
    fn read_chunk(&mut self) -> Result<Option<Vec<f32>>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; CHUNK_SAMPLES * 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::AudioDecode(format!(
                        "Failed to read ffmpeg output: {e}"
                    )));
                }
            }
        }

        if filled < buf.len() {
            self.finish()?;
        }

        let samples = bytes_to_f32(&buf[..filled]);
        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(samples))
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        let status = self
            .child
            .wait()
            .map_err(|e| Error::AudioDecode(format!("Failed to wait for ffmpeg: {e}")))?;

        if !status.success() {
            return Err(Error::AudioDecode(format!("ffmpeg exited with {status}")));
        }
        debug!("ffmpeg finished");
        Ok(())
    }
}

impl SampleSource for FfmpegDecoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        2
    }

    fn duration(&self) -> Option<f64> {
        None
    }

    fn decode_next(&mut self) -> Result<Option<Vec<f32>>> {
        match self.first_chunk.take() {
            Some(chunk) => Ok(Some(chunk)),
            None => self.read_chunk(),
        }
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.child.kill() {
                warn!("Failed to stop ffmpeg: {e}");
            }
            let _ = self.child.wait();
        }
    }
}

/// Convert raw `f32le` bytes to samples. A trailing partial sample is dropped.
fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_bytes_to_f32() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-0.25f32).to_le_bytes());
        bytes.push(0xff);

        let samples = bytes_to_f32(&bytes);
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.5).abs() < f32::EPSILON);
        assert!((samples[1] + 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_resolve_configured_binary() {
        let path = FfmpegDecoder::resolve_binary(Some(Path::new("/opt/ffmpeg/bin/ffmpeg")));
        assert_eq!(path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    }

    #[test]
    fn test_missing_binary() {
        let result = FfmpegDecoder::open(
            Path::new("/nonexistent/ffmpeg"),
            Path::new("track.wma"),
            48000,
        );
        assert!(matches!(result, Err(Error::AudioDecode(_))));
    }

    /// Stand-in for ffmpeg: a shell script that ignores its arguments.
    #[cfg(unix)]
    struct FakeFfmpeg(PathBuf);

    #[cfg(unix)]
    impl FakeFfmpeg {
        fn new(name: &str, body: &str) -> Self {
            use std::os::unix::fs::PermissionsExt;

            let path = std::env::temp_dir().join(format!(
                "playaudio-fake-ffmpeg-{}-{name}",
                std::process::id()
            ));
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self(path)
        }
    }

    #[cfg(unix)]
    impl Drop for FakeFfmpeg {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_streams_in_chunks() {
        // 5000 zero samples.
        let ffmpeg = FakeFfmpeg::new("zeros", "exec head -c 20000 /dev/zero");
        let mut decoder = FfmpegDecoder::open(&ffmpeg.0, Path::new("in.wma"), 1000).unwrap();
        assert_eq!(decoder.sample_rate(), 1000);
        assert_eq!(decoder.channels(), 2);

        let sizes: Vec<usize> = std::iter::from_fn(|| decoder.decode_next().unwrap())
            .map(|chunk| chunk.len())
            .collect();
        assert_eq!(sizes, [2048, 2048, 904]);
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_no_output_is_an_error() {
        let ffmpeg = FakeFfmpeg::new("fails", "exit 1");
        let result = FfmpegDecoder::open(&ffmpeg.0, Path::new("in.wma"), 48000);
        assert!(matches!(result, Err(Error::AudioDecode(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_drop_stops_endless_stream() {
        let ffmpeg = FakeFfmpeg::new("endless", "exec cat /dev/zero");
        let mut decoder = FfmpegDecoder::open(&ffmpeg.0, Path::new("in.wma"), 48000).unwrap();
        assert_eq!(decoder.decode_next().unwrap().unwrap().len(), CHUNK_SAMPLES);
        assert_eq!(decoder.decode_next().unwrap().unwrap().len(), CHUNK_SAMPLES);

        let started = std::time::Instant::now();
        drop(decoder);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
