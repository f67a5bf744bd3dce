//! Error types for playaudio.

use thiserror::Error;

/// Result type alias using playaudio's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for playaudio.
#[derive(Error, Debug)]
pub enum Error {
    // Audio errors
    #[error("Audio decode error: {0}")]
    AudioDecode(String),

    #[error("Audio output error: {0}")]
    AudioOutput(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    // Engine lifecycle
    #[error("Audio engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the error only affects the current file.
    ///
    /// Anything else means the session itself is unusable.
    pub const fn is_per_file(&self) -> bool {
        matches!(
            self,
            Self::AudioDecode(_)
                | Self::UnsupportedFormat(_)
                | Self::Io(_)
                | Self::InvalidArgument(_)
                | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_per_file() {
        assert!(Error::AudioDecode("test".into()).is_per_file());
        assert!(Error::UnsupportedFormat("too many channels: 6".into()).is_per_file());
        assert!(!Error::EngineUnavailable("worker gone".into()).is_per_file());
        assert!(!Error::AudioOutput("test".into()).is_per_file());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnsupportedFormat("too many channels: 6".into());
        assert_eq!(
            err.to_string(),
            "Unsupported audio format: too many channels: 6"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.flac");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_per_file());
    }
}
