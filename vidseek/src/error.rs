use std::path::PathBuf;
use std::time::Duration;

/// All errors that can occur in vidseek.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot allocate session directory {path}: {source}")]
    Allocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("download failed for {reference}: {reason}")]
    Fetch { reference: String, reason: String },

    #[error("yt-dlp not found, install with: pip install yt-dlp")]
    YtDlpNotFound,

    #[error("transcription model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("model not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("model download failed: {0}")]
    ModelDownload(String),

    #[error("transcription produced no segments")]
    TranscriptionEmpty,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("duplicate frame timestamp {timestamp:.3}s within one extraction run")]
    FrameCollision { timestamp: f64 },

    #[error("corrupt cache entry {key}: {reason}")]
    CacheCorrupt { key: String, reason: String },

    #[error("caption file unreadable: {path}: {reason}")]
    CaptionUnreadable { path: PathBuf, reason: String },

    #[error("object detection failed: {0}")]
    Detection(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("whisper error: {0}")]
    Whisper(#[from] whisper_rs::WhisperError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error classes the response layer is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Allocation,
    Fetch,
    ModelUnavailable,
    TranscriptionEmpty,
    Decode,
    CacheCorrupt,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Allocation { .. } => ErrorKind::Allocation,
            Error::Fetch { .. } | Error::YtDlpNotFound => ErrorKind::Fetch,
            Error::ModelUnavailable(_)
            | Error::ModelNotFound { .. }
            | Error::ModelDownload(_) => ErrorKind::ModelUnavailable,
            Error::TranscriptionEmpty => ErrorKind::TranscriptionEmpty,
            Error::Decode(_) | Error::FrameCollision { .. } => ErrorKind::Decode,
            Error::CacheCorrupt { .. } => ErrorKind::CacheCorrupt,
            Error::CaptionUnreadable { .. }
            | Error::Detection(_)
            | Error::Timeout { .. }
            | Error::InvalidOption(_)
            | Error::Whisper(_)
            | Error::Io(_)
            | Error::Http(_)
            | Error::Json(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn fetch(reference: &str, reason: impl Into<String>) -> Self {
        Error::Fetch {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    /// Classify any failure of a media fetch as a fetch failure. Timeouts and
    /// I/O errors from the downloader become [`Error::Fetch`].
    pub(crate) fn into_fetch(self, reference: &str) -> Self {
        match self.kind() {
            ErrorKind::Fetch | ErrorKind::Allocation => self,
            _ => Error::fetch(reference, self.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_fetch() {
        let e = Error::fetch("invalid_url", "yt-dlp exited with 1");
        let msg = e.to_string();
        assert!(msg.contains("invalid_url"));
        assert!(msg.contains("yt-dlp exited with 1"));
    }

    #[test]
    fn test_error_display_frame_collision() {
        let e = Error::FrameCollision { timestamp: 12.5 };
        assert!(e.to_string().contains("12.500s"));
    }

    #[test]
    fn test_error_display_allocation() {
        let e = Error::Allocation {
            path: PathBuf::from("/tmp/vidseek/abc"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = e.to_string();
        assert!(msg.contains("/tmp/vidseek/abc"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::YtDlpNotFound.kind(), ErrorKind::Fetch);
        assert_eq!(
            Error::ModelNotFound {
                path: PathBuf::from("/nope.bin")
            }
            .kind(),
            ErrorKind::ModelUnavailable
        );
        assert_eq!(Error::TranscriptionEmpty.kind(), ErrorKind::TranscriptionEmpty);
        assert_eq!(
            Error::FrameCollision { timestamp: 1.0 }.kind(),
            ErrorKind::Decode
        );
        assert_eq!(Error::Detection("boom".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_into_fetch() {
        let timeout = Error::Timeout {
            operation: "yt-dlp",
            after: Duration::from_secs(1),
        };
        let err = timeout.into_fetch("https://example.com/v");
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(err.to_string().contains("yt-dlp timed out"));

        assert!(matches!(
            Error::YtDlpNotFound.into_fetch("https://example.com/v"),
            Error::YtDlpNotFound
        ));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert_eq!(e.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<String>("invalid json").unwrap_err();
        let e: Error = json_err.into();
        assert!(matches!(e, Error::Json(_)));
    }
}
