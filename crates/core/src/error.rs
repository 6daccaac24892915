//! Error taxonomy shared by the transport, transcription and playback layers.

/// Errors raised while talking to the remote chat, speech and transcription
/// services or while preparing audio for playback.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("request failed{}: {}", status_suffix(.status), .message)]
    RequestFailed { status: Option<u16>, message: String },
    #[error("stream error: {0}")]
    StreamError(String),
    #[error("decoding error: {0}")]
    DecodingError(String),
    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),
    #[error("playback failed: {0}")]
    PlaybackFailed(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

impl ChatError {
    pub(crate) fn status(status: reqwest::StatusCode, body: &str) -> Self {
        Self::RequestFailed {
            status: Some(status.as_u16()),
            message: body.chars().take(512).collect(),
        }
    }

    pub(crate) fn connection(err: reqwest::Error) -> Self {
        Self::RequestFailed {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Failures of the on-disk history repository.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("history document version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Rejections raised by the session orchestrator before any state changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("a turn is already in progress")]
    TurnInProgress,
    #[error("message {0} not found")]
    MessageNotFound(uuid::Uuid),
    #[error("message {0} cannot be retried")]
    NotRetryable(uuid::Uuid),
    #[error("invalid recording: {0}")]
    InvalidRecording(String),
}
