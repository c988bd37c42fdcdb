use std::path::PathBuf;

use thiserror::Error;

/// Failures of a send operation, as seen by the chat client.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message is empty")]
    EmptyInput,

    #[error("a message is already being sent")]
    Busy,

    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("response has no body")]
    NoBody,

    #[error("response was interrupted: {0}")]
    Interrupted(String),
}

impl SendError {
    /// Errors raised before the conversation is touched.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SendError::EmptyInput | SendError::Busy)
    }
}

/// Failures of the proxy endpoint.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("No response body from server")]
    NoBody,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to access history file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("failed to read attachment {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("text cannot be empty")]
    EmptyText,

    #[error("failed to read audio file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("voice service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("voice service returned {status}: {detail}")]
    Status { status: u16, detail: String },
}
