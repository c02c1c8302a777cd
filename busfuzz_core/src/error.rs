#![allow(missing_docs)]
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Custom Result type used in this crate
pub(crate) type CanFuzzResult<T> = Result<T, CanFuzzError>;

#[derive(Debug, Error)]
pub enum CanFuzzError {
    #[error("{err_msg}")]
    Custom { err_msg: String },
    #[error("malformed frame `{input}`: {reason}")]
    MalformedFrame { input: String, reason: String },
    #[error("could not open CAN channel {channel}: {err_msg}")]
    TransportUnavailable { channel: String, err_msg: String },
    #[error("could not write to the transport")]
    TransportWrite,
    #[error("could not read from the transport")]
    TransportRead,
    #[error("{path}:{line}: not a valid log record: {reason}")]
    LogFormat {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("run into a timeout {elapsed}.")]
    Timeout { elapsed: Elapsed },
    #[error("{err}")]
    IoError { err: std::io::Error },
    #[error("{err}")]
    Serde { err: serde_json::Error },
}

impl From<std::io::Error> for CanFuzzError {
    fn from(err: std::io::Error) -> Self {
        CanFuzzError::IoError { err }
    }
}

impl From<serde_json::Error> for CanFuzzError {
    fn from(err: serde_json::Error) -> Self {
        CanFuzzError::Serde { err }
    }
}

impl From<Elapsed> for CanFuzzError {
    fn from(elapsed: Elapsed) -> Self {
        CanFuzzError::Timeout { elapsed }
    }
}
