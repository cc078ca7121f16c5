use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::guid::Guid;

/// The coarse failure categories every operation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParameter,
    OutOfResources,
    Aborted,
    NotFound,
    Unsupported,
    SectionError,
    VolumeCorrupted,
}

/// The primary error type for all operations in the `fmmt` crate.
#[derive(Error, Debug)]
pub enum FmmtError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Malformed framing, checksum mismatch or any other condition that stops the walk.
    #[error("aborted: {0}")]
    Aborted(String),

    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// An external tool ran but returned a non-zero exit status.
    #[error("tool '{tool}' failed with {status}")]
    ToolFailed { tool: String, status: ExitStatus },

    #[error("not found: {0}")]
    NotFound(String),

    /// A GUID-defined section whose GUID has no registered decoder.
    #[error("no tool registered for GUID-defined section {guid}")]
    Unsupported { guid: Guid },

    #[error("section error: {0}")]
    SectionError(String),

    #[error("volume corrupted: {0}")]
    VolumeCorrupted(String),
}

impl FmmtError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FmmtError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            FmmtError::OutOfResources(_) => ErrorKind::OutOfResources,
            FmmtError::Aborted(_) | FmmtError::Io { .. } | FmmtError::ToolFailed { .. } => {
                ErrorKind::Aborted
            }
            FmmtError::NotFound(_) => ErrorKind::NotFound,
            FmmtError::Unsupported { .. } => ErrorKind::Unsupported,
            FmmtError::SectionError(_) => ErrorKind::SectionError,
            FmmtError::VolumeCorrupted(_) => ErrorKind::VolumeCorrupted,
        }
    }

    /// Wraps an `io::Error` together with the path it happened on.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        FmmtError::Io {
            source,
            path: path.into(),
        }
    }
}

impl From<std::io::Error> for FmmtError {
    fn from(err: std::io::Error) -> Self {
        FmmtError::Io {
            source: err,
            path: PathBuf::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FmmtError>;
