//! Conversion error types.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Coarse error category, for callers that decide on retries or reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The engine artifact could not be located.
    Resolution,
    /// The markup cannot be sent to the engine as one diagram.
    Markup,
    /// The engine process failed to start or died mid-conversion.
    Process,
    /// The HTTP exchange with the engine service failed.
    Transport,
    /// Reading or writing a file or the output sink failed.
    Io,
    /// The conversion did not finish within its time limit.
    Timeout,
    /// The converter was used after disposal.
    Disposed,
}

/// Error returned by a conversion or disposal.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConvertError {
    /// Engine artifact not found where it was expected.
    #[error("engine artifact not found at {}", .path.display())]
    Resolution {
        /// Path that was checked.
        path: PathBuf,
    },

    /// Markup holds more than one diagram, or text after its end marker.
    #[error("markup holds {units} diagrams; split it and convert each one")]
    MultipleUnits {
        /// Diagrams found, counting trailing text as the start of another.
        units: usize,
    },

    /// Engine process could not be spawned.
    #[error("failed to start engine `{program}`")]
    Spawn {
        /// Program that failed to launch.
        program: String,
        #[source]
        source: io::Error,
    },

    /// Engine process exited while it was needed.
    #[error("engine exited unexpectedly{}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    EngineExited {
        /// Exit status, when it could be collected.
        status: Option<ExitStatus>,
    },

    /// Engine output ended before the unit delimiter arrived.
    #[error("engine output closed after {received} bytes without a delimiter")]
    StreamClosed {
        /// Bytes received before end of stream.
        received: u64,
    },

    /// Reading from or writing to the engine's pipes failed.
    #[error("engine pipe error")]
    Pipe(#[source] io::Error),

    /// HTTP request failed (connection refused, protocol error, etc).
    #[error("HTTP request failed")]
    Http(#[from] ureq::Error),

    /// Engine service answered with an error that carries no image.
    #[error("HTTP error: {status} - {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Response body (may contain error details).
        body: String,
    },

    /// Filesystem or output sink failure.
    #[error("I/O error")]
    Io(#[from] io::Error),

    /// Conversion exceeded its time limit.
    #[error("conversion timed out after {0:?}")]
    Timeout(Duration),

    /// Converter was disposed before this call.
    #[error("converter has been disposed")]
    Disposed,
}

impl ConvertError {
    /// Category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::MultipleUnits { .. } => ErrorKind::Markup,
            Self::Spawn { .. }
            | Self::EngineExited { .. }
            | Self::StreamClosed { .. }
            | Self::Pipe(_) => ErrorKind::Process,
            Self::Http(_) | Self::HttpStatus { .. } => ErrorKind::Transport,
            Self::Io(_) => ErrorKind::Io,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Disposed => ErrorKind::Disposed,
        }
    }
}
