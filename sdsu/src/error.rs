/*!
Error types for the SDSU controller library.
*/

use thiserror::Error;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, SdsuError>;

/// Broad failure category, stable across releases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad argument, caught before any bus I/O
    Validation,
    /// The register bus itself failed
    Transport,
    /// The controller answered ERR or something unexpected
    Protocol,
    /// The abort flag was observed while waiting
    Aborted,
    /// No reply arrived within the wall-clock bound
    Timeout,
    /// Buffer allocation failed
    Resource,
}

/// Error type for all controller operations
#[derive(Error, Debug)]
pub enum SdsuError {
    /// Argument outside its permitted set or range
    #[error("{operation}: invalid argument: {reason}")]
    InvalidArgument { operation: &'static str, reason: String },

    /// Register bus reported a failure
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O errors (device files, program files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Controller replied ERR
    #[error("{operation}: controller replied ERR")]
    ProtocolError { operation: &'static str },

    /// Controller replied with something other than the expected word
    #[error("{operation}: unexpected reply {got:#08X}, expected {expected:#08X}")]
    UnexpectedReply {
        operation: &'static str,
        got: i32,
        expected: i32,
    },

    /// Abort flag observed while waiting
    #[error("{operation}: aborted")]
    Aborted { operation: &'static str },

    /// Reply did not arrive in time
    #[error("{operation}: no reply after {elapsed_ms} ms")]
    Timeout { operation: &'static str, elapsed_ms: u64 },

    /// Image buffer allocation failed
    #[error("resource error: {0}")]
    Resource(String),

    /// Malformed DSP program file
    #[error("program file line {line}: {reason}")]
    Download { line: usize, reason: String },
}

impl SdsuError {
    /// Create a new invalid argument error
    pub fn invalid_argument(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation,
            reason: reason.into(),
        }
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Create a new program file error
    pub fn download(line: usize, reason: impl Into<String>) -> Self {
        Self::Download {
            line,
            reason: reason.into(),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::Download { .. } => ErrorKind::Validation,
            Self::Transport(_) | Self::Io(_) => ErrorKind::Transport,
            Self::ProtocolError { .. } | Self::UnexpectedReply { .. } => ErrorKind::Protocol,
            Self::Aborted { .. } => ErrorKind::Aborted,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Resource(_) => ErrorKind::Resource,
        }
    }

    /// Whether this error came from an observed abort
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}
