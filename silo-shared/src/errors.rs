//! Error types shared by the host runtime and the guest agent.

use thiserror::Error;

/// Result alias used across silo crates.
pub type SiloResult<T> = Result<T, SiloError>;

/// Errors produced by the silo runtime.
///
/// Context belongs in the message: call sites format the failing path or
/// operation into the string rather than layering wrapper types.
#[derive(Error, Debug)]
pub enum SiloError {
    /// A container, process, image layer, or archive entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The host or guest lacks a required capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A file type the EXT4 formatter cannot represent, or a resolution
    /// that would require following one (symlink cycles included).
    #[error("unsupported filetype: {0}")]
    UnsupportedFiletype(String),

    /// Caller-supplied configuration is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Host-side I/O failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// On-disk or wire format corruption, unknown archive format or filter.
    #[error("format error: {0}")]
    Format(String),

    /// A structured failure reported by the guest agent, carried verbatim.
    #[error("agent error: {0}")]
    Agent(String),

    /// Anything that indicates a bug or a broken invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SiloError {
    /// The message without the kind prefix, for wire transport.
    pub fn message(&self) -> &str {
        match self {
            SiloError::NotFound(m)
            | SiloError::Unsupported(m)
            | SiloError::UnsupportedFiletype(m)
            | SiloError::InvalidArgument(m)
            | SiloError::InvalidState(m)
            | SiloError::Io(m)
            | SiloError::Format(m)
            | SiloError::Agent(m)
            | SiloError::Internal(m) => m,
        }
    }

    /// Stable kind tag used when an error crosses the agent wire.
    pub fn kind(&self) -> &'static str {
        match self {
            SiloError::NotFound(_) => "not_found",
            SiloError::Unsupported(_) => "unsupported",
            SiloError::UnsupportedFiletype(_) => "unsupported_filetype",
            SiloError::InvalidArgument(_) => "invalid_argument",
            SiloError::InvalidState(_) => "invalid_state",
            SiloError::Io(_) => "io",
            SiloError::Format(_) => "format",
            SiloError::Agent(_) => "agent",
            SiloError::Internal(_) => "internal",
        }
    }

    /// Rebuild an error from its wire `(kind, message)` pair.
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "not_found" => SiloError::NotFound(message),
            "unsupported" => SiloError::Unsupported(message),
            "unsupported_filetype" => SiloError::UnsupportedFiletype(message),
            "invalid_argument" => SiloError::InvalidArgument(message),
            "invalid_state" => SiloError::InvalidState(message),
            "io" => SiloError::Io(message),
            "format" => SiloError::Format(message),
            "agent" => SiloError::Agent(message),
            _ => SiloError::Internal(message),
        }
    }
}

impl From<std::io::Error> for SiloError {
    fn from(e: std::io::Error) -> Self {
        SiloError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SiloError {
    fn from(e: serde_json::Error) -> Self {
        SiloError::Format(format!("json: {}", e))
    }
}
