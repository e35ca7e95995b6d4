use thiserror::Error;

pub type Result<T> = std::result::Result<T, TerminalError>;

/// Errors surfaced by the session engine.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Activation was requested after the session's cancellation fired.
    #[error("session is closed")]
    SessionClosed,

    /// The session has no PTY (dormant or already torn down).
    #[error("session is not active")]
    NotActive,

    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    #[error("PTY write failed: {0}")]
    WriteFailed(std::io::Error),

    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
}
