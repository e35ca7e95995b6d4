//! floeterm core: PTY-backed shell sessions, sequence-stamped ring-buffer
//! history, terminal auto-response filtering, working-directory tracking, and
//! the session manager. No HTTP — the server crate owns the wire.

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod manager;
pub mod session;
pub mod shell;
pub mod workdir;

pub use buffer::{BufferStats, Chunk, RingBuffer};
pub use config::Config;
pub use error::{Result, TerminalError};
pub use events::{DataEvent, NameChangedEvent, SessionInfo, TerminalEventHandler};
pub use manager::{CreateSessionOptions, SessionManager};
pub use session::Session;

/// Unix timestamp for "now" (milliseconds).
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
