//! Session events and the handler seam.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Session snapshot returned by the list/create APIs and carried by the
/// created event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    pub created_at_ms: i64,
    pub last_active_at_ms: i64,
    pub is_active: bool,
}

/// One read's worth of PTY output.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub session_id: String,
    pub data: Bytes,
    pub sequence: i64,
    pub timestamp_ms: i64,
    /// Set when the bytes arrived within the echo window after an input
    /// write.
    pub echo_of_input: bool,
    /// Source id of that input write, when known.
    pub original_source: Option<String>,
}

/// A session was renamed, either explicitly or by working-directory
/// detection.
#[derive(Debug, Clone)]
pub struct NameChangedEvent {
    pub session_id: String,
    pub new_name: String,
    pub working_dir: String,
    pub timestamp_ms: i64,
}

/// Receives session events.
///
/// The engine never invokes a handler while holding a session or manager
/// lock, so implementations may call straight back into the API. Calls for
/// one session arrive from that session's pump in order; `sequence` is
/// strictly increasing across its data events. For any single session,
/// the created event is delivered before the closed event, even when the
/// child exits during spawn.
pub trait TerminalEventHandler: Send + Sync {
    fn on_data(&self, event: DataEvent);
    fn on_name_changed(&self, event: NameChangedEvent);
    fn on_session_created(&self, session: &SessionInfo);
    fn on_session_closed(&self, session_id: &str);
    fn on_error(&self, session_id: &str, error: &str);
}

/// Invoke a handler callback, containing panics. A broken handler must not
/// take the session's pump down with it.
pub(crate) fn dispatch<F: FnOnce()>(event: &str, callback: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
        tracing::error!(event, "event handler panicked");
    }
}
