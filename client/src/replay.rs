//! Outbound auto-response gate.
//!
//! When recorded output containing terminal queries is replayed into an
//! xterm-style emulator, the emulator answers them — and those answers head
//! straight for the PTY, where they corrupt whatever is running. For a short
//! window after a replay starts, outbound bytes are scrubbed with the same
//! filter the server applies to history; outside the window they pass
//! through untouched.

use floeterm_core::filter;

/// How long after a replay begins that outbound bytes are scrubbed.
pub const REPLAY_WINDOW_MS: i64 = 5_000;

#[derive(Debug, Default)]
pub struct ReplayGate {
    replay_started_at_ms: Option<i64>,
}

impl ReplayGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call when a history replay begins feeding the emulator.
    pub fn begin_replay(&mut self, now_ms: i64) {
        self.replay_started_at_ms = Some(now_ms);
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        self.replay_started_at_ms
            .is_some_and(|started| now_ms - started < REPLAY_WINDOW_MS)
    }

    /// Filter keystrokes headed for the server.
    pub fn filter_outbound(&self, data: &[u8], now_ms: i64) -> Vec<u8> {
        if self.is_active(now_ms) {
            filter::scrub_auto_responses(data)
        } else {
            data.to_vec()
        }
    }
}
