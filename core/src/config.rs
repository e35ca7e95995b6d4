//! Engine configuration. Every knob has a documented default; the server
//! overrides the few it exposes and leaves the rest alone.

use std::time::Duration;

/// Tunables shared by every session the manager creates.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retained history chunks per session.
    pub history_capacity: usize,
    /// Identical inputs arriving inside this window collapse to one PTY write.
    pub input_window: Duration,
    /// Output-suppression window opened when the PTY is first sized.
    pub initial_resize_suppress: Duration,
    /// Output-suppression window opened by subsequent resizes.
    pub resize_suppress: Duration,
    /// Environment injected into every spawned shell. Entries with an empty
    /// value are skipped.
    pub term_env: Vec<(String, String)>,
    pub min_cols: u16,
    pub max_cols: u16,
    pub min_rows: u16,
    pub max_rows: u16,
    /// Upper bound on a single input request.
    pub max_input_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_capacity: 2048,
            input_window: Duration::from_millis(10),
            initial_resize_suppress: Duration::from_millis(500),
            resize_suppress: Duration::from_millis(200),
            term_env: vec![
                ("TERM".into(), "xterm-256color".into()),
                ("COLORTERM".into(), "truecolor".into()),
                ("LANG".into(), "en_US.UTF-8".into()),
                ("LC_ALL".into(), String::new()),
                ("TERM_PROGRAM".into(), "floeterm".into()),
                ("TERM_PROGRAM_VERSION".into(), env!("CARGO_PKG_VERSION").into()),
                ("TERMINFO".into(), String::new()),
                ("TERM_FEATURES".into(), String::new()),
            ],
            min_cols: 20,
            max_cols: 500,
            min_rows: 5,
            max_rows: 200,
            max_input_bytes: 64 * 1024,
        }
    }
}

impl Config {
    /// Whether a requested terminal size is inside the accepted bounds.
    pub fn dims_valid(&self, cols: u32, rows: u32) -> bool {
        cols >= u32::from(self.min_cols)
            && cols <= u32::from(self.max_cols)
            && rows >= u32::from(self.min_rows)
            && rows <= u32::from(self.max_rows)
    }

    /// Force a size into the accepted bounds.
    pub fn clamp_dims(&self, cols: u16, rows: u16) -> (u16, u16) {
        (
            cols.clamp(self.min_cols, self.max_cols),
            rows.clamp(self.min_rows, self.max_rows),
        )
    }
}
