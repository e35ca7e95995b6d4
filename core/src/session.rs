//! A single PTY-backed shell session.
//!
//! Each active session owns one PTY pair and one child process. A dedicated
//! OS thread pumps PTY output (the portable-pty reader is blocking) into a
//! bounded channel; an async pump task stamps each read with a sequence
//! number, records it in the ring buffer, and hands it to the event handler.
//! A separate waiter task reaps the child. All mutable state sits behind one
//! reader/writer lock, and no handler is ever invoked while that lock is
//! held.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferStats, Chunk, RingBuffer};
use crate::config::Config;
use crate::error::{Result, TerminalError};
use crate::events::{dispatch, DataEvent, NameChangedEvent, SessionInfo, TerminalEventHandler};
use crate::shell::ShellPolicy;
use crate::{now_ms, workdir};

/// Bytes read from the PTY per syscall.
const READ_CHUNK: usize = 4096;
/// Output arriving this soon after an input write is attributed as its echo.
const ECHO_WINDOW_MS: i64 = 100;
/// Grace between SIGTERM and SIGKILL on close.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Delay before the confirming second resize after spawn; some emulators
/// only honor the size they see once the program is running.
const CONFIRM_RESIZE_DELAY: Duration = Duration::from_millis(10);

/// Size used when no connection dictates one.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// A live client attachment, used for write attribution and minimum sizing.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub conn_id: String,
    pub joined_at_ms: i64,
    pub cols: u16,
    pub rows: u16,
}

/// Fingerprint of the most recent input write.
struct LastInput {
    source: Option<String>,
    at: Instant,
    at_ms: i64,
    sha256: [u8; 32],
    len: usize,
}

struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

pub(crate) type ExitCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct SessionState {
    name: String,
    working_dir: PathBuf,
    created_at_ms: i64,
    last_active_ms: i64,
    active: bool,
    pty: Option<PtyHandle>,
    buffer: RingBuffer,
    size: (u16, u16),
    resize_suppress_until: Option<Instant>,
    last_input: Option<LastInput>,
    connections: HashMap<String, ConnectionInfo>,
    detected_dir: Option<PathBuf>,
    handler: Option<Arc<dyn TerminalEventHandler>>,
    on_exit: Option<ExitCallback>,
}

pub struct Session {
    pub id: String,
    config: Arc<Config>,
    shell: ShellPolicy,
    state: Mutex<SessionState>,
    /// Serializes concurrent `activate` calls without blocking the state lock.
    activate_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    /// Fires once the exit waiter has reaped the child.
    process_done: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: String,
        name: String,
        working_dir: PathBuf,
        config: Arc<Config>,
        shell: ShellPolicy,
    ) -> Arc<Self> {
        let now = now_ms();
        Arc::new(Self {
            id,
            state: Mutex::new(SessionState {
                name,
                working_dir,
                created_at_ms: now,
                last_active_ms: now,
                active: false,
                pty: None,
                buffer: RingBuffer::new(config.history_capacity),
                size: (DEFAULT_COLS, DEFAULT_ROWS),
                resize_suppress_until: None,
                last_input: None,
                connections: HashMap::new(),
                detected_dir: None,
                handler: None,
                on_exit: None,
            }),
            config,
            shell,
            activate_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            process_done: CancellationToken::new(),
        })
    }

    fn state_read(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state lock")
    }

    fn state_write(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state lock")
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state_read();
        SessionInfo {
            id: self.id.clone(),
            name: state.name.clone(),
            working_dir: state.working_dir.display().to_string(),
            created_at_ms: state.created_at_ms,
            last_active_at_ms: state.last_active_ms,
            is_active: state.active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state_read().active
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current PTY size as last applied.
    pub fn size(&self) -> (u16, u16) {
        self.state_read().size
    }

    pub fn connection_count(&self) -> usize {
        self.state_read().connections.len()
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn TerminalEventHandler>>) {
        self.state_write().handler = handler;
    }

    pub(crate) fn set_exit_callback(&self, on_exit: ExitCallback) {
        self.state_write().on_exit = Some(on_exit);
    }

    /// Spawn the shell on a fresh PTY. Idempotent while active; fails with
    /// `SessionClosed` once the session has been closed.
    pub async fn activate(self: &Arc<Self>, cols: u16, rows: u16) -> Result<()> {
        let _guard = self.activate_lock.lock().await;
        if self.cancel.is_cancelled() {
            return Err(TerminalError::SessionClosed);
        }
        if self.state_read().active {
            return Ok(());
        }

        let (cols, rows) = self.config.clamp_dims(cols, rows);
        let shell_path = self.shell.resolver.resolve();
        let shell_env = self.shell.env.build();
        let mut init_env: Vec<(String, String)> = Vec::new();
        if !shell_env.path_prepend.is_empty() {
            init_env = self
                .shell
                .init_writer
                .write_init_files(&shell_env.path_prepend)
                .map_err(|e| TerminalError::SpawnFailed(format!("shell init files: {e}")))?;
        }
        let shell_args = self.shell.args.args_for(&shell_path);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::SpawnFailed(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&shell_path);
        match &shell_args {
            // An explicit empty argv is distinct from "no opinion": zsh's
            // ZDOTDIR strategy needs the shell started bare.
            Some(args) => {
                for arg in &args.args {
                    cmd.arg(arg);
                }
            }
            None => {
                cmd.arg("-l");
            }
        }
        for (key, value) in &shell_env.vars {
            cmd.env(key, value);
        }
        if let Some(args) = &shell_args {
            for (key, value) in &args.extra_env {
                cmd.env(key, value);
            }
        }
        for (key, value) in &init_env {
            cmd.env(key, value);
        }
        for (key, value) in &self.config.term_env {
            if !value.is_empty() {
                cmd.env(key, value);
            }
        }
        cmd.env("COLUMNS", cols.to_string());
        cmd.env("LINES", rows.to_string());
        cmd.env("PROMPT_EOL_MARK", "");
        let cwd = self.state_read().working_dir.clone();
        if cwd.is_dir() {
            cmd.cwd(&cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::SpawnFailed(format!("clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::SpawnFailed(format!("take writer: {e}")))?;
        let killer = child.clone_killer();
        let pid = child.process_id();

        {
            let mut state = self.state_write();
            state.pty = Some(PtyHandle {
                master: pair.master,
                writer,
                killer,
                pid,
            });
            state.active = true;
            state.size = (cols, rows);
            state.last_active_ms = now_ms();
            state.resize_suppress_until =
                Some(Instant::now() + self.config.initial_resize_suppress);
        }
        if self.cancel.is_cancelled() {
            // A close raced the spawn; tear the fresh PTY down immediately.
            {
                let mut state = self.state_write();
                state.pty = None;
                state.active = false;
            }
            let mut child = child;
            let _ = child.kill();
            return Err(TerminalError::SessionClosed);
        }
        info!(session = %self.id, shell = %shell_path.display(), cols, rows, "session activated");

        // Size it twice: once right away, once shortly after, for emulators
        // that re-confirm their geometry on startup.
        if let Err(e) = self.apply_pty_size(cols, rows) {
            debug!(session = %self.id, error = %e, "initial resize failed");
        }
        let confirm = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(CONFIRM_RESIZE_DELAY).await;
            if let Err(e) = confirm.apply_pty_size(cols, rows) {
                debug!(session = %confirm.id, error = %e, "confirming resize failed");
            }
        });

        // Reader thread: portable-pty readers block, so this stays off the
        // async runtime.
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let cancel = self.cancel.clone();
        let session_id = self.id.clone();
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is the normal "child exited" signal on Linux.
                        if e.raw_os_error() != Some(libc::EIO) {
                            warn!(session = %session_id, error = %e, "PTY read error");
                        }
                        break;
                    }
                }
            }
        });

        let pump = Arc::clone(self);
        tokio::spawn(async move { pump.pump(rx).await });

        let waiter = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || {
                let mut child = child;
                child.wait()
            })
            .await;
            match &outcome {
                Ok(Ok(status)) => {
                    debug!(session = %waiter.id, code = status.exit_code(), "child exited")
                }
                Ok(Err(e)) => warn!(session = %waiter.id, error = %e, "child wait failed"),
                Err(e) => warn!(session = %waiter.id, error = %e, "child wait task failed"),
            }
            waiter.finish_exit();
        });

        Ok(())
    }

    async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        loop {
            let data = tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            self.process_output(data);
        }
        debug!(session = %self.id, "output pump stopped");
    }

    fn process_output(&self, data: Vec<u8>) {
        let bytes = Bytes::from(data);
        let (event, handler) = {
            let mut state = self.state_write();
            let ts = now_ms();
            state.last_active_ms = ts;
            let suppressing = state
                .resize_suppress_until
                .is_some_and(|until| Instant::now() < until);
            let sequence = if suppressing {
                // The repaint burst after a resize would pollute replay; keep
                // the numbering but skip the slot.
                state.buffer.reserve_sequence()
            } else {
                match state.buffer.write(bytes.to_vec()) {
                    Some(sequence) => sequence,
                    None => state.buffer.reserve_sequence(),
                }
            };
            let (echo_of_input, original_source) = match &state.last_input {
                Some(last) if ts - last.at_ms <= ECHO_WINDOW_MS => (true, last.source.clone()),
                _ => (false, None),
            };
            (
                DataEvent {
                    session_id: self.id.clone(),
                    data: bytes.clone(),
                    sequence,
                    timestamp_ms: ts,
                    echo_of_input,
                    original_source,
                },
                state.handler.clone(),
            )
        };
        if let Some(handler) = handler {
            dispatch("data", || handler.on_data(event));
        }
        self.track_working_dir(&bytes);
    }

    fn track_working_dir(&self, data: &[u8]) {
        if !workdir::has_cwd_hint(data) {
            return;
        }
        let Some(dir) = workdir::scan_working_dir(data) else {
            return;
        };
        let (event, handler) = {
            let mut state = self.state_write();
            if state.detected_dir.as_deref() == Some(dir.as_path()) {
                return;
            }
            state.detected_dir = Some(dir.clone());
            state.working_dir = dir.clone();
            let name = workdir::derive_name(&dir);
            state.name = name.clone();
            (
                NameChangedEvent {
                    session_id: self.id.clone(),
                    new_name: name,
                    working_dir: dir.display().to_string(),
                    timestamp_ms: now_ms(),
                },
                state.handler.clone(),
            )
        };
        info!(session = %self.id, dir = %event.working_dir, "working directory changed");
        if let Some(handler) = handler {
            dispatch("name_changed", || handler.on_name_changed(event));
        }
    }

    /// Send input to the shell. Returns `Ok(false)` when the bytes were
    /// absorbed as a duplicate delivery: redundant client paths can land the
    /// same keystrokes twice within the dedup window.
    pub fn write(&self, data: &[u8], source: Option<&str>) -> Result<bool> {
        let mut state = self.state_write();
        if state.pty.is_none() {
            return Err(TerminalError::NotActive);
        }
        let digest: [u8; 32] = Sha256::digest(data).into();
        let now = Instant::now();
        if let Some(last) = &state.last_input {
            if last.len == data.len()
                && last.sha256 == digest
                && now.duration_since(last.at) < self.config.input_window
            {
                return Ok(false);
            }
        }
        let pty = state.pty.as_mut().ok_or(TerminalError::NotActive)?;
        pty.writer.write_all(data).map_err(TerminalError::WriteFailed)?;
        pty.writer.flush().map_err(TerminalError::WriteFailed)?;
        state.last_active_ms = now_ms();
        state.last_input = Some(LastInput {
            source: source.map(str::to_string),
            at: now,
            at_ms: now_ms(),
            sha256: digest,
            len: data.len(),
        });
        Ok(true)
    }

    /// Register a client connection and re-fit the PTY to the minimum size
    /// across connections.
    pub fn add_connection(&self, conn_id: &str, cols: u16, rows: u16) {
        let (cols, rows) = {
            let mut state = self.state_write();
            state.connections.insert(
                conn_id.to_string(),
                ConnectionInfo {
                    conn_id: conn_id.to_string(),
                    joined_at_ms: now_ms(),
                    cols,
                    rows,
                },
            );
            self.min_fit(&state.connections)
        };
        if let Err(e) = self.resize_with_suppress(cols, rows) {
            debug!(session = %self.id, error = %e, "re-fit after attach failed");
        }
    }

    /// Drop a client connection and re-fit the PTY.
    pub fn remove_connection(&self, conn_id: &str) {
        let refit = {
            let mut state = self.state_write();
            if state.connections.remove(conn_id).is_none() {
                return;
            }
            self.min_fit(&state.connections)
        };
        if let Err(e) = self.resize_with_suppress(refit.0, refit.1) {
            debug!(session = %self.id, error = %e, "re-fit after detach failed");
        }
    }

    /// Update one connection's viewport and resize the PTY to the elementwise
    /// minimum across all connections.
    pub fn resize_for_connection(&self, conn_id: &str, cols: u16, rows: u16) -> Result<()> {
        let fit = {
            let mut state = self.state_write();
            let conn = state.connections.get_mut(conn_id).ok_or_else(|| {
                TerminalError::InvalidArgument(format!("unknown connection: {conn_id}"))
            })?;
            conn.cols = cols;
            conn.rows = rows;
            self.min_fit(&state.connections)
        };
        self.resize_with_suppress(fit.0, fit.1)
    }

    /// Resize to an explicit size.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.resize_with_suppress(cols, rows)
    }

    fn min_fit(&self, connections: &HashMap<String, ConnectionInfo>) -> (u16, u16) {
        if connections.is_empty() {
            return (DEFAULT_COLS, DEFAULT_ROWS);
        }
        let mut cols = u16::MAX;
        let mut rows = u16::MAX;
        for conn in connections.values() {
            cols = cols.min(conn.cols);
            rows = rows.min(conn.rows);
        }
        self.config.clamp_dims(cols, rows)
    }

    fn resize_with_suppress(&self, cols: u16, rows: u16) -> Result<()> {
        {
            let mut state = self.state_write();
            if state.pty.is_none() {
                return Err(TerminalError::NotActive);
            }
            state.resize_suppress_until = Some(Instant::now() + self.config.resize_suppress);
        }
        if let Err(e) = self.apply_pty_size(cols, rows) {
            warn!(session = %self.id, error = %e, "PTY resize failed");
            // The resize never happened; stop discarding output for it.
            let handler = {
                let mut state = self.state_write();
                state.resize_suppress_until = None;
                state.handler.clone()
            };
            if let Some(handler) = handler {
                let message = e.to_string();
                dispatch("error", || handler.on_error(&self.id, &message));
            }
            return Err(e);
        }
        Ok(())
    }

    fn apply_pty_size(&self, cols: u16, rows: u16) -> Result<()> {
        let mut state = self.state_write();
        let pty = state.pty.as_ref().ok_or(TerminalError::NotActive)?;
        pty.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::ResizeFailed(e.to_string()))?;
        state.size = (cols, rows);
        Ok(())
    }

    /// Wipe the history buffer; sequence numbering restarts at 1. Live
    /// subscribers are unaffected, though events already in flight keep
    /// their old (now unreplayable) sequences.
    pub fn clear_history(&self) {
        self.state_write().buffer.clear();
    }

    pub fn history(&self) -> Vec<Chunk> {
        self.state_write().buffer.read_all_chunks()
    }

    pub fn history_since(&self, min_timestamp_ms: i64) -> Vec<Chunk> {
        self.state_write().buffer.read_from(min_timestamp_ms)
    }

    pub fn history_stats(&self) -> BufferStats {
        self.state_read().buffer.stats()
    }

    /// Rename the session and notify subscribers.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        if new_name.trim().is_empty() {
            return Err(TerminalError::InvalidArgument(
                "name must not be empty".to_string(),
            ));
        }
        let (event, handler) = {
            let mut state = self.state_write();
            state.name = new_name.to_string();
            (
                NameChangedEvent {
                    session_id: self.id.clone(),
                    new_name: new_name.to_string(),
                    working_dir: state.working_dir.display().to_string(),
                    timestamp_ms: now_ms(),
                },
                state.handler.clone(),
            )
        };
        if let Some(handler) = handler {
            dispatch("name_changed", || handler.on_name_changed(event));
        }
        Ok(())
    }

    /// Tear the session down: cancel the reader, close the PTY, and walk the
    /// child through SIGTERM → SIGKILL with a grace period each. Idempotent;
    /// the state lock is never held across the waits.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        let (pid, killer) = {
            let mut state = self.state_write();
            state.connections.clear();
            state.active = false;
            match state.pty.take() {
                // Dropping the handle closes the master fd, which unblocks
                // the reader thread.
                Some(pty) => (pty.pid, Some(pty.killer)),
                None => (None, None),
            }
        };
        let Some(mut killer) = killer else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        if tokio::time::timeout(KILL_GRACE, self.process_done.cancelled())
            .await
            .is_err()
        {
            warn!(session = %self.id, "child ignored SIGTERM, killing");
            let _ = killer.kill();
            let _ = tokio::time::timeout(KILL_GRACE, self.process_done.cancelled()).await;
        }
        debug!(session = %self.id, "session closed");
    }

    fn finish_exit(&self) {
        let on_exit = {
            let mut state = self.state_write();
            state.active = false;
            state.pty = None;
            state.last_active_ms = now_ms();
            state.on_exit.clone()
        };
        self.process_done.cancel();
        if let Some(on_exit) = on_exit {
            on_exit(&self.id);
        }
    }
}
