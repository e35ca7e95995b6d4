//! Registry and lifecycle owner for all sessions.
//!
//! The manager holds every session behind a single reader/writer lock,
//! together with the creation-order list and the one event-handler slot.
//! Handler callbacks are always invoked after that lock is released; the
//! deadlock-free reentrancy of handlers calling back into the API depends on
//! it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, TerminalError};
use crate::events::{dispatch, SessionInfo, TerminalEventHandler};
use crate::session::{Session, DEFAULT_COLS, DEFAULT_ROWS};
use crate::shell::ShellPolicy;
use crate::workdir;

#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub name: Option<String>,
    pub working_dir: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

struct ManagerState {
    sessions: HashMap<String, Arc<Session>>,
    /// Creation order; always a permutation of `sessions` keys.
    order: Vec<String>,
    handler: Option<Arc<dyn TerminalEventHandler>>,
}

pub struct SessionManager {
    state: RwLock<ManagerState>,
    config: Arc<Config>,
    shell: ShellPolicy,
}

impl SessionManager {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_shell(config, ShellPolicy::default())
    }

    pub fn with_shell(config: Config, shell: ShellPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ManagerState {
                sessions: HashMap::new(),
                order: Vec::new(),
                handler: None,
            }),
            config: Arc::new(config),
            shell,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn state_read(&self) -> RwLockReadGuard<'_, ManagerState> {
        self.state.read().expect("manager state lock")
    }

    fn state_write(&self) -> RwLockWriteGuard<'_, ManagerState> {
        self.state.write().expect("manager state lock")
    }

    /// Install the event handler on the manager and on every live session.
    pub fn set_event_handler(&self, handler: Arc<dyn TerminalEventHandler>) {
        let mut state = self.state_write();
        state.handler = Some(handler.clone());
        for session in state.sessions.values() {
            session.set_handler(Some(handler.clone()));
        }
    }

    fn handler(&self) -> Option<Arc<dyn TerminalEventHandler>> {
        self.state_read().handler.clone()
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.state_read()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| TerminalError::SessionNotFound(id.to_string()))
    }

    /// Snapshots of all sessions, in creation order.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let state = self.state_read();
        state
            .order
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .map(|session| session.info())
            .collect()
    }

    /// Create and activate a session.
    ///
    /// The session is registered before the PTY starts so an instantly
    /// exiting child still finds it to reap — but the reaper waits on a
    /// created-observed barrier, so the closed event can never overtake the
    /// created event.
    pub async fn create_session(self: &Arc<Self>, opts: CreateSessionOptions) -> Result<SessionInfo> {
        let id = format!("session-{}", Uuid::new_v4().as_simple());

        let working_dir = match opts.working_dir {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                if !dir.is_dir() {
                    return Err(TerminalError::InvalidArgument(format!(
                        "workingDir is not a directory: {}",
                        dir.display()
                    )));
                }
                dir
            }
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .filter(|p| p.is_dir())
                .unwrap_or_else(|| PathBuf::from("/")),
        };
        let name = opts
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| workdir::derive_name(&working_dir));

        let session = Session::new(
            id.clone(),
            name,
            working_dir,
            self.config.clone(),
            self.shell.clone(),
        );
        session.set_handler(self.handler());

        {
            let mut state = self.state_write();
            state.sessions.insert(id.clone(), session.clone());
            state.order.push(id.clone());
        }

        let created_barrier = CancellationToken::new();
        {
            let barrier = created_barrier.clone();
            let manager = Arc::downgrade(self);
            session.set_exit_callback(Arc::new(move |session_id: &str| {
                let session_id = session_id.to_string();
                let barrier = barrier.clone();
                let manager = manager.clone();
                tokio::spawn(async move {
                    barrier.cancelled().await;
                    if let Some(manager) = manager.upgrade() {
                        manager.reap(&session_id).await;
                    }
                });
            }));
        }

        let cols = opts.cols.unwrap_or(DEFAULT_COLS);
        let rows = opts.rows.unwrap_or(DEFAULT_ROWS);
        if let Err(e) = session.activate(cols, rows).await {
            warn!(session = %id, error = %e, "activation failed, rolling back");
            self.detach(&id);
            session.close().await;
            created_barrier.cancel();
            return Err(e);
        }

        // The handler slot may have been swapped while the shell spawned;
        // deliver the created event to the current one.
        let handler = self.handler();
        session.set_handler(handler.clone());
        let snapshot = session.info();
        if let Some(handler) = &handler {
            dispatch("session_created", || handler.on_session_created(&snapshot));
        }
        created_barrier.cancel();
        info!(session = %id, "session created");
        Ok(snapshot)
    }

    fn detach(&self, id: &str) -> Option<Arc<Session>> {
        let mut state = self.state_write();
        let session = state.sessions.remove(id)?;
        state.order.retain(|existing| existing != id);
        Some(session)
    }

    /// Remove and tear down a session. The closed event fires after the
    /// registry lock is released.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let session = self
            .detach(id)
            .ok_or_else(|| TerminalError::SessionNotFound(id.to_string()))?;
        session.close().await;
        if let Some(handler) = self.handler() {
            dispatch("session_closed", || handler.on_session_closed(id));
        }
        info!(session = %id, "session deleted");
        Ok(())
    }

    /// Auto-reap path used after the child exits: same detach → close →
    /// notify order as an explicit delete.
    async fn reap(&self, id: &str) {
        let Some(session) = self.detach(id) else {
            return;
        };
        session.close().await;
        if let Some(handler) = self.handler() {
            dispatch("session_closed", || handler.on_session_closed(id));
        }
        info!(session = %id, "session reaped after child exit");
    }

    /// Start the PTY for a dormant session; a no-op while it is active.
    pub async fn activate_session(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self.get(id)?;
        session.activate(cols, rows).await
    }

    /// Tear down every session, for graceful shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<(String, Arc<Session>)> = {
            let mut state = self.state_write();
            state.order.clear();
            state.sessions.drain().collect()
        };
        let handler = self.handler();
        for (id, session) in sessions {
            session.close().await;
            if let Some(handler) = &handler {
                dispatch("session_closed", || handler.on_session_closed(&id));
            }
        }
    }
}
