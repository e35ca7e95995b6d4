//! Client-side reconciliation of the server's session list.
//!
//! Keeps a sorted snapshot (creation time, then id) that subscribers observe
//! through a watch channel. Deletes are optimistic: the session disappears
//! from the snapshot immediately and is re-included (with a forced refresh)
//! if the server refuses. Concurrent refreshes are deduplicated by a
//! monotonic sequence so a slow, stale response can never overwrite a newer
//! one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use floeterm_core::events::SessionInfo;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::transport::{CreateSessionRequest, SessionsTransport, TransportError};

/// How often the list is re-fetched while subscribers exist.
pub const DEFAULT_POLL: Duration = Duration::from_secs(10);

/// Fields a live event may patch onto a session summary.
#[derive(Debug, Clone, Default)]
pub struct SessionMetaPatch {
    pub name: Option<String>,
    pub working_dir: Option<String>,
    pub last_active_at_ms: Option<i64>,
    pub is_active: Option<bool>,
}

struct CoordState {
    sessions: Vec<SessionInfo>,
    /// Sessions optimistically removed while their DELETE is in flight.
    pending_deletions: HashSet<String>,
    last_applied_refresh: u64,
}

pub struct SessionsCoordinator {
    transport: Arc<dyn SessionsTransport>,
    state: Mutex<CoordState>,
    snapshot: watch::Sender<Vec<SessionInfo>>,
    refresh_seq: AtomicU64,
    poll_interval: Duration,
    polling: AtomicBool,
}

impl SessionsCoordinator {
    pub fn new(transport: Arc<dyn SessionsTransport>) -> Arc<Self> {
        Self::with_poll_interval(transport, DEFAULT_POLL)
    }

    pub fn with_poll_interval(
        transport: Arc<dyn SessionsTransport>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (snapshot, _) = watch::channel(Vec::new());
        Arc::new(Self {
            transport,
            state: Mutex::new(CoordState {
                sessions: Vec::new(),
                pending_deletions: HashSet::new(),
                last_applied_refresh: 0,
            }),
            snapshot,
            refresh_seq: AtomicU64::new(0),
            poll_interval,
            polling: AtomicBool::new(false),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CoordState> {
        self.state.lock().expect("coordinator state lock")
    }

    /// Current snapshot plus a receiver for future ones. Polling runs while
    /// any receiver exists.
    pub fn subscribe(self: &Arc<Self>) -> watch::Receiver<Vec<SessionInfo>> {
        let receiver = self.snapshot.subscribe();
        self.ensure_polling();
        receiver
    }

    fn ensure_polling(self: &Arc<Self>) {
        if self.polling.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            loop {
                ticker.tick().await;
                if this.snapshot.receiver_count() == 0 {
                    this.polling.store(false, Ordering::SeqCst);
                    debug!("no subscribers left, stopping session polling");
                    break;
                }
                if let Err(e) = this.refresh().await {
                    warn!(error = %e, "session list refresh failed");
                }
            }
        });
    }

    /// Re-fetch the list and apply it, unless a newer refresh already landed.
    pub async fn refresh(&self) -> Result<(), TransportError> {
        let seq = self.refresh_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let listed = self.transport.list_sessions().await?;
        self.apply_refresh(seq, listed);
        Ok(())
    }

    /// Apply one refresh result. Stale results (an older `seq` than the last
    /// applied one) are discarded; returns whether the result was applied.
    fn apply_refresh(&self, seq: u64, listed: Vec<SessionInfo>) -> bool {
        let mut state = self.state();
        if seq <= state.last_applied_refresh {
            return false;
        }
        state.last_applied_refresh = seq;
        let mut next: Vec<SessionInfo> = listed
            .into_iter()
            .filter(|s| !state.pending_deletions.contains(&s.id))
            .collect();
        sort_sessions(&mut next);
        if next != state.sessions {
            state.sessions = next.clone();
            self.snapshot.send_replace(next);
        }
        true
    }

    /// Create via the transport and merge the result into the snapshot.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, TransportError> {
        let created = self.transport.create_session(request).await?;
        {
            let mut state = self.state();
            if !state.pending_deletions.contains(&created.id) {
                state.sessions.retain(|s| s.id != created.id);
                state.sessions.push(created.clone());
                sort_sessions(&mut state.sessions);
                self.snapshot.send_replace(state.sessions.clone());
            }
        }
        Ok(created)
    }

    /// Optimistically remove, then delete on the server. On failure the
    /// pending marker is cleared and a forced refresh re-includes the
    /// session before the error is rethrown.
    pub async fn delete_session(&self, id: &str) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            state.pending_deletions.insert(id.to_string());
            state.sessions.retain(|s| s.id != id);
            self.snapshot.send_replace(state.sessions.clone());
        }
        match self.transport.delete_session(id).await {
            Ok(()) => {
                self.state().pending_deletions.remove(id);
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "refresh after delete failed");
                }
                Ok(())
            }
            Err(e) => {
                self.state().pending_deletions.remove(id);
                if let Err(refresh_err) = self.refresh().await {
                    warn!(error = %refresh_err, "rollback refresh failed");
                }
                Err(e)
            }
        }
    }

    /// Patch a summary in place from a live event. Ignored while the session
    /// is pending deletion.
    pub fn update_session_meta(&self, id: &str, patch: SessionMetaPatch) {
        let mut state = self.state();
        if state.pending_deletions.contains(id) {
            return;
        }
        let Some(session) = state.sessions.iter_mut().find(|s| s.id == id) else {
            return;
        };
        if let Some(name) = patch.name {
            session.name = name;
        }
        if let Some(working_dir) = patch.working_dir {
            session.working_dir = working_dir;
        }
        if let Some(last_active) = patch.last_active_at_ms {
            session.last_active_at_ms = last_active;
        }
        if let Some(is_active) = patch.is_active {
            session.is_active = is_active;
        }
        self.snapshot.send_replace(state.sessions.clone());
    }

    /// Current snapshot without subscribing.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.state().sessions.clone()
    }
}

fn sort_sessions(sessions: &mut [SessionInfo]) {
    sessions.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
}
