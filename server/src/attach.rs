//! Attach boundary: fans one session's event stream out to its live
//! subscribers.
//!
//! Two notions of "connection" meet here. A *subscriber* is one WebSocket;
//! a *logical connection* (`connId`) is the client-side handle used for
//! sizing and write attribution, and several sockets may share one. The hub
//! ref-counts sockets per logical connection so a reconnecting client does
//! not shrink the PTY, and reports when the last socket of a connection
//! goes away so the session can drop it.
//!
//! Broadcast never blocks and never runs under the subscriber lock: the
//! subscriber set is snapshotted, the lock released, and each queue fed with
//! `try_send`. A full queue marks that subscriber as kicked and removes it —
//! its socket loop closes the connection with a policy violation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use floeterm_core::events::{DataEvent, NameChangedEvent, SessionInfo, TerminalEventHandler};
use floeterm_core::now_ms;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wire::WsMessage;

/// Queue depth per subscriber; a consumer this far behind is dropped.
pub const SUBSCRIBER_QUEUE: usize = 64;

/// Returned by `subscribe`; identifies the subscriber for teardown.
pub struct SubscriberHandle {
    pub id: u64,
    pub conn_id: Option<String>,
    /// Set when the subscriber was removed for falling behind.
    pub kicked: Arc<AtomicBool>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<WsMessage>,
    kicked: Arc<AtomicBool>,
}

#[derive(Default)]
struct Topic {
    subscribers: RwLock<Vec<Subscriber>>,
    /// Live sockets per logical connection.
    conn_refs: Mutex<HashMap<String, usize>>,
}

#[derive(Default)]
pub struct AttachHub {
    topics: DashMap<String, Arc<Topic>>,
    next_subscriber: AtomicU64,
}

impl AttachHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a session's events. When `conn_id` is
    /// present, the logical connection's socket count is incremented.
    pub fn subscribe(
        &self,
        session_id: &str,
        conn_id: Option<String>,
    ) -> (SubscriberHandle, mpsc::Receiver<WsMessage>) {
        let topic = Arc::clone(
            self.topics
                .entry(session_id.to_string())
                .or_default()
                .value(),
        );
        if let Some(conn) = &conn_id {
            *topic
                .conn_refs
                .lock()
                .expect("conn refs lock")
                .entry(conn.clone())
                .or_insert(0) += 1;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let kicked = Arc::new(AtomicBool::new(false));
        topic
            .subscribers
            .write()
            .expect("subscribers lock")
            .push(Subscriber {
                id,
                tx,
                kicked: kicked.clone(),
            });
        debug!(session = session_id, subscriber = id, "subscribed");
        (
            SubscriberHandle {
                id,
                conn_id,
                kicked,
            },
            rx,
        )
    }

    /// Remove a subscriber. Returns the logical connection whose last socket
    /// just went away, if any; the caller detaches it from the session so the
    /// minimum-size fit recomputes.
    pub fn unsubscribe(&self, session_id: &str, handle: &SubscriberHandle) -> Option<String> {
        let topic = Arc::clone(self.topics.get(session_id)?.value());
        topic
            .subscribers
            .write()
            .expect("subscribers lock")
            .retain(|s| s.id != handle.id);

        let conn = handle.conn_id.as_ref()?;
        let mut refs = topic.conn_refs.lock().expect("conn refs lock");
        match refs.get_mut(conn) {
            Some(count) if *count > 1 => {
                *count -= 1;
                None
            }
            Some(_) => {
                refs.remove(conn);
                Some(conn.clone())
            }
            None => None,
        }
    }

    /// Deliver a message to every subscriber of a session. Slow consumers
    /// (full queue) are removed; per-subscriber delivery order is the
    /// enqueue order.
    pub fn broadcast(&self, session_id: &str, message: WsMessage) {
        let Some(topic) = self.topics.get(session_id).map(|t| Arc::clone(t.value())) else {
            return;
        };
        let targets: Vec<(u64, mpsc::Sender<WsMessage>, Arc<AtomicBool>)> = topic
            .subscribers
            .read()
            .expect("subscribers lock")
            .iter()
            .map(|s| (s.id, s.tx.clone(), s.kicked.clone()))
            .collect();

        let mut dead: Vec<u64> = Vec::new();
        for (id, tx, kicked) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    kicked.store(true, Ordering::Relaxed);
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            topic
                .subscribers
                .write()
                .expect("subscribers lock")
                .retain(|s| !dead.contains(&s.id));
            warn!(session = session_id, dropped = dead.len(), "dropped slow subscribers");
        }
    }

    /// Number of live subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.topics
            .get(session_id)
            .map(|t| t.subscribers.read().expect("subscribers lock").len())
            .unwrap_or(0)
    }
}

impl TerminalEventHandler for AttachHub {
    fn on_data(&self, event: DataEvent) {
        let message = WsMessage::Data {
            session_id: event.session_id.clone(),
            data: BASE64.encode(&event.data),
            sequence: event.sequence,
            timestamp_ms: event.timestamp_ms,
            echo_of_input: event.echo_of_input,
            original_source: event.original_source,
        };
        self.broadcast(&event.session_id, message);
    }

    fn on_name_changed(&self, event: NameChangedEvent) {
        let message = WsMessage::Name {
            session_id: event.session_id.clone(),
            new_name: event.new_name,
            working_dir: event.working_dir,
            timestamp_ms: event.timestamp_ms,
        };
        self.broadcast(&event.session_id, message);
    }

    fn on_session_created(&self, session: &SessionInfo) {
        debug!(session = %session.id, "session created");
    }

    fn on_session_closed(&self, session_id: &str) {
        // Dropping the topic closes every subscriber queue; their socket
        // loops end and the clients see the stream close.
        self.topics.remove(session_id);
        debug!(session = session_id, "topic closed");
    }

    fn on_error(&self, session_id: &str, error: &str) {
        let message = WsMessage::Error {
            session_id: session_id.to_string(),
            error: error.to_string(),
            timestamp_ms: now_ms(),
        };
        self.broadcast(session_id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data_event(session: &str, seq: i64) -> DataEvent {
        DataEvent {
            session_id: session.to_string(),
            data: Bytes::from_static(b"x"),
            sequence: seq,
            timestamp_ms: seq,
            echo_of_input: false,
            original_source: None,
        }
    }

    fn sequence_of(msg: &WsMessage) -> i64 {
        match msg {
            WsMessage::Data { sequence, .. } => *sequence,
            _ => panic!("expected data message"),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_broadcasts_in_order() {
        let hub = AttachHub::new();
        let (_h1, mut rx1) = hub.subscribe("s1", None);
        let (_h2, mut rx2) = hub.subscribe("s1", None);
        for seq in 1..=3 {
            hub.on_data(data_event("s1", seq));
        }
        for rx in [&mut rx1, &mut rx2] {
            for expected in 1..=3 {
                let msg = rx.recv().await.expect("message");
                assert_eq!(sequence_of(&msg), expected);
            }
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_kicked_and_others_continue() {
        let hub = AttachHub::new();
        let (slow, _slow_rx) = hub.subscribe("s1", None);
        let (_fast, mut fast_rx) = hub.subscribe("s1", None);

        // Fill the slow queue without draining, then overflow it.
        for seq in 1..=(SUBSCRIBER_QUEUE as i64 + 1) {
            hub.on_data(data_event("s1", seq));
        }
        assert!(slow.kicked.load(Ordering::Relaxed));
        assert_eq!(hub.subscriber_count("s1"), 1);

        // The fast consumer still sees an unbroken sequence.
        for expected in 1..=(SUBSCRIBER_QUEUE as i64 + 1) {
            let msg = fast_rx.recv().await.expect("message");
            assert_eq!(sequence_of(&msg), expected);
        }
        hub.on_data(data_event("s1", 100));
        assert_eq!(sequence_of(&fast_rx.recv().await.expect("message")), 100);
    }

    #[tokio::test]
    async fn refcount_detaches_connection_on_last_socket() {
        let hub = AttachHub::new();
        let (h1, _rx1) = hub.subscribe("s1", Some("c1".to_string()));
        let (h2, _rx2) = hub.subscribe("s1", Some("c1".to_string()));

        assert_eq!(hub.unsubscribe("s1", &h1), None);
        assert_eq!(hub.unsubscribe("s1", &h2), Some("c1".to_string()));
    }

    #[tokio::test]
    async fn anonymous_subscribers_do_not_touch_refcounts() {
        let hub = AttachHub::new();
        let (anon, _rx) = hub.subscribe("s1", None);
        assert_eq!(hub.unsubscribe("s1", &anon), None);
    }

    #[tokio::test]
    async fn session_close_drops_the_topic() {
        let hub = AttachHub::new();
        let (_h, mut rx) = hub.subscribe("s1", Some("c1".to_string()));
        hub.on_session_closed("s1");
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.subscriber_count("s1"), 0);
    }
}
