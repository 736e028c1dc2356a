//! Subscription bookkeeping between connections and sessions.
//!
//! All state lives in one [`HubState`] behind a single `parking_lot::Mutex`:
//! the per-connection subscription sets and the reverse index from session to
//! subscribed connections. Every mutation touches both under that lock, so
//! they cannot drift apart under concurrent subscribe/unsubscribe/disconnect.
//!
//! Each (connection, session) pair has its own bounded queue drained by one
//! consumer task into the connection's outbound channel. That keeps frames of
//! one session in order at one connection while sessions proceed independently.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::protocol::{Frame, FrameType};
use crate::sessions::fanout::{Fanout, ListenerId};
use crate::sessions::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Subscription {
    queue: mpsc::Sender<Frame>,
    consumer: JoinHandle<()>,
}

struct ConnEntry {
    outbound: mpsc::Sender<Frame>,
    subs: HashMap<String, Subscription>,
}

struct SessionEntry {
    fanout: Arc<Fanout>,
    listener: ListenerId,
    conns: HashSet<ConnId>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnId, ConnEntry>,
    sessions: HashMap<String, SessionEntry>,
}

#[derive(Clone)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
    next_conn: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            next_conn: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a connection whose frames go to `outbound`.
    pub fn register(&self, outbound: mpsc::Sender<Frame>) -> ConnId {
        let id = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        self.state.lock().connections.insert(
            id,
            ConnEntry {
                outbound,
                subs: HashMap::new(),
            },
        );
        id
    }

    /// Subscribe `conn` to `session`. The `connected` frame carrying the
    /// replay snapshot is queued before any live frame.
    ///
    /// Subscribing again to the same session only re-sends `connected` with
    /// the current snapshot. Fails with [`SessionError::Closing`] if the
    /// session is being torn down.
    pub fn subscribe(&self, conn: ConnId, session: &Arc<Session>) -> Result<(), SessionError> {
        let fanout = Arc::clone(session.fanout());
        let channel = session.kind.channel();

        // Snapshot and registration happen under the replay lock, so no frame
        // can be published between them.
        fanout.with_replay(|replay| {
            let connected = Frame::new(
                channel,
                FrameType::Connected,
                Some(session.id.as_str()),
                session.connected_payload(replay),
            );

            let mut guard = self.state.lock();
            let HubState {
                connections,
                sessions,
            } = &mut *guard;
            let Some(entry) = connections.get_mut(&conn) else {
                return Ok(());
            };

            if let Some(existing) = entry.subs.get(&session.id) {
                if existing.queue.try_send(connected).is_err() {
                    warn!("{conn}: queue for {} full, dropping connected frame", session.id);
                }
                return Ok(());
            }

            if !fanout.attach_viewer() {
                return Err(SessionError::Closing(session.id.clone()));
            }

            let (queue, rx) = mpsc::channel(self.queue_capacity);
            // Fresh queue: never full.
            let _ = queue.try_send(connected);
            let consumer = tokio::spawn(consume(rx, entry.outbound.clone()));
            entry
                .subs
                .insert(session.id.clone(), Subscription { queue, consumer });

            let index = sessions.entry(session.id.clone()).or_insert_with(|| {
                let hub = Arc::downgrade(&self.state);
                let sid = session.id.clone();
                let listener = fanout.add_listener(Arc::new(move |frame: &Frame| {
                    deliver(&hub, &sid, frame);
                }));
                debug!("listener registered for {}", session.id);
                SessionEntry {
                    fanout: Arc::clone(&fanout),
                    listener,
                    conns: HashSet::new(),
                }
            });
            index.conns.insert(conn);
            debug!("{conn} subscribed to {} ({})", session.id, channel.as_str());
            Ok(())
        })
    }

    /// Drop one subscription. Idempotent. Returns whether one existed.
    pub fn unsubscribe(&self, conn: ConnId, session_id: &str) -> bool {
        let mut guard = self.state.lock();
        let HubState {
            connections,
            sessions,
        } = &mut *guard;
        let Some(sub) = connections
            .get_mut(&conn)
            .and_then(|c| c.subs.remove(session_id))
        else {
            return false;
        };
        // Dropping the queue sender lets the consumer drain and exit.
        drop(sub.queue);
        drop_reverse(sessions, conn, session_id);
        debug!("{conn} unsubscribed from {session_id}");
        true
    }

    /// Tear down every subscription of `conn` and forget it. Returns how many
    /// subscriptions were removed.
    pub fn disconnect(&self, conn: ConnId) -> usize {
        let mut guard = self.state.lock();
        let HubState {
            connections,
            sessions,
        } = &mut *guard;
        let Some(entry) = connections.remove(&conn) else {
            return 0;
        };
        let count = entry.subs.len();
        for (session_id, sub) in entry.subs {
            sub.consumer.abort();
            drop_reverse(sessions, conn, &session_id);
        }
        debug!("{conn} disconnected ({count} subscription(s))");
        count
    }

    /// Sessions `conn` is subscribed to, sorted.
    pub fn subscriptions(&self, conn: ConnId) -> Vec<String> {
        let guard = self.state.lock();
        let mut ids: Vec<String> = guard
            .connections
            .get(&conn)
            .map(|c| c.subs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.conns.len())
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

/// Remove `conn` from the session's reverse index and release its viewer.
/// The last subscriber also removes the output listener.
fn drop_reverse(sessions: &mut HashMap<String, SessionEntry>, conn: ConnId, session_id: &str) {
    let Some(index) = sessions.get_mut(session_id) else {
        return;
    };
    if index.conns.remove(&conn) {
        index.fanout.detach_viewer();
    }
    if index.conns.is_empty() {
        index.fanout.remove_listener(index.listener);
        sessions.remove(session_id);
        debug!("listener removed for {session_id}");
    }
}

/// Output listener body. Runs under the session's replay lock.
fn deliver(hub: &Weak<Mutex<HubState>>, session_id: &str, frame: &Frame) {
    let Some(state) = hub.upgrade() else {
        return;
    };
    let mut guard = state.lock();
    let HubState {
        connections,
        sessions,
    } = &mut *guard;
    let Some(index) = sessions.get(session_id) else {
        return;
    };

    for conn in &index.conns {
        let Some(sub) = connections.get(conn).and_then(|c| c.subs.get(session_id)) else {
            continue;
        };
        match sub.queue.try_send(frame.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "{conn}: queue for {session_id} full, dropping {} frame",
                    frame.kind.as_str()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    if frame.kind == FrameType::Closed {
        let conns: Vec<ConnId> = index.conns.iter().copied().collect();
        for conn in conns {
            if let Some(entry) = connections.get_mut(&conn) {
                entry.subs.remove(session_id);
            }
            drop_reverse(sessions, conn, session_id);
        }
    }
}

async fn consume(mut rx: mpsc::Receiver<Frame>, outbound: mpsc::Sender<Frame>) {
    while let Some(frame) = rx.recv().await {
        if outbound.send(frame).await.is_err() {
            break;
        }
    }
}
