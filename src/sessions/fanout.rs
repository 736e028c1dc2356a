//! Per-session fan-out of output frames to registered listeners.
//!
//! A [`Fanout`] owns three pieces of state, each behind its own lock:
//!
//! - the replay state (terminal byte history or chat conversation)
//! - the listener arena (`ListenerId` → callback)
//! - the viewer accounting used by the reaper
//!
//! Lock order is replay, then (outside this module) the multiplexer hub,
//! then listeners. The viewer lock is a leaf. [`Fanout::publish`] appends to
//! the replay state and invokes every listener while still holding the replay
//! lock, so a subscriber registered under [`Fanout::with_replay`] sees every
//! frame exactly once: either in its replay snapshot or live.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use super::buffer::HistoryBuffer;
use crate::protocol::Frame;

/// Callback invoked synchronously for each published frame.
pub type Listener = Arc<dyn Fn(&Frame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// What a late viewer is shown on attach.
#[derive(Debug)]
pub enum Replay {
    Terminal(HistoryBuffer),
    Chat {
        records: VecDeque<Value>,
        limit: usize,
    },
}

impl Replay {
    pub fn chat(limit: usize) -> Self {
        Self::Chat {
            records: VecDeque::new(),
            limit,
        }
    }

    /// Record terminal output. No-op for chat.
    pub fn push_output(&mut self, data: &[u8]) {
        if let Self::Terminal(history) = self {
            history.push(data);
        }
    }

    /// Record a conversation entry. No-op for terminals.
    pub fn push_record(&mut self, record: Value) {
        if let Self::Chat { records, limit } = self {
            records.push_back(record);
            while records.len() > *limit {
                records.pop_front();
            }
        }
    }

    pub fn terminal_text(&self) -> Option<String> {
        match self {
            Self::Terminal(history) => Some(String::from_utf8_lossy(&history.snapshot()).into_owned()),
            Self::Chat { .. } => None,
        }
    }

    pub fn chat_records(&self) -> Vec<Value> {
        match self {
            Self::Chat { records, .. } => records.iter().cloned().collect(),
            Self::Terminal(_) => Vec::new(),
        }
    }
}

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: BTreeMap<ListenerId, Listener>,
}

#[derive(Debug)]
struct ViewerState {
    count: usize,
    last_disconnect: Option<Instant>,
    closing: bool,
}

pub struct Fanout {
    replay: Mutex<Replay>,
    listeners: Mutex<ListenerSet>,
    viewers: Mutex<ViewerState>,
    created_at: Instant,
}

impl Fanout {
    pub fn new(replay: Replay) -> Self {
        Self {
            replay: Mutex::new(replay),
            listeners: Mutex::new(ListenerSet::default()),
            viewers: Mutex::new(ViewerState {
                count: 0,
                last_disconnect: None,
                closing: false,
            }),
            created_at: Instant::now(),
        }
    }

    /// Run `f` with the replay state locked. Frames cannot be published
    /// until `f` returns.
    pub fn with_replay<R>(&self, f: impl FnOnce(&Replay) -> R) -> R {
        let replay = self.replay.lock();
        f(&replay)
    }

    /// Update the replay state with `record`, then deliver `frame` to every
    /// listener, all under the replay lock.
    pub fn publish(&self, frame: &Frame, record: impl FnOnce(&mut Replay)) {
        self.publish_batch(std::slice::from_ref(frame), record);
    }

    /// Like [`Fanout::publish`] for several frames produced by one event.
    /// `frames` may be empty to update the replay state alone.
    pub fn publish_batch(&self, frames: &[Frame], record: impl FnOnce(&mut Replay)) {
        let mut replay = self.replay.lock();
        record(&mut replay);
        if frames.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self.listeners.lock().entries.values().cloned().collect();
        for frame in frames {
            for listener in &listeners {
                listener(frame);
            }
        }
    }

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let mut set = self.listeners.lock();
        let id = ListenerId(set.next_id);
        set.next_id += 1;
        set.entries.insert(id, listener);
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().entries.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Count a new viewer. Fails once the session has been marked closing.
    pub fn attach_viewer(&self) -> bool {
        let mut v = self.viewers.lock();
        if v.closing {
            return false;
        }
        v.count += 1;
        true
    }

    /// Release a viewer. Never goes below zero; stamps the disconnect time.
    pub fn detach_viewer(&self) {
        let mut v = self.viewers.lock();
        v.count = v.count.saturating_sub(1);
        v.last_disconnect = Some(Instant::now());
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().count
    }

    /// How long the session has had no viewers, or `None` while watched.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        let v = self.viewers.lock();
        if v.count > 0 {
            return None;
        }
        let since = v.last_disconnect.unwrap_or(self.created_at);
        Some(now.saturating_duration_since(since))
    }

    /// Mark closing if the session is still viewerless past `grace`. Checked
    /// and set under the same lock [`Fanout::attach_viewer`] uses.
    pub fn close_if_idle(&self, grace: Duration, now: Instant) -> bool {
        let mut v = self.viewers.lock();
        if v.closing {
            return true;
        }
        if v.count > 0 {
            return false;
        }
        let since = v.last_disconnect.unwrap_or(self.created_at);
        if now.saturating_duration_since(since) < grace {
            return false;
        }
        v.closing = true;
        true
    }

    pub fn mark_closing(&self) {
        self.viewers.lock().closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.viewers.lock().closing
    }
}
