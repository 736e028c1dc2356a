//! Session registry: create, look up, drive and reclaim sessions.
//!
//! ## Concurrency
//!
//! - The id → session map is a `parking_lot::RwLock`, held only for lookups
//!   and inserts, never across an await.
//! - Each id has an async slot lock. Creation, explicit close and reaping of
//!   an id all run under it, so at most one live process exists per id and a
//!   reap decision is re-checked against the current state before acting.
//! - Viewer attach and the reaper's idle check meet on the fan-out's viewer
//!   lock: once the reaper marks a session closing, attach fails and the
//!   caller opens a fresh session instead.
//!
//! ## Lifecycle
//!
//! Sessions survive their viewers. [`SessionRegistry::reap`] closes a session
//! once its process has died, or once it has had no viewers for longer than
//! its kind's grace period.

pub mod buffer;
pub mod coalesce;
pub mod fanout;
pub mod session;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::chat::log::{self, ChatLog};
use crate::config::Config;
use crate::error::SessionError;
use crate::process::chat::{ChatProcess, ChatSpawn};
use crate::process::remote::{RemoteShell, RemoteSpawn};
use crate::process::terminal::{TerminalProcess, TerminalSpawn};
use crate::process::Backend;
use crate::store::{MetadataStore, SessionRecord};
use crate::util::{expand_tilde, is_safe_id};

pub use session::{PumpSettings, Session, SessionContext, SessionKind};

/// What a client asked for when connecting.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Existing or desired id. `None` mints a new one.
    pub id: Option<String>,
    pub kind: SessionKind,
    pub cwd: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub host_id: Option<String>,
}

pub struct Opened {
    pub session: Arc<Session>,
    pub created: bool,
}

/// Why the reaper closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    Exited,
    Idle,
}

impl ReapReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exited => "exited",
            Self::Idle => "idle",
        }
    }
}

/// Summary returned by `GET /api/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub kind: SessionKind,
    pub context: SessionContext,
    pub alive: bool,
    pub viewers: usize,
    pub idle_secs: Option<u64>,
    pub pid: Option<u32>,
    pub created_at_ms: u64,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    config: Arc<Config>,
    store: Arc<dyn MetadataStore>,
    chat_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>, store: Arc<dyn MetadataStore>) -> Self {
        let chat_dir = log::chat_dir(&config.data_dir());
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
                config,
                store,
                chat_dir,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Look up a live session. Never creates one.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.inner.slots.lock();
        Arc::clone(slots.entry(id.to_string()).or_default())
    }

    /// Drop the slot lock entry if nobody else holds a handle to it.
    fn release_slot(&self, id: &str, slot: Arc<tokio::sync::Mutex<()>>) {
        let mut slots = self.inner.slots.lock();
        // One reference in the map, one in `slot`.
        if Arc::strong_count(&slot) == 2 && !self.inner.sessions.read().contains_key(id) {
            slots.remove(id);
        }
    }

    /// Return the live session for the request's id, or create it.
    ///
    /// A dead session under the id is reclaimed first. Creation fails
    /// atomically: nothing is registered if the process fails to start.
    pub async fn open(&self, req: OpenRequest) -> Result<Opened, SessionError> {
        let id = req.id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !is_safe_id(&id) {
            return Err(SessionError::InvalidContext(format!("invalid session id {id:?}")));
        }

        let slot = self.slot(&id);
        let result = {
            let _guard = slot.lock().await;
            self.open_locked(id.clone(), &req).await
        };
        self.release_slot(&id, slot);
        result
    }

    async fn open_locked(&self, id: String, req: &OpenRequest) -> Result<Opened, SessionError> {
        if let Some(existing) = self.get(&id) {
            if existing.kind != req.kind {
                return Err(SessionError::WrongKind {
                    id,
                    expected: req.kind.as_str(),
                    actual: existing.kind.as_str(),
                });
            }
            if existing.is_alive() && !existing.fanout().is_closing() {
                return Ok(Opened {
                    session: existing,
                    created: false,
                });
            }
            info!("Reclaiming dead session {id} before reopening");
            self.destroy_locked(&existing).await;
        }

        let max = self.inner.config.server.max_sessions;
        if self.len() >= max {
            return Err(SessionError::LimitReached(max));
        }

        let session = match req.kind {
            SessionKind::Terminal => self.spawn_terminal(id.clone(), req)?,
            SessionKind::Chat => self.spawn_chat(id.clone(), req).await?,
            SessionKind::Remote => self.spawn_remote(id.clone(), req).await?,
        };

        self.inner
            .sessions
            .write()
            .insert(id.clone(), Arc::clone(&session));
        info!(
            "Session {id} created ({}, pid {:?})",
            session.kind.as_str(),
            session.pid()
        );

        let record = SessionRecord {
            id: id.clone(),
            kind: session.kind.as_str().to_string(),
            cwd: match &session.context {
                SessionContext::Terminal { cwd, .. } | SessionContext::Chat { cwd, .. } => {
                    Some(cwd.clone())
                }
                SessionContext::Remote { .. } => None,
            },
            host_id: req.host_id.clone(),
            created_at_ms: session.created_at_ms,
        };
        if let Err(e) = self.inner.store.save_session(&record).await {
            warn!("Failed to persist metadata for {id}: {e}");
        }

        Ok(Opened {
            session,
            created: true,
        })
    }

    fn pump_settings(&self) -> PumpSettings {
        let output = &self.inner.config.output;
        PumpSettings {
            flush_interval: output.flush_interval(),
            flush_threshold: output.flush_threshold_bytes,
        }
    }

    fn spawn_terminal(&self, id: String, req: &OpenRequest) -> Result<Arc<Session>, SessionError> {
        let cfg = &self.inner.config.terminal;
        let cwd = resolve_terminal_cwd(req.cwd.as_deref(), &cfg.working_dir);
        let rows = req.rows.unwrap_or(cfg.rows);
        let cols = req.cols.unwrap_or(cfg.cols);
        let (process, output) = TerminalProcess::spawn(&TerminalSpawn {
            label: format!("terminal {id}"),
            shell: &cfg.shell,
            command: &cfg.command,
            cwd: &cwd,
            rows,
            cols,
            exit_input: &cfg.exit_input,
            shutdown_marker: &cfg.shutdown_marker,
        })?;
        Ok(Session::with_byte_stream(
            id,
            SessionKind::Terminal,
            SessionContext::Terminal { cwd, rows, cols },
            Backend::Terminal(process),
            output,
            cfg.history_bytes,
            self.pump_settings(),
        ))
    }

    async fn spawn_chat(&self, id: String, req: &OpenRequest) -> Result<Arc<Session>, SessionError> {
        let cfg = &self.inner.config.chat;
        let requested = match &req.cwd {
            Some(cwd) => Some(cwd.clone()),
            None => self
                .inner
                .store
                .get_session(&id)
                .await
                .ok()
                .flatten()
                .and_then(|r| r.cwd),
        };
        let cwd = resolve_chat_cwd(requested.as_deref(), &self.inner.config.terminal.working_dir)?;

        let resumed = log::has_conversation(&self.inner.chat_dir, &id).await;
        let mut args = cfg.args.clone();
        if resumed {
            args.push(cfg.resume_flag.clone());
        } else {
            args.push(cfg.new_session_flag.clone());
        }
        args.push(id.clone());

        let (process, records) = ChatProcess::spawn(&ChatSpawn {
            label: format!("chat {id}"),
            program: &cfg.command,
            args,
            cwd: &cwd,
            max_line_bytes: cfg.max_line_bytes,
            queue_capacity: cfg.queue_capacity,
        })?;

        let history = if resumed {
            log::load_conversation(&self.inner.chat_dir, &id, cfg.history_limit).await
        } else {
            Vec::new()
        };
        let chat_log = match ChatLog::open(&self.inner.chat_dir, &id).await {
            Ok(l) => Some(l),
            Err(e) => {
                warn!("Chat log for {id} unavailable: {e}");
                None
            }
        };

        Ok(Session::with_chat_stream(
            id,
            SessionContext::Chat { cwd, resumed },
            Backend::Chat(process),
            records,
            history,
            cfg.history_limit,
            chat_log,
            Duration::from_secs(cfg.turn_timeout_secs),
        ))
    }

    async fn spawn_remote(&self, id: String, req: &OpenRequest) -> Result<Arc<Session>, SessionError> {
        let host_id = req
            .host_id
            .clone()
            .ok_or_else(|| SessionError::InvalidContext("remote session needs a host_id".into()))?;
        let host = self
            .inner
            .store
            .get_remote_host(&host_id)
            .await?
            .ok_or_else(|| SessionError::UnknownHost(host_id.clone()))?;
        let cfg = &self.inner.config;
        let rows = req.rows.unwrap_or(cfg.terminal.rows);
        let cols = req.cols.unwrap_or(cfg.terminal.cols);
        let (shell, output) = RemoteShell::connect(
            &host,
            &RemoteSpawn {
                label: format!("remote {id}"),
                rows,
                cols,
                term: &cfg.remote.term,
                connect_timeout: Duration::from_secs(cfg.remote.connect_timeout_secs),
            },
        )
        .await?;
        Ok(Session::with_byte_stream(
            id,
            SessionKind::Remote,
            SessionContext::Remote { host_id, rows, cols },
            Backend::Remote(shell),
            output,
            cfg.terminal.history_bytes,
            self.pump_settings(),
        ))
    }

    /// Write raw input. No-op if the session does not exist.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), SessionError> {
        match self.get(id) {
            Some(session) => Ok(session.write(data).await?),
            None => Ok(()),
        }
    }

    /// Resize the session's terminal. No-op if the session does not exist.
    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), SessionError> {
        match self.get(id) {
            Some(session) => Ok(session.resize(rows, cols).await?),
            None => Ok(()),
        }
    }

    /// Submit a user message to a chat session.
    pub async fn send_chat(&self, id: &str, text: &str) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.send_chat(text).await
    }

    /// Terminate the session and forget it, including its stored metadata.
    /// Returns once the slot is free. `false` if there was no such session.
    pub async fn close(&self, id: &str) -> Result<bool, SessionError> {
        let slot = self.slot(id);
        let closed = {
            let _guard = slot.lock().await;
            match self.get(id) {
                Some(session) => {
                    info!("Closing session {id}");
                    self.destroy_locked(&session).await;
                    true
                }
                None => false,
            }
        };
        self.release_slot(id, slot);
        self.inner.store.delete_session(id).await?;
        Ok(closed)
    }

    /// Caller holds the slot lock for `session.id`.
    ///
    /// The entry leaves the map before the process is signalled, so by the
    /// time the pump publishes `closed` the id no longer resolves.
    async fn destroy_locked(&self, session: &Arc<Session>) {
        {
            let mut sessions = self.inner.sessions.write();
            if sessions
                .get(&session.id)
                .is_some_and(|cur| Arc::ptr_eq(cur, session))
            {
                sessions.remove(&session.id);
            }
        }
        session.shutdown(&self.inner.config.lifecycle).await;
    }

    fn grace(&self, kind: SessionKind) -> Duration {
        let cfg = &self.inner.config;
        Duration::from_secs(match kind {
            SessionKind::Terminal => cfg.terminal.idle_grace_secs,
            SessionKind::Chat => cfg.chat.idle_grace_secs,
            SessionKind::Remote => cfg.remote.idle_grace_secs,
        })
    }

    /// Close dead sessions and sessions idle past their grace period.
    /// Stored metadata is kept so chat sessions can be resumed.
    pub async fn reap(&self) -> Vec<(String, ReapReason)> {
        let now = Instant::now();
        let candidates: Vec<Arc<Session>> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|s| {
                !s.is_alive()
                    || s
                        .fanout()
                        .idle_for(now)
                        .is_some_and(|idle| idle >= self.grace(s.kind))
            })
            .cloned()
            .collect();

        let results = join_all(candidates.into_iter().map(|s| self.reap_one(s))).await;
        results.into_iter().flatten().collect()
    }

    async fn reap_one(&self, candidate: Arc<Session>) -> Option<(String, ReapReason)> {
        let id = candidate.id.clone();
        let slot = self.slot(&id);
        let outcome = {
            let _guard = slot.lock().await;
            let current = self.get(&id).filter(|cur| Arc::ptr_eq(cur, &candidate));
            match current {
                None => None,
                Some(session) => {
                    let reason = if !session.is_alive() {
                        Some(ReapReason::Exited)
                    } else if session
                        .fanout()
                        .close_if_idle(self.grace(session.kind), Instant::now())
                    {
                        Some(ReapReason::Idle)
                    } else {
                        None
                    };
                    if let Some(reason) = reason {
                        info!("Reaping session {id} ({})", reason.as_str());
                        self.destroy_locked(&session).await;
                    }
                    reason
                }
            }
        };
        self.release_slot(&id, slot);
        outcome.map(|reason| (id, reason))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let now = Instant::now();
        let mut out: Vec<SessionSummary> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                kind: s.kind,
                context: s.context.clone(),
                alive: s.is_alive(),
                viewers: s.fanout().viewer_count(),
                idle_secs: s.fanout().idle_for(now).map(|d| d.as_secs()),
                pid: s.pid(),
                created_at_ms: s.created_at_ms,
            })
            .collect();
        out.sort_by_key(|s| s.created_at_ms);
        out
    }

    /// Terminate every session concurrently. Metadata is kept.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        if all.is_empty() {
            return;
        }
        info!("Terminating {} session(s)", all.len());
        join_all(all.into_iter().map(|s| async move {
            let slot = self.slot(&s.id);
            {
                let _guard = slot.lock().await;
                self.destroy_locked(&s).await;
            }
            self.release_slot(&s.id, slot);
        }))
        .await;
    }
}

fn is_dir(path: &str) -> bool {
    Path::new(path).is_dir()
}

/// Requested cwd if it is a directory, else the configured default, else
/// `$HOME`, else `/`.
fn resolve_terminal_cwd(requested: Option<&str>, default: &str) -> String {
    requested
        .map(|p| expand_tilde(p).into_owned())
        .filter(|p| is_dir(p))
        .or_else(|| Some(expand_tilde(default).into_owned()).filter(|p| is_dir(p)))
        .or_else(|| std::env::var("HOME").ok().filter(|p| is_dir(p)))
        .unwrap_or_else(|| "/".to_string())
}

/// Chat sessions refuse to start somewhere other than where they were asked.
fn resolve_chat_cwd(requested: Option<&str>, default: &str) -> Result<String, SessionError> {
    match requested {
        Some(p) => {
            let path = expand_tilde(p).into_owned();
            if is_dir(&path) {
                Ok(path)
            } else {
                Err(SessionError::InvalidContext(format!(
                    "working directory {p} does not exist"
                )))
            }
        }
        None => Ok(resolve_terminal_cwd(None, default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::store::MemoryStore;

    fn test_config(data_dir: &Path) -> Config {
        let mut config = Config::default();
        config.server.data_dir = data_dir.display().to_string();
        config.terminal.shell = "/bin/sh".into();
        config.terminal.command = String::new();
        config.terminal.exit_input = "exit\n".into();
        config.lifecycle.polite_timeout_ms = 300;
        config.lifecycle.term_timeout_ms = 300;
        config.output.flush_interval_ms = 5;
        config
    }

    fn registry(config: Config) -> (SessionRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (SessionRegistry::new(Arc::new(config), store.clone()), store)
    }

    fn terminal(id: &str) -> OpenRequest {
        OpenRequest {
            id: Some(id.to_string()),
            kind: SessionKind::Terminal,
            cwd: None,
            rows: None,
            cols: None,
            host_id: None,
        }
    }

    async fn wait_for_history(session: &Session, needle: &str) -> String {
        for _ in 0..200 {
            let text = session
                .fanout()
                .with_replay(|r| r.terminal_text())
                .unwrap_or_default();
            if text.contains(needle) {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("history never contained {needle:?}");
    }

    #[tokio::test]
    async fn test_open_reuses_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, store) = registry(test_config(dir.path()));
        let first = reg.open(terminal("t1")).await.unwrap();
        assert!(first.created);
        first.session.write(b"echo marker-$((6 * 7))\n").await.unwrap();
        wait_for_history(&first.session, "marker-42").await;

        let second = reg.open(terminal("t1")).await.unwrap();
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.session, &second.session));
        assert_eq!(first.session.pid(), second.session.pid());
        assert!(store.get_session("t1").await.unwrap().is_some());

        assert!(reg.close("t1").await.unwrap());
        assert!(reg.get("t1").is_none());
        assert!(store.get_session("t1").await.unwrap().is_none());
        assert!(!reg.close("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_and_resize_absent_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _) = registry(test_config(dir.path()));
        reg.write("nope", b"ls\n").await.unwrap();
        reg.resize("nope", 10, 10).await.unwrap();
        assert!(matches!(
            reg.send_chat("nope", "hi").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_limit_and_invalid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.server.max_sessions = 1;
        let (reg, _) = registry(config);
        reg.open(terminal("a")).await.unwrap();
        assert!(matches!(
            reg.open(terminal("b")).await,
            Err(SessionError::LimitReached(1))
        ));
        assert!(matches!(
            reg.open(terminal("../etc")).await,
            Err(SessionError::InvalidContext(_))
        ));
        reg.shutdown().await;
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_chat_rejects_missing_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _) = registry(test_config(dir.path()));
        let req = OpenRequest {
            id: Some("c1".into()),
            kind: SessionKind::Chat,
            cwd: Some("/definitely/not/here".into()),
            rows: None,
            cols: None,
            host_id: None,
        };
        assert!(matches!(
            reg.open(req).await,
            Err(SessionError::InvalidContext(_))
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_remote_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _) = registry(test_config(dir.path()));
        let req = OpenRequest {
            id: None,
            kind: SessionKind::Remote,
            cwd: None,
            rows: None,
            cols: None,
            host_id: Some("ghost".into()),
        };
        assert!(matches!(
            reg.open(req).await,
            Err(SessionError::UnknownHost(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_connect_failure_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.remote.connect_timeout_secs = 2;
        let (reg, store) = registry(config);
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        store.insert_host(crate::store::RemoteHost {
            id: "refused".into(),
            address: "127.0.0.1".into(),
            port,
            username: "agent".into(),
            password: Some("pw".into()),
            private_key: None,
            key_passphrase: None,
            fingerprint: None,
        });
        let req = OpenRequest {
            id: Some("r1".into()),
            kind: SessionKind::Remote,
            cwd: None,
            rows: Some(30),
            cols: Some(100),
            host_id: Some("refused".into()),
        };
        assert!(matches!(
            reg.open(req).await,
            Err(SessionError::Process(crate::error::ProcessError::Ssh(_)))
        ));
        assert!(reg.is_empty());
        assert!(store.get_session("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_invalid_cwd_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.terminal.working_dir = dir.path().display().to_string();
        let (reg, _) = registry(config);
        let mut req = terminal("t2");
        req.cwd = Some("/definitely/not/here".into());
        let opened = reg.open(req).await.unwrap();
        match &opened.session.context {
            SessionContext::Terminal { cwd, .. } => assert_eq!(cwd, &dir.path().display().to_string()),
            other => panic!("unexpected context {other:?}"),
        }
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn test_reap_keeps_recent_and_closes_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.terminal.idle_grace_secs = 3600;
        let (reg, store) = registry(config);
        let opened = reg.open(terminal("idle")).await.unwrap();
        opened.session.fanout().attach_viewer();
        opened.session.fanout().detach_viewer();
        assert!(reg.reap().await.is_empty());
        assert!(reg.get("idle").is_some());

        let mut config = test_config(dir.path());
        config.terminal.idle_grace_secs = 0;
        let (reg0, _) = registry(config);
        reg0.open(terminal("gone")).await.unwrap();
        let reaped = reg0.reap().await;
        assert_eq!(reaped, vec![("gone".to_string(), ReapReason::Idle)]);
        assert!(reg0.get("gone").is_none());

        reg.shutdown().await;
        assert!(store.get_session("idle").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reap_skips_watched_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.terminal.idle_grace_secs = 0;
        let (reg, _) = registry(config);
        let opened = reg.open(terminal("watched")).await.unwrap();
        assert!(opened.session.fanout().attach_viewer());
        assert!(reg.reap().await.is_empty());
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_session_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.terminal.command = "exit 0".into();
        let (reg, _) = registry(config);
        let first = reg.open(terminal("short")).await.unwrap().session;
        for _ in 0..200 {
            if !first.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!first.is_alive());
        let reaped = reg.reap().await;
        assert_eq!(reaped, vec![("short".to_string(), ReapReason::Exited)]);
        assert!(reg.get("short").is_none());
    }

    #[tokio::test]
    async fn test_close_escalates_past_ignored_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.terminal.command = "trap '' TERM HUP INT; while :; do sleep 0.05; done".into();
        let (reg, _) = registry(config);
        let session = reg.open(terminal("stubborn")).await.unwrap().session;
        let closed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&closed);
        session.fanout().add_listener(Arc::new(move |f: &Frame| {
            if f.kind == crate::protocol::FrameType::Closed {
                sink.lock().push(f.clone());
            }
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        assert!(reg.close("stubborn").await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(8));
        assert!(!session.is_alive());
        assert!(reg.get("stubborn").is_none());
        assert_eq!(closed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_frame_follows_removal() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _) = registry(test_config(dir.path()));
        let session = reg.open(terminal("gone-first")).await.unwrap().session;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (sink, probe) = (Arc::clone(&seen), reg.clone());
        session.fanout().add_listener(Arc::new(move |f: &Frame| {
            if f.kind == crate::protocol::FrameType::Closed {
                sink.lock().push(probe.get("gone-first").is_some());
            }
        }));
        assert!(reg.close("gone-first").await.unwrap());
        assert_eq!(*seen.lock(), vec![false]);
    }

    #[tokio::test]
    async fn test_close_not_blocked_by_stalled_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.terminal.command = "sleep 600".into();
        let (reg, _) = registry(config);
        let session = reg.open(terminal("full")).await.unwrap().session;
        let writer = tokio::spawn(async move {
            let flood = "a\n".repeat(32 * 1024);
            let _ = session.write(flood.as_bytes()).await;
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!writer.is_finished());

        let started = Instant::now();
        let closed = tokio::time::timeout(Duration::from_secs(5), reg.close("full")).await;
        assert!(matches!(closed, Ok(Ok(true))), "close hung for {:?}", started.elapsed());
        assert!(reg.get("full").is_none());
        writer.abort();
    }
}
