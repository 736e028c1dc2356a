//! Backing processes: the thing a session owns and streams output from.
//!
//! - [`terminal::TerminalProcess`] — agent command in a login shell on a PTY
//! - [`chat::ChatProcess`] — agent in line-delimited JSON mode on pipes
//! - [`remote::RemoteShell`] — interactive shell on an SSH channel
//!
//! Each constructor returns the process handle plus an `mpsc::Receiver` that
//! yields output until the process goes away. [`Backend`] dispatches the
//! [`BackingProcess`] operations over the three kinds.

pub mod chat;
pub mod pty;
pub mod remote;
pub mod terminal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::error::ProcessError;

/// Operations every session kind supports.
#[allow(async_fn_in_trait)]
pub trait BackingProcess {
    /// Write raw input. Errors surface to the caller.
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError>;
    /// Change the window size. No-op if the size is unchanged.
    async fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError>;
    /// Ask politely, then escalate until the process is gone and reaped.
    async fn terminate(&self, lifecycle: &LifecycleConfig);
    fn is_alive(&self) -> bool;
}

pub enum Backend {
    Terminal(terminal::TerminalProcess),
    Chat(chat::ChatProcess),
    Remote(remote::RemoteShell),
}

impl BackingProcess for Backend {
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        match self {
            Self::Terminal(p) => p.write(data).await,
            Self::Chat(p) => p.write(data).await,
            Self::Remote(p) => p.write(data).await,
        }
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        match self {
            Self::Terminal(p) => p.resize(rows, cols).await,
            Self::Chat(p) => p.resize(rows, cols).await,
            Self::Remote(p) => p.resize(rows, cols).await,
        }
    }

    async fn terminate(&self, lifecycle: &LifecycleConfig) {
        match self {
            Self::Terminal(p) => p.terminate(lifecycle).await,
            Self::Chat(p) => p.terminate(lifecycle).await,
            Self::Remote(p) => p.terminate(lifecycle).await,
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Self::Terminal(p) => p.is_alive(),
            Self::Chat(p) => p.is_alive(),
            Self::Remote(p) => p.is_alive(),
        }
    }
}

impl Backend {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Terminal(p) => Some(p.pid()),
            Self::Chat(p) => Some(p.pid()),
            Self::Remote(_) => None,
        }
    }
}

/// Exit status of a local child, published once it has been reaped.
#[derive(Clone)]
pub struct ExitWatch(watch::Receiver<Option<Option<i32>>>);

impl ExitWatch {
    /// Move `child` into a task that waits on it. The child is reaped as soon
    /// as it exits, whether or not anyone is terminating it.
    pub fn spawn(mut child: Child, label: String) -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("{label}: wait failed: {e}");
                    None
                }
            };
            debug!("{label}: exited with {code:?}");
            let _ = tx.send(Some(code));
        });
        Self(rx)
    }

    pub fn has_exited(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub fn code(&self) -> Option<i32> {
        self.0.borrow().flatten()
    }

    /// Wait until the child has been reaped, up to `limit`.
    pub async fn wait(&self, limit: Duration) -> bool {
        let mut rx = self.0.clone();
        tokio::time::timeout(limit, rx.wait_for(Option::is_some))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

/// Detects a byte marker across chunk boundaries.
pub struct MarkerScanner {
    needle: Vec<u8>,
    carry: Vec<u8>,
    seen: Arc<AtomicBool>,
}

impl MarkerScanner {
    pub fn new(needle: &str, seen: Arc<AtomicBool>) -> Option<Self> {
        if needle.is_empty() {
            return None;
        }
        Some(Self {
            needle: needle.as_bytes().to_vec(),
            carry: Vec::new(),
            seen,
        })
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if self.seen.load(Ordering::Relaxed) {
            return;
        }
        self.carry.extend_from_slice(chunk);
        if self
            .carry
            .windows(self.needle.len())
            .any(|w| w == self.needle.as_slice())
        {
            self.seen.store(true, Ordering::Relaxed);
            self.carry.clear();
            return;
        }
        let keep = self.needle.len() - 1;
        if self.carry.len() > keep {
            self.carry.drain(..self.carry.len() - keep);
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const REAP_LIMIT: Duration = Duration::from_secs(5);

/// Escalating shutdown for a local process group, after the polite request
/// has already been sent.
///
/// 1. Poll every 100 ms for up to `polite_timeout` for exit or the
///    voluntary-shutdown marker.
/// 2. SIGTERM the process group and wait up to `term_timeout`.
/// 3. SIGKILL the process group.
///
/// Always waits for the exit watcher to reap the child before returning.
pub async fn terminate_gracefully(
    label: &str,
    pgid: u32,
    exit: &ExitWatch,
    marker_seen: Option<&AtomicBool>,
    lifecycle: &LifecycleConfig,
) {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = Pid::from_raw(pgid as i32);

    let deadline = tokio::time::Instant::now() + lifecycle.polite_timeout();
    while tokio::time::Instant::now() < deadline {
        if exit.has_exited() {
            break;
        }
        if marker_seen.is_some_and(|m| m.load(Ordering::Relaxed)) {
            debug!("{label}: shutdown marker seen");
            exit.wait(lifecycle.term_timeout()).await;
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let escalated = !exit.has_exited();
    if escalated {
        info!("{label}: did not exit politely, sending SIGTERM");
        let _ = killpg(pgid, Signal::SIGTERM);
        let deadline = tokio::time::Instant::now() + lifecycle.term_timeout();
        while !exit.has_exited() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    if !exit.has_exited() {
        warn!("{label}: still running after SIGTERM, sending SIGKILL");
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if !exit.wait(REAP_LIMIT).await {
        warn!("{label}: not reaped after SIGKILL");
    }

    // Stragglers the leader left behind. Only after an escalation, and only
    // while the group still exists.
    if escalated && killpg(pgid, None).is_ok() {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}
