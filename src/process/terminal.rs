//! Agent command running in a login shell on a PTY.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::pty::{allocate_pty, read_fd, resize_pty, spawn_on_pty, write_fd, PtyPair};
use super::{terminate_gracefully, BackingProcess, ExitWatch, MarkerScanner};
use crate::config::LifecycleConfig;
use crate::error::ProcessError;

const READ_CHUNK: usize = 8192;
const OUTPUT_QUEUE: usize = 64;

/// Everything needed to start a terminal process.
pub struct TerminalSpawn<'a> {
    pub label: String,
    pub shell: &'a str,
    /// Run via `shell -l -c`. Empty starts an interactive login shell.
    pub command: &'a str,
    pub cwd: &'a str,
    pub rows: u16,
    pub cols: u16,
    pub exit_input: &'a str,
    pub shutdown_marker: &'a str,
}

pub struct TerminalProcess {
    label: String,
    pid: u32,
    master: Arc<AsyncFd<OwnedFd>>,
    size: parking_lot::Mutex<(u16, u16)>,
    write_lock: tokio::sync::Mutex<()>,
    exit: ExitWatch,
    alive: Arc<AtomicBool>,
    marker_seen: Arc<AtomicBool>,
    exit_input: Vec<u8>,
    reader: JoinHandle<()>,
}

impl TerminalProcess {
    /// Allocate a PTY and start the shell on it. Output is read until the
    /// slave side closes.
    pub fn spawn(opts: &TerminalSpawn<'_>) -> Result<(Self, mpsc::Receiver<Bytes>), ProcessError> {
        let pty = allocate_pty(opts.rows, opts.cols)?;
        let mut args = vec!["-l".to_string()];
        if !opts.command.is_empty() {
            args.push("-c".to_string());
            args.push(opts.command.to_string());
        }
        let child = spawn_on_pty(
            &pty,
            opts.shell,
            &args,
            opts.cwd,
            &[("TERM", "xterm-256color")],
        )
        .map_err(|source| ProcessError::Spawn {
            program: opts.shell.to_string(),
            source,
        })?;
        let pid = child.id().ok_or(ProcessError::Dead)?;

        let PtyPair { master, slave } = pty;
        // The child holds its own copy; ours would keep EOF from ever arriving.
        drop(slave);

        let master = Arc::new(AsyncFd::new(master)?);
        let alive = Arc::new(AtomicBool::new(true));
        let marker_seen = Arc::new(AtomicBool::new(false));
        let exit = ExitWatch::spawn(child, opts.label.clone());

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        let reader = tokio::spawn(read_loop(
            opts.label.clone(),
            Arc::clone(&master),
            tx,
            Arc::clone(&alive),
            MarkerScanner::new(opts.shutdown_marker, Arc::clone(&marker_seen)),
        ));

        debug!("{}: spawned pid {pid} in {}", opts.label, opts.cwd);

        Ok((
            Self {
                label: opts.label.clone(),
                pid,
                master,
                size: parking_lot::Mutex::new((opts.rows, opts.cols)),
                write_lock: tokio::sync::Mutex::new(()),
                exit,
                alive,
                marker_seen,
                exit_input: opts.exit_input.as_bytes().to_vec(),
                reader,
            },
            rx,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

async fn read_loop(
    label: String,
    master: Arc<AsyncFd<OwnedFd>>,
    tx: mpsc::Sender<Bytes>,
    alive: Arc<AtomicBool>,
    mut marker: Option<MarkerScanner>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("{label}: pty poll failed: {e}");
                break;
            }
        };
        match guard.try_io(|inner| read_fd(inner.get_ref(), &mut buf)) {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if let Some(scanner) = marker.as_mut() {
                    scanner.feed(&buf[..n]);
                }
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            // EIO: every slave fd is closed.
            Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => break,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => {
                warn!("{label}: pty read failed: {e}");
                break;
            }
            Err(_would_block) => {}
        }
    }
    alive.store(false, Ordering::Relaxed);
    debug!("{label}: pty reader finished");
}

impl BackingProcess for TerminalProcess {
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Err(ProcessError::Dead);
        }
        let _serial = self.write_lock.lock().await;
        let mut written = 0;
        while written < data.len() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| write_fd(inner.get_ref(), &data[written..])) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => {
                    if e.raw_os_error() == Some(libc::EIO) {
                        self.alive.store(false, Ordering::Relaxed);
                        return Err(ProcessError::Dead);
                    }
                    return Err(e.into());
                }
                Err(_would_block) => {}
            }
        }
        Ok(())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        let mut size = self.size.lock();
        if *size == (rows, cols) {
            return Ok(());
        }
        resize_pty(self.master.get_ref(), rows, cols)?;
        *size = (rows, cols);
        Ok(())
    }

    async fn terminate(&self, lifecycle: &LifecycleConfig) {
        // A process that stopped reading its input must not hold up escalation.
        if !self.exit.has_exited() && !self.exit_input.is_empty() {
            let polite = self.write(&self.exit_input);
            match tokio::time::timeout(lifecycle.polite_timeout(), polite).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{}: exit input not delivered: {e}", self.label),
                Err(_) => debug!("{}: exit input blocked, escalating", self.label),
            }
        }
        terminate_gracefully(
            &self.label,
            self.pid,
            &self.exit,
            Some(&self.marker_seen),
            lifecycle,
        )
        .await;
        self.alive.store(false, Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed) && !self.exit.has_exited()
    }
}

impl Drop for TerminalProcess {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn_sh(command: &str) -> (TerminalProcess, mpsc::Receiver<Bytes>) {
        TerminalProcess::spawn(&TerminalSpawn {
            label: "test".into(),
            shell: "/bin/sh",
            command,
            cwd: "/",
            rows: 24,
            cols: 80,
            exit_input: "exit\n",
            shutdown_marker: "",
        })
        .unwrap()
    }

    async fn collect_until(rx: &mut mpsc::Receiver<Bytes>, needle: &str) -> String {
        let mut out = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !out.contains(needle) {
            let chunk = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for output")
                .expect("pty closed early");
            out.push_str(&String::from_utf8_lossy(&chunk));
        }
        out
    }

    #[tokio::test]
    async fn test_echo_through_pty() {
        let (proc, mut rx) = spawn_sh("");
        proc.write(b"echo pty-$((40 + 2))\n").await.unwrap();
        let out = collect_until(&mut rx, "pty-42").await;
        assert!(out.contains("pty-42"));
        proc.terminate(&LifecycleConfig::default()).await;
        assert!(!proc.is_alive());
    }

    #[tokio::test]
    async fn test_command_exit_closes_stream() {
        let (proc, mut rx) = spawn_sh("printf done");
        collect_until(&mut rx, "done").await;
        let end = tokio::time::timeout(Duration::from_secs(10), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(end.is_ok());
        assert!(proc.exit.wait(Duration::from_secs(5)).await);
        assert!(!proc.is_alive());
        assert!(matches!(proc.write(b"x").await, Err(ProcessError::Dead)));
    }

    #[tokio::test]
    async fn test_terminate_not_blocked_by_stalled_writer() {
        let (proc, _rx) = spawn_sh("sleep 600");
        let proc = Arc::new(proc);
        let writer = {
            let proc = Arc::clone(&proc);
            tokio::spawn(async move {
                let flood = "a\n".repeat(32 * 1024);
                let _ = proc.write(flood.as_bytes()).await;
            })
        };
        // The tty input queue fills and the writer parks holding the write lock.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!writer.is_finished());

        let lifecycle = LifecycleConfig {
            polite_timeout_ms: 300,
            term_timeout_ms: 300,
            reap_interval_secs: 60,
        };
        let started = std::time::Instant::now();
        proc.terminate(&lifecycle).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!proc.is_alive());
        writer.abort();
    }

    #[tokio::test]
    async fn test_resize_is_applied_and_idempotent() {
        let (proc, mut rx) = spawn_sh("");
        proc.resize(24, 80).await.unwrap();
        proc.resize(40, 120).await.unwrap();
        proc.write(b"stty size\n").await.unwrap();
        collect_until(&mut rx, "40 120").await;
        proc.terminate(&LifecycleConfig::default()).await;
    }
}
