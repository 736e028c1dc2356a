//! Agent subprocess speaking line-delimited JSON on stdin/stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use super::{terminate_gracefully, BackingProcess, ExitWatch};
use crate::config::LifecycleConfig;
use crate::error::ProcessError;

const READ_CHUNK: usize = 64 * 1024;

/// Everything needed to start a chat agent.
pub struct ChatSpawn<'a> {
    pub label: String,
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: &'a str,
    pub max_line_bytes: usize,
    pub queue_capacity: usize,
}

pub struct ChatProcess {
    label: String,
    pid: u32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exit: ExitWatch,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatProcess {
    /// Start the agent in its own process group with piped stdio.
    pub fn spawn(opts: &ChatSpawn<'_>) -> Result<(Self, mpsc::Receiver<Value>), ProcessError> {
        let mut child = Command::new(opts.program)
            .args(&opts.args)
            .current_dir(opts.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: opts.program.to_string(),
                source,
            })?;
        let pid = child.id().ok_or(ProcessError::Dead)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or(ProcessError::Dead)?;
        let stderr = child.stderr.take();

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(opts.queue_capacity.max(1));

        let mut tasks = Vec::with_capacity(2);
        let label = opts.label.clone();
        let max_line = opts.max_line_bytes;
        let reader_alive = Arc::clone(&alive);
        tasks.push(tokio::spawn(async move {
            read_records(stdout, max_line, &tx, &label).await;
            // Dead before the pump can see the queue close.
            reader_alive.store(false, Ordering::Relaxed);
            drop(tx);
        }));
        if let Some(stderr) = stderr {
            let label = opts.label.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("{label} stderr: {line}");
                }
            }));
        }

        let exit = ExitWatch::spawn(child, opts.label.clone());
        debug!("{}: spawned pid {pid} in {}", opts.label, opts.cwd);

        Ok((
            Self {
                label: opts.label.clone(),
                pid,
                stdin: tokio::sync::Mutex::new(stdin),
                exit,
                alive,
                tasks,
            },
            rx,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Read newline-delimited JSON records from `reader` into `tx`.
///
/// A line longer than `max_line_bytes` is logged and skipped; reading resumes
/// after its newline. A full queue drops the newest record. Lines that are
/// not JSON are logged at debug level and skipped.
pub async fn read_records<R: AsyncRead + Unpin>(
    mut reader: R,
    max_line_bytes: usize,
    tx: &mpsc::Sender<Value>,
    label: &str,
) {
    let mut codec = LinesCodec::new_with_max_length(max_line_bytes);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(line)) => {
                    if !forward_line(&line, tx, label) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!("{label}: dropped stdout line over {max_line_bytes} bytes");
                }
                Err(LinesCodecError::Io(e)) => {
                    warn!("{label}: stdout decode failed: {e}");
                    return;
                }
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("{label}: stdout read failed: {e}");
                return;
            }
        }
    }
    // Final unterminated line.
    loop {
        match codec.decode_eof(&mut buf) {
            Ok(Some(line)) => {
                if !forward_line(&line, tx, label) {
                    return;
                }
            }
            Ok(None) => return,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("{label}: dropped stdout line over {max_line_bytes} bytes");
            }
            Err(LinesCodecError::Io(_)) => return,
        }
    }
}

/// Returns `false` once the receiving side is gone.
fn forward_line(line: &str, tx: &mpsc::Sender<Value>, label: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    let record: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("{label}: ignoring non-JSON line: {e}");
            return true;
        }
    };
    match tx.try_send(record) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("{label}: record queue full, dropping newest record");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

impl BackingProcess for ChatProcess {
    async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Err(ProcessError::Dead);
        }
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(ProcessError::Dead)?;
        pipe.write_all(data).await?;
        pipe.flush().await?;
        Ok(())
    }

    async fn resize(&self, _rows: u16, _cols: u16) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn terminate(&self, lifecycle: &LifecycleConfig) {
        // Closing stdin is the polite exit request. A writer stuck on a full
        // pipe holds the lock; escalation proceeds without it.
        match tokio::time::timeout(lifecycle.polite_timeout(), self.stdin.lock()).await {
            Ok(mut stdin) => drop(stdin.take()),
            Err(_) => debug!("{}: stdin busy, escalating", self.label),
        }
        terminate_gracefully(&self.label, self.pid, &self.exit, None, lifecycle).await;
        self.alive.store(false, Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed) && !self.exit.has_exited()
    }
}

impl Drop for ChatProcess {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
