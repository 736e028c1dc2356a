//! Append-only conversation log per chat session.
//!
//! Each session gets a `<id>.jsonl` file under `<data_dir>/chat/`, one agent
//! or user record per line. Writes go through an mpsc channel to a background
//! task that batches them to disk. On resume the `user`/`assistant` records
//! are replayed; logs that never got one are removed at startup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::is_conversation_record;

const LOG_QUEUE: usize = 10_000;

/// Writer handle for one session's log.
pub struct ChatLog {
    tx: mpsc::Sender<Value>,
    /// Set to `false` if the background writer task exits due to an error.
    alive: Arc<AtomicBool>,
}

impl ChatLog {
    /// Open (or create) the log for `session_id` and spawn its writer.
    pub async fn open(dir: &Path, session_id: &str) -> Result<Self, std::io::Error> {
        fs::create_dir_all(dir).await?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path(dir, session_id))
            .await?;

        let (tx, rx) = mpsc::channel(LOG_QUEUE);
        let alive = Arc::new(AtomicBool::new(true));
        tokio::spawn(log_writer_task(file, rx, Arc::clone(&alive)));
        Ok(Self { tx, alive })
    }

    /// Queue a record for writing. Never blocks.
    pub fn append(&self, record: &Value) {
        if !self.alive.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.try_send(record.clone()).is_err() {
            warn!("Chat log queue full, record not persisted");
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

fn log_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.jsonl"))
}

/// `<data_dir>/chat`
pub fn chat_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("chat")
}

async fn write_record(file: &mut fs::File, record: &Value) -> Result<(), std::io::Error> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line).await
}

/// Background task that drains records and writes them to disk.
async fn log_writer_task(mut file: fs::File, mut rx: mpsc::Receiver<Value>, alive: Arc<AtomicBool>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = write_record(&mut file, &record).await {
            error!("Chat log write error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
        // Batch: drain whatever else is queued before flushing
        while let Ok(record) = rx.try_recv() {
            if let Err(e) = write_record(&mut file, &record).await {
                error!("Chat log write error: {e}");
                alive.store(false, Ordering::Relaxed);
                return;
            }
        }
        if let Err(e) = file.flush().await {
            error!("Chat log flush error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
    }
}

/// Load the last `limit` conversation records of a session. A missing log is
/// an empty conversation.
pub async fn load_conversation(dir: &Path, session_id: &str, limit: usize) -> Vec<Value> {
    let Ok(file) = fs::File::open(log_path(dir, session_id)).await else {
        return Vec::new();
    };
    let mut lines = BufReader::new(file).lines();
    let mut records = std::collections::VecDeque::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(record) if is_conversation_record(&record) => {
                records.push_back(record);
                if records.len() > limit {
                    records.pop_front();
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Skipping corrupt chat log line: {e}"),
        }
    }
    records.into()
}

/// Whether a log exists with at least one real conversation record.
pub async fn has_conversation(dir: &Path, session_id: &str) -> bool {
    !load_conversation(dir, session_id, 1).await.is_empty()
}

/// Delete logs that contain no real conversation. Returns how many went.
pub async fn cleanup_empty_logs(dir: &Path) -> usize {
    let Ok(mut read_dir) = fs::read_dir(dir).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !has_conversation(dir, id).await {
            info!("Removing empty chat log: {}", path.display());
            if fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
    }
    removed
}
