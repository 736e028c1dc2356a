//! A live session: one backing process, its fan-out, and the output pump
//! that connects them.
//!
//! The pump is the only reader of the process output. Terminal and remote
//! output goes through a [`Coalescer`] and is recorded in the history buffer
//! at flush time; chat records go through the [`ChatTranslator`]. Whichever
//! way the pump ends (EOF, read error, cancellation) it publishes exactly one
//! `closed` frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::coalesce::Coalescer;
use super::fanout::{Fanout, Replay};
use crate::chat::log::ChatLog;
use crate::chat::{user_turn, ChatTranslator};
use crate::config::LifecycleConfig;
use crate::error::{ProcessError, SessionError};
use crate::process::{Backend, BackingProcess};
use crate::protocol::{Channel, Frame, FrameType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Terminal,
    Chat,
    Remote,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Chat => "chat",
            Self::Remote => "remote",
        }
    }

    /// Channel this kind's frames travel on. Remote shells share the
    /// terminal channel.
    pub fn channel(self) -> Channel {
        match self {
            Self::Terminal | Self::Remote => Channel::Terminal,
            Self::Chat => Channel::Chat,
        }
    }
}

/// Creation parameters, as resolved by the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SessionContext {
    Terminal { cwd: String, rows: u16, cols: u16 },
    Chat { cwd: String, resumed: bool },
    Remote { host_id: String, rows: u16, cols: u16 },
}

/// Chat turn bookkeeping shared between `send_chat` and the pump.
struct TurnClock {
    active: AtomicBool,
    last_activity: parking_lot::Mutex<Instant>,
    started: Notify,
}

impl TurnClock {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            started: Notify::new(),
        }
    }

    fn start(&self) {
        *self.last_activity.lock() = Instant::now();
        self.active.store(true, Ordering::Relaxed);
        self.started.notify_one();
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn finish(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    fn deadline(&self, timeout: Duration) -> Option<tokio::time::Instant> {
        if !self.active.load(Ordering::Relaxed) {
            return None;
        }
        Some(tokio::time::Instant::from_std(*self.last_activity.lock() + timeout))
    }
}

struct ChatSide {
    log: Option<Arc<ChatLog>>,
    turn: Arc<TurnClock>,
}

pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub context: SessionContext,
    pub created_at_ms: u64,
    backend: Backend,
    fanout: Arc<Fanout>,
    cancel: CancellationToken,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    chat: Option<ChatSide>,
}

/// Coalescing settings for byte-stream pumps.
#[derive(Debug, Clone, Copy)]
pub struct PumpSettings {
    pub flush_interval: Duration,
    pub flush_threshold: usize,
}

impl Session {
    /// Wrap a terminal or remote process and start pumping its output.
    pub fn with_byte_stream(
        id: String,
        kind: SessionKind,
        context: SessionContext,
        backend: Backend,
        output: mpsc::Receiver<Bytes>,
        history_bytes: usize,
        settings: PumpSettings,
    ) -> Arc<Self> {
        let fanout = Arc::new(Fanout::new(Replay::Terminal(
            super::buffer::HistoryBuffer::new(history_bytes),
        )));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_bytes(
            id.clone(),
            kind.channel(),
            output,
            Arc::clone(&fanout),
            cancel.clone(),
            settings,
        ));
        Arc::new(Self {
            id,
            kind,
            context,
            created_at_ms: crate::util::now_ms(),
            backend,
            fanout,
            cancel,
            pump: parking_lot::Mutex::new(Some(pump)),
            chat: None,
        })
    }

    /// Wrap a chat agent. `history` seeds the replayed conversation.
    #[allow(clippy::too_many_arguments)]
    pub fn with_chat_stream(
        id: String,
        context: SessionContext,
        backend: Backend,
        records: mpsc::Receiver<Value>,
        history: Vec<Value>,
        history_limit: usize,
        log: Option<ChatLog>,
        turn_timeout: Duration,
    ) -> Arc<Self> {
        let mut replay = Replay::chat(history_limit);
        for record in history {
            replay.push_record(record);
        }
        let fanout = Arc::new(Fanout::new(replay));
        let cancel = CancellationToken::new();
        let log = log.map(Arc::new);
        let turn = Arc::new(TurnClock::new());
        let pump = tokio::spawn(pump_chat(
            id.clone(),
            records,
            Arc::clone(&fanout),
            cancel.clone(),
            log.clone(),
            Arc::clone(&turn),
            turn_timeout,
        ));
        Arc::new(Self {
            id,
            kind: SessionKind::Chat,
            context,
            created_at_ms: crate::util::now_ms(),
            backend,
            fanout,
            cancel,
            pump: parking_lot::Mutex::new(Some(pump)),
            chat: Some(ChatSide { log, turn }),
        })
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    pub fn is_alive(&self) -> bool {
        self.backend.is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.backend.pid()
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        self.backend.write(data).await
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), ProcessError> {
        self.backend.resize(rows, cols).await
    }

    /// Submit a user turn to a chat agent.
    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        let Some(chat) = &self.chat else {
            return Err(SessionError::WrongKind {
                id: self.id.clone(),
                expected: SessionKind::Chat.as_str(),
                actual: self.kind.as_str(),
            });
        };
        if !self.backend.is_alive() {
            return Err(ProcessError::Dead.into());
        }
        let record = user_turn(text);
        let mut line = record.to_string();
        line.push('\n');
        // Recorded before the write so the reply can never precede it.
        if let Some(log) = &chat.log {
            log.append(&record);
        }
        self.fanout.publish_batch(&[], |r| r.push_record(record));
        chat.turn.start();
        self.backend.write(line.as_bytes()).await?;
        Ok(())
    }

    /// `data` of the `connected` frame for a viewer attaching now.
    pub fn connected_payload(&self, replay: &Replay) -> Value {
        match replay {
            Replay::Terminal(_) => json!({
                "kind": self.kind,
                "context": self.context,
                "history": replay.terminal_text().unwrap_or_default(),
            }),
            Replay::Chat { .. } => json!({
                "kind": self.kind,
                "context": self.context,
                "history": replay.chat_records(),
            }),
        }
    }

    /// Terminate the process, then stop the pump and wait for it. The pump
    /// publishes the final `closed` frame.
    pub async fn shutdown(&self, lifecycle: &LifecycleConfig) {
        self.fanout.mark_closing();
        self.backend.terminate(lifecycle).await;
        self.cancel.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                if !e.is_cancelled() {
                    warn!("{}: output pump failed: {e}", self.id);
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump_bytes(
    id: String,
    channel: Channel,
    mut output: mpsc::Receiver<Bytes>,
    fanout: Arc<Fanout>,
    cancel: CancellationToken,
    settings: PumpSettings,
) {
    let mut coalescer = Coalescer::new(settings.flush_interval, settings.flush_threshold);
    let flush = |coalescer: &mut Coalescer, all: bool| {
        let text = if all { coalescer.take_all() } else { coalescer.take() };
        if let Some(text) = text {
            let frame = Frame::new(channel, FrameType::Output, Some(id.as_str()), json!({ "data": text }));
            fanout.publish(&frame, |r| r.push_output(text.as_bytes()));
        }
    };

    let reason = loop {
        let deadline = coalescer.deadline();
        tokio::select! {
            () = cancel.cancelled() => break "closed",
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    if coalescer.push(&chunk) {
                        flush(&mut coalescer, false);
                    }
                }
                None => break "exited",
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                flush(&mut coalescer, false);
            }
        }
    };

    // Drain whatever the reader already queued.
    while let Ok(chunk) = output.try_recv() {
        coalescer.push(&chunk);
    }
    flush(&mut coalescer, true);
    debug!("{id}: output pump finished ({reason})");
    fanout.publish(&Frame::closed(channel, &id, reason), |_| {});
}

async fn pump_chat(
    id: String,
    mut records: mpsc::Receiver<Value>,
    fanout: Arc<Fanout>,
    cancel: CancellationToken,
    log: Option<Arc<ChatLog>>,
    turn: Arc<TurnClock>,
    turn_timeout: Duration,
) {
    let mut translator = ChatTranslator::new();
    let reason = loop {
        let deadline = turn.deadline(turn_timeout);
        tokio::select! {
            () = cancel.cancelled() => break "closed",
            record = records.recv() => match record {
                Some(record) => {
                    turn.touch();
                    publish_record(&id, &fanout, log.as_deref(), &mut translator, &turn, record);
                }
                None => break "exited",
            },
            () = turn.started.notified() => {}
            () = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                turn.finish();
                warn!("{id}: no agent output for {}s", turn_timeout.as_secs());
                let frame = Frame::error(Channel::Chat, Some(id.as_str()), "agent is unresponsive");
                fanout.publish(&frame, |_| {});
            }
        }
    };
    while let Ok(record) = records.try_recv() {
        publish_record(&id, &fanout, log.as_deref(), &mut translator, &turn, record);
    }
    debug!("{id}: chat pump finished ({reason})");
    fanout.publish(&Frame::closed(Channel::Chat, &id, reason), |_| {});
}

fn publish_record(
    id: &str,
    fanout: &Fanout,
    log: Option<&ChatLog>,
    translator: &mut ChatTranslator,
    turn: &TurnClock,
    record: Value,
) {
    // Partial deltas are superseded by the final assistant record.
    if record["type"] != "stream_event" {
        if let Some(log) = log {
            log.append(&record);
        }
    }
    let translation = translator.translate(&record);
    let frames: Vec<Frame> = translation
        .frames
        .into_iter()
        .map(|(kind, data)| Frame::new(Channel::Chat, kind, Some(id), data))
        .collect();
    if translation.conversational {
        fanout.publish_batch(&frames, |r| r.push_record(record));
    } else {
        fanout.publish_batch(&frames, |_| {});
    }
    if translation.ends_turn {
        turn.finish();
    }
}
