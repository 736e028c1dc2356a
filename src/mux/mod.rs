//! WebSocket transport multiplexing terminal, chat and system channels.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws`. There is no token on the upgrade; the
//!    first useful frame must be `system/auth`. Until it succeeds every other
//!    frame is ignored, and the connection is dropped if it does not succeed
//!    within `server.auth_timeout_secs`.
//! 2. Frames are MessagePack in binary messages or JSON in text messages. The
//!    server answers in whichever encoding the client last used.
//! 3. On disconnect every subscription is torn down. Sessions keep running
//!    for later reattach.
//!
//! ## Frames (client → server)
//!
//! | Channel    | Type         | Data                                    |
//! |------------|--------------|-----------------------------------------|
//! | `system`   | `auth`       | `token`                                 |
//! | `system`   | `ping`       | —                                       |
//! | `terminal` | `connect`    | `cwd?`, `rows?`, `cols?`, `host_id?`    |
//! | `terminal` | `input`      | `data`                                  |
//! | `terminal` | `resize`     | `rows`, `cols`                          |
//! | `chat`     | `connect`    | `cwd?`                                  |
//! | `chat`     | `message`    | `content`                               |
//! | both       | `disconnect` | —                                       |
//! | both       | `close`      | —                                       |
//!
//! Everything except `system` frames and `connect` needs a `session_id`.

pub mod hub;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::constant_time_eq;
use crate::error::SessionError;
use crate::protocol::codec::{self, Encoded, Encoding};
use crate::protocol::{
    AuthRequest, Channel, ConnectRequest, Frame, FrameType, InputRequest, MessageRequest,
    ResizeRequest,
};
use crate::sessions::{OpenRequest, SessionKind};
use crate::AppState;

use self::hub::ConnId;

const LANE_QUEUE: usize = 256;

/// `GET /api/ws` — WebSocket upgrade handler. Authentication happens in-band.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main WebSocket event loop.
///
/// Outgoing frames from every source (direct replies and per-session
/// consumer tasks) funnel through one mpsc channel into a send task that owns
/// the sink and does the encoding.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(state.config.output.queue_capacity.max(1));
    let text_mode = Arc::new(AtomicBool::new(false));

    let send_mode = Arc::clone(&text_mode);
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let encoding = if send_mode.load(Ordering::Relaxed) {
                Encoding::Text
            } else {
                Encoding::Binary
            };
            let msg = match codec::encode(&frame, encoding) {
                Ok(Encoded::Binary(bytes)) => Message::Binary(bytes.into()),
                Ok(Encoded::Text(text)) => Message::Text(text.into()),
                Err(e) => {
                    error!("WS send: failed to encode frame: {e}");
                    continue;
                }
            };
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let conn = state.hub.register(tx.clone());
    info!("{conn}: client connected");
    let mut connection = Connection {
        ctx: Context { state, conn, tx },
        authed: false,
        lanes: HashMap::new(),
        stop: CancellationToken::new(),
    };

    let auth_deadline = tokio::time::Instant::now()
        + Duration::from_secs(connection.ctx.state.config.server.auth_timeout_secs);

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                let decoded = match msg {
                    Message::Binary(bytes) => {
                        text_mode.store(false, Ordering::Relaxed);
                        codec::decode_binary(&bytes)
                    }
                    Message::Text(text) => {
                        text_mode.store(true, Ordering::Relaxed);
                        codec::decode_text(text.as_str())
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                match decoded {
                    Ok(frame) => connection.handle(frame).await,
                    Err(e) => warn!("{conn}: dropping undecodable frame: {e}"),
                }
            }
            () = tokio::time::sleep_until(auth_deadline), if !connection.authed => {
                info!("{conn}: authentication timed out");
                break;
            }
        }
    }

    // Lanes finish the frame in hand and take no more.
    connection.stop.cancel();
    drop(connection.lanes);
    let removed = connection.ctx.state.hub.disconnect(conn);
    info!("{conn}: client disconnected ({removed} subscription(s) released)");
    send_task.abort();
}

/// Work queued on a session lane.
enum Step {
    Frame(Frame),
    /// Hold later frames until a detached close has finished.
    Wait(CancellationToken),
}

/// Read-loop side of one connection.
///
/// Frames naming a session run on that session's lane: one task per
/// (connection, session id) draining a bounded queue in order. A slow write,
/// connect or close therefore delays only its own session, never the read
/// loop or other sessions.
struct Connection {
    ctx: Context,
    authed: bool,
    lanes: HashMap<String, mpsc::Sender<Step>>,
    stop: CancellationToken,
}

impl Connection {
    async fn handle(&mut self, frame: Frame) {
        if frame.channel == Channel::System {
            self.handle_system(&frame).await;
            return;
        }
        if !self.authed {
            debug!("{}: ignoring {} before auth", self.ctx.conn, frame.kind.as_str());
            return;
        }
        match frame.session_id.clone().filter(|s| !s.is_empty()) {
            Some(sid) if frame.kind == FrameType::Close => self.close_detached(sid, frame),
            Some(sid) => self.enqueue(sid, Step::Frame(frame)),
            // A fresh session: nothing else can name it yet.
            None if frame.kind == FrameType::Connect => {
                let ctx = self.ctx.clone();
                let stop = self.stop.clone();
                tokio::spawn(async move {
                    if !stop.is_cancelled() {
                        ctx.run(frame).await;
                    }
                });
            }
            None => self.ctx.run(frame).await,
        }
    }

    async fn handle_system(&mut self, frame: &Frame) {
        let ctx = &self.ctx;
        match frame.kind {
            FrameType::Auth => {
                if self.authed {
                    ctx.reply(Frame::system(FrameType::AuthSuccess, json!({}))).await;
                    return;
                }
                let token = frame
                    .payload::<AuthRequest>()
                    .map(|r| r.token)
                    .unwrap_or_default();
                let expected = &ctx.state.config.auth.api_key;
                if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
                    self.authed = true;
                    info!("{}: authenticated", ctx.conn);
                    ctx.reply(Frame::system(FrameType::AuthSuccess, json!({}))).await;
                } else {
                    warn!("{}: authentication failed", ctx.conn);
                    ctx.reply(Frame::system(
                        FrameType::AuthFailed,
                        json!({ "message": "invalid token" }),
                    ))
                    .await;
                }
            }
            FrameType::Ping if self.authed => {
                ctx.reply(Frame::system(FrameType::Pong, json!({}))).await;
            }
            _ => debug!("{}: ignoring system {}", ctx.conn, frame.kind.as_str()),
        }
    }

    /// Close off the lane, so a close can reach a session whose lane is
    /// stuck writing to it. Later frames for the id wait for it to finish.
    fn close_detached(&mut self, sid: String, frame: Frame) {
        let done = CancellationToken::new();
        self.enqueue(sid, Step::Wait(done.clone()));
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _done = done.drop_guard();
            ctx.run(frame).await;
        });
    }

    fn enqueue(&mut self, sid: String, step: Step) {
        let lane = self.lanes.entry(sid.clone()).or_insert_with(|| {
            let (lane_tx, lane_rx) = mpsc::channel(LANE_QUEUE);
            tokio::spawn(run_lane(self.ctx.clone(), lane_rx, self.stop.clone()));
            lane_tx
        });
        match lane.try_send(step) {
            Ok(()) => {}
            Err(TrySendError::Full(Step::Frame(frame))) => {
                warn!("{}: lane for {sid} full, dropping {} frame", self.ctx.conn, frame.kind.as_str());
                let _ = self.ctx.tx.try_send(Frame::error(
                    frame.channel,
                    Some(sid.as_str()),
                    "session is busy",
                ));
            }
            Err(TrySendError::Full(Step::Wait(_))) => {
                warn!("{}: lane for {sid} full, close not ordered", self.ctx.conn);
            }
            Err(TrySendError::Closed(_)) => {
                warn!("{}: lane for {sid} gone", self.ctx.conn);
                self.lanes.remove(&sid);
            }
        }
    }
}

async fn run_lane(ctx: Context, mut steps: mpsc::Receiver<Step>, stop: CancellationToken) {
    loop {
        let step = tokio::select! {
            () = stop.cancelled() => break,
            step = steps.recv() => match step {
                Some(step) => step,
                None => break,
            },
        };
        match step {
            Step::Frame(frame) => ctx.run(frame).await,
            Step::Wait(done) => done.cancelled().await,
        }
    }
}

/// What a lane or detached task needs to act for the connection.
#[derive(Clone)]
struct Context {
    state: AppState,
    conn: ConnId,
    tx: mpsc::Sender<Frame>,
}

impl Context {
    async fn reply(&self, frame: Frame) {
        let _ = self.tx.send(frame).await;
    }

    /// Dispatch one authenticated frame, turning failure into an `error`
    /// frame on its channel.
    async fn run(&self, frame: Frame) {
        let channel = frame.channel;
        let session_id = frame.session_id.clone();
        if let Err(message) = self.dispatch(frame).await {
            self.reply(Frame::error(channel, session_id.as_deref(), &message))
                .await;
        }
    }

    /// Handle an authenticated terminal or chat frame. `Err` carries the
    /// message for the channel's `error` frame.
    async fn dispatch(&self, frame: Frame) -> Result<(), String> {
        let registry = &self.state.registry;
        match frame.kind {
            FrameType::Connect => self.connect(&frame).await,
            FrameType::Input => {
                let sid = frame.require_session().map_err(|e| e.to_string())?;
                let req: InputRequest = frame.payload().map_err(|e| e.to_string())?;
                registry
                    .write(sid, req.data.as_bytes())
                    .await
                    .map_err(|e| e.to_string())
            }
            FrameType::Resize => {
                let sid = frame.require_session().map_err(|e| e.to_string())?;
                let req: ResizeRequest = frame.payload().map_err(|e| e.to_string())?;
                registry
                    .resize(sid, req.rows, req.cols)
                    .await
                    .map_err(|e| e.to_string())
            }
            FrameType::Message => {
                let sid = frame.require_session().map_err(|e| e.to_string())?;
                let req: MessageRequest = frame.payload().map_err(|e| e.to_string())?;
                registry
                    .send_chat(sid, &req.content)
                    .await
                    .map_err(|e| e.to_string())
            }
            FrameType::Disconnect => {
                let sid = frame.require_session().map_err(|e| e.to_string())?;
                self.state.hub.unsubscribe(self.conn, sid);
                Ok(())
            }
            FrameType::Close => {
                let sid = frame.require_session().map_err(|e| e.to_string())?;
                let existed = registry.close(sid).await.map_err(|e| e.to_string())?;
                if !existed {
                    self.reply(Frame::closed(frame.channel, sid, "closed")).await;
                }
                Ok(())
            }
            other => Err(format!("unexpected {} frame", other.as_str())),
        }
    }

    async fn connect(&self, frame: &Frame) -> Result<(), String> {
        let req: ConnectRequest = frame.payload().map_err(|e| e.to_string())?;
        let registry = &self.state.registry;
        let kind = match frame.channel {
            Channel::Chat => SessionKind::Chat,
            _ if req.host_id.is_some() => SessionKind::Remote,
            _ => match frame.session_id.as_deref().and_then(|id| registry.get(id)) {
                Some(existing) if existing.kind == SessionKind::Remote => SessionKind::Remote,
                _ => SessionKind::Terminal,
            },
        };
        let open = OpenRequest {
            id: frame.session_id.clone().filter(|s| !s.is_empty()),
            kind,
            cwd: req.cwd,
            rows: req.rows,
            cols: req.cols,
            host_id: req.host_id,
        };

        // A session the reaper is tearing down refuses new viewers; opening
        // again replaces it with a fresh one.
        for attempt in 0..2 {
            let opened = registry.open(open.clone()).await.map_err(|e| e.to_string())?;
            let session = opened.session;
            if let (Some(rows), Some(cols)) = (open.rows, open.cols) {
                if !opened.created {
                    if let Err(e) = session.resize(rows, cols).await {
                        debug!("{}: resize on reattach failed: {e}", session.id);
                    }
                }
            }
            match self.state.hub.subscribe(self.conn, &session) {
                Ok(()) => {
                    info!(
                        "{}: attached to {} session {} ({})",
                        self.conn,
                        kind.as_str(),
                        session.id,
                        if opened.created { "new" } else { "existing" }
                    );
                    return Ok(());
                }
                Err(SessionError::Closing(_)) if attempt == 0 => {
                    debug!("{}: {} closing, reopening", self.conn, session.id);
                }
                Err(e) => return Err(e.to_string()),
            }
        }
        Err("session is closing".to_string())
    }
}
