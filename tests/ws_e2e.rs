//! End-to-end tests over a real WebSocket against an in-process server.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use agentmux::protocol::codec::{self, Encoded, Encoding};
use agentmux::protocol::{Channel, Frame, FrameType};
use agentmux::store::MemoryStore;
use agentmux::{AppState, Config};

const KEY: &str = "e2e-secret";

/// Fake agent: answers every stdin line with a streamed reply.
const FAKE_AGENT: &str = r#"while read -r line; do
echo '{"type":"system","subtype":"init","session_id":"agent-1"}'
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"po"}}}'
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ng"}}}'
echo '{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"pong"}]}}'
echo '{"type":"result","subtype":"success"}'
done"#;

struct Server {
    addr: std::net::SocketAddr,
    state: AppState,
    _dir: tempfile::TempDir,
}

async fn start_server(tweak: impl FnOnce(&mut Config)) -> Server {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.auth.api_key = KEY.into();
    config.server.data_dir = dir.path().display().to_string();
    config.terminal.shell = "/bin/sh".into();
    config.terminal.command = String::new();
    config.terminal.working_dir = dir.path().display().to_string();
    config.terminal.exit_input = "exit\n".into();
    config.chat.command = "/bin/sh".into();
    config.chat.args = vec!["-c".into(), FAKE_AGENT.into(), "agent".into()];
    config.lifecycle.polite_timeout_ms = 500;
    config.lifecycle.term_timeout_ms = 500;
    config.output.flush_interval_ms = 5;
    tweak(&mut config);

    let state = AppState::new(config, Arc::new(MemoryStore::new()));
    let app = agentmux::router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server {
        addr,
        state,
        _dir: dir,
    }
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    encoding: Encoding,
}

impl Client {
    async fn connect(server: &Server) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/ws", server.addr))
            .await
            .unwrap();
        Self {
            ws,
            encoding: Encoding::Binary,
        }
    }

    async fn authed(server: &Server) -> Self {
        let mut client = Self::connect(server).await;
        client.auth(KEY).await;
        assert_eq!(client.recv().await.kind, FrameType::AuthSuccess);
        client
    }

    async fn send(&mut self, frame: Frame) {
        let msg = match codec::encode(&frame, self.encoding).unwrap() {
            Encoded::Binary(bytes) => Message::Binary(bytes.into()),
            Encoded::Text(text) => Message::Text(text.into()),
        };
        self.ws.send(msg).await.unwrap();
    }

    async fn auth(&mut self, token: &str) {
        self.send(Frame::system(FrameType::Auth, json!({ "token": token })))
            .await;
    }

    async fn open(&mut self, channel: Channel, id: &str, data: Value) {
        self.send(Frame::new(channel, FrameType::Connect, Some(id), data))
            .await;
    }

    async fn input(&mut self, id: &str, text: &str) {
        self.send(Frame::new(
            Channel::Terminal,
            FrameType::Input,
            Some(id),
            json!({ "data": text }),
        ))
        .await;
    }

    async fn next_message(&mut self, limit: Duration) -> Option<Message> {
        match tokio::time::timeout(limit, self.ws.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            _ => None,
        }
    }

    async fn recv(&mut self) -> Frame {
        loop {
            let msg = self
                .next_message(Duration::from_secs(10))
                .await
                .expect("no frame within 10s");
            match msg {
                Message::Binary(bytes) => return codec::decode_binary(&bytes).unwrap(),
                Message::Text(text) => return codec::decode_text(text.as_str()).unwrap(),
                _ => {}
            }
        }
    }

    /// Collect frames until terminal output contains `needle`.
    async fn recv_output_until(&mut self, needle: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut text = String::new();
        loop {
            let frame = self.recv().await;
            if frame.kind == FrameType::Output {
                text.push_str(frame.data["data"].as_str().unwrap_or_default());
            }
            frames.push(frame);
            if text.contains(needle) {
                return frames;
            }
        }
    }

    async fn recv_kind(&mut self, kind: FrameType) -> Frame {
        loop {
            let frame = self.recv().await;
            if frame.kind == kind {
                return frame;
            }
        }
    }

    /// Whether nothing at all arrives within `limit`.
    async fn silent_for(&mut self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.ws.next()).await.is_err()
    }
}

fn output_text(frames: &[Frame]) -> String {
    frames
        .iter()
        .filter(|f| f.kind == FrameType::Output)
        .map(|f| f.data["data"].as_str().unwrap_or_default())
        .collect()
}

async fn http_get(server: &Server, path: &str, token: Option<&str>) -> String {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let auth = token
        .map(|t| format!("Authorization: Bearer {t}\r\n"))
        .unwrap_or_default();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{auth}Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_unauthenticated_connection_is_inert() {
    let server = start_server(|_| {}).await;
    let mut client = Client::connect(&server).await;

    client.open(Channel::Terminal, "inert", json!({})).await;
    client.send(Frame::system(FrameType::Ping, json!({}))).await;
    assert!(client.silent_for(Duration::from_millis(300)).await);
    assert!(server.state.registry.get("inert").is_none());

    client.auth("wrong").await;
    assert_eq!(client.recv().await.kind, FrameType::AuthFailed);
    client.open(Channel::Terminal, "inert", json!({})).await;
    assert!(client.silent_for(Duration::from_millis(300)).await);

    client.auth(KEY).await;
    assert_eq!(client.recv().await.kind, FrameType::AuthSuccess);
    // Later auth requests succeed without re-checking the token.
    client.auth("anything").await;
    assert_eq!(client.recv().await.kind, FrameType::AuthSuccess);
    client.send(Frame::system(FrameType::Ping, json!({}))).await;
    assert_eq!(client.recv().await.kind, FrameType::Pong);
}

#[tokio::test]
async fn test_auth_timeout_drops_connection() {
    let server = start_server(|c| c.server.auth_timeout_secs = 1).await;
    let mut client = Client::connect(&server).await;
    let mut closed = false;
    for _ in 0..10 {
        match client.next_message(Duration::from_secs(5)).await {
            None | Some(Message::Close(_)) => {
                closed = true;
                break;
            }
            Some(_) => {}
        }
    }
    assert!(closed);
}

#[tokio::test]
async fn test_terminal_round_trip_and_reattach() {
    let server = start_server(|_| {}).await;
    let mut client = Client::authed(&server).await;

    client
        .open(Channel::Terminal, "term-1", json!({ "rows": 30, "cols": 100 }))
        .await;
    let connected = client.recv_kind(FrameType::Connected).await;
    assert_eq!(connected.channel, Channel::Terminal);
    assert_eq!(connected.session_id.as_deref(), Some("term-1"));
    assert_eq!(connected.data["kind"], "terminal");

    client.input("term-1", "echo first-$((20 + 1))\n").await;
    client.recv_output_until("first-21").await;
    let pid = server.state.registry.get("term-1").unwrap().pid();
    drop(client);

    // The shell keeps running without viewers; a new connection sees history.
    let mut again = Client::authed(&server).await;
    again.open(Channel::Terminal, "term-1", json!({})).await;
    let connected = again.recv_kind(FrameType::Connected).await;
    assert!(connected.data["history"]
        .as_str()
        .unwrap()
        .contains("first-21"));
    assert_eq!(server.state.registry.get("term-1").unwrap().pid(), pid);

    again.input("term-1", "echo second-$((40 + 2))\n").await;
    again.recv_output_until("second-42").await;

    again
        .send(Frame::new(Channel::Terminal, FrameType::Close, Some("term-1"), json!({})))
        .await;
    let closed = again.recv_kind(FrameType::Closed).await;
    assert_eq!(closed.session_id.as_deref(), Some("term-1"));
    assert!(server.state.registry.get("term-1").is_none());
}

#[tokio::test]
async fn test_stuck_session_does_not_stall_connection() {
    let server = start_server(|_| {}).await;
    let mut client = Client::authed(&server).await;
    for id in ["stuck", "other"] {
        client.open(Channel::Terminal, id, json!({})).await;
        client.recv_kind(FrameType::Connected).await;
    }

    // `stuck` stops reading its input; the flood then parks its writer.
    client.input("stuck", "sleep 600\n").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.input("stuck", &"a\n".repeat(32 * 1024)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    client.send(Frame::system(FrameType::Ping, json!({}))).await;
    client.input("other", "echo alive-$((8 * 8))\n").await;
    let mut pong = false;
    let mut text = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(pong && text.contains("alive-64")) {
        let frame = tokio::time::timeout_at(deadline, client.recv())
            .await
            .expect("connection stalled behind a stuck session");
        match frame.kind {
            FrameType::Pong => pong = true,
            FrameType::Output if frame.session_id.as_deref() == Some("other") => {
                text.push_str(frame.data["data"].as_str().unwrap_or_default());
            }
            _ => {}
        }
    }

    // Close reaches `stuck` even though its lane is blocked writing.
    client
        .send(Frame::new(Channel::Terminal, FrameType::Close, Some("stuck"), json!({})))
        .await;
    loop {
        let frame = client.recv().await;
        if frame.kind == FrameType::Closed && frame.session_id.as_deref() == Some("stuck") {
            break;
        }
    }
    assert!(server.state.registry.get("stuck").is_none());
    assert!(server.state.registry.get("other").is_some());
}

#[tokio::test]
async fn test_two_viewers_see_same_order() {
    let server = start_server(|_| {}).await;
    let mut a = Client::authed(&server).await;
    let mut b = Client::authed(&server).await;
    a.open(Channel::Terminal, "shared", json!({})).await;
    a.recv_kind(FrameType::Connected).await;
    b.open(Channel::Terminal, "shared", json!({})).await;
    b.recv_kind(FrameType::Connected).await;

    a.input("shared", "for i in 1 2 3 4 5 6; do echo n-$i; done; echo done-$((3 * 3))\n")
        .await;
    let text_a = output_text(&a.recv_output_until("done-9").await);
    let text_b = output_text(&b.recv_output_until("done-9").await);
    for text in [&text_a, &text_b] {
        let positions: Vec<usize> = (1..=6)
            .map(|i| text.rfind(&format!("n-{i}")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    let session = server.state.registry.get("shared").unwrap();
    assert_eq!(session.fanout().viewer_count(), 2);
    assert_eq!(session.fanout().listener_count(), 1);

    b.send(Frame::new(Channel::Terminal, FrameType::Disconnect, Some("shared"), json!({})))
        .await;
    a.input("shared", "echo after-$((5 + 5))\n").await;
    a.recv_output_until("after-10").await;
    assert_eq!(session.fanout().viewer_count(), 1);
    assert_eq!(server.state.hub.subscriber_count("shared"), 1);
}

#[tokio::test]
async fn test_text_encoding_is_answered_in_text() {
    let server = start_server(|_| {}).await;
    let mut client = Client::connect(&server).await;
    client.encoding = Encoding::Text;
    client.auth(KEY).await;
    match client.next_message(Duration::from_secs(5)).await {
        Some(Message::Text(text)) => {
            let raw: Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(raw["channel"], "system");
            assert_eq!(raw["type"], "auth_success");
        }
        other => panic!("expected a text frame, got {other:?}"),
    }

    // Undecodable frames are dropped without closing the connection.
    client
        .ws
        .send(Message::Text(r#"{"channel":"video","type":"play"}"#.to_string().into()))
        .await
        .unwrap();
    client.send(Frame::system(FrameType::Ping, json!({}))).await;
    assert_eq!(client.recv().await.kind, FrameType::Pong);
}

#[tokio::test]
async fn test_missing_session_id_reports_error() {
    let server = start_server(|_| {}).await;
    let mut client = Client::authed(&server).await;
    client
        .send(Frame::new(Channel::Terminal, FrameType::Input, None, json!({ "data": "ls\n" })))
        .await;
    let err = client.recv().await;
    assert_eq!(err.kind, FrameType::Error);
    assert_eq!(err.channel, Channel::Terminal);
    assert!(err.data["message"].as_str().is_some());
}

#[tokio::test]
async fn test_chat_turn_streams_and_replays() {
    let server = start_server(|_| {}).await;
    let mut client = Client::authed(&server).await;

    client.open(Channel::Chat, "chat-1", json!({})).await;
    let connected = client.recv_kind(FrameType::Connected).await;
    assert_eq!(connected.channel, Channel::Chat);
    assert_eq!(connected.data["history"], json!([]));

    client
        .send(Frame::new(
            Channel::Chat,
            FrameType::Message,
            Some("chat-1"),
            json!({ "content": "ping" }),
        ))
        .await;

    let mut kinds = Vec::new();
    let mut streamed = String::new();
    loop {
        let frame = client.recv().await;
        assert_eq!(frame.channel, Channel::Chat);
        if frame.kind == FrameType::Stream {
            streamed.push_str(frame.data["text"].as_str().unwrap());
        }
        kinds.push(frame.kind);
        if frame.kind == FrameType::Result {
            break;
        }
    }
    assert_eq!(streamed, "pong");
    assert_eq!(
        kinds,
        vec![
            FrameType::Stream,
            FrameType::Stream,
            FrameType::Assistant,
            FrameType::Result
        ]
    );

    let mut late = Client::authed(&server).await;
    late.open(Channel::Chat, "chat-1", json!({})).await;
    let connected = late.recv_kind(FrameType::Connected).await;
    let history = connected.data["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["type"], "user");
    assert_eq!(history[1]["type"], "assistant");
}

#[tokio::test]
async fn test_wrong_channel_for_existing_session() {
    let server = start_server(|_| {}).await;
    let mut client = Client::authed(&server).await;
    client.open(Channel::Terminal, "mixed", json!({})).await;
    client.recv_kind(FrameType::Connected).await;
    client.open(Channel::Chat, "mixed", json!({})).await;
    let err = client.recv_kind(FrameType::Error).await;
    assert_eq!(err.channel, Channel::Chat);
}

#[tokio::test]
async fn test_rest_endpoints() {
    let server = start_server(|_| {}).await;
    let health = http_get(&server, "/api/health", None).await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains("\"status\":\"ok\""));

    let denied = http_get(&server, "/api/sessions", None).await;
    assert!(denied.starts_with("HTTP/1.1 401"));
    let forbidden = http_get(&server, "/api/sessions", Some("nope")).await;
    assert!(forbidden.starts_with("HTTP/1.1 403"));

    let mut client = Client::authed(&server).await;
    client.open(Channel::Terminal, "listed", json!({})).await;
    client.recv_kind(FrameType::Connected).await;
    let listed = http_get(&server, "/api/sessions", Some(KEY)).await;
    assert!(listed.starts_with("HTTP/1.1 200"));
    assert!(listed.contains("\"id\":\"listed\""));
    assert!(listed.contains("\"viewers\":1"));
}
