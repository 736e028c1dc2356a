//! Frame model shared by every channel of the multiplexed WebSocket.
//!
//! A frame is `{channel, type, session_id?, data}`. Channels and types have a
//! numeric code used by the compact binary encoding and a name used by the
//! legacy JSON text encoding (see [`codec`]).
//!
//! | channel  | code | server → client                                                      | client → server                                   |
//! |----------|------|----------------------------------------------------------------------|---------------------------------------------------|
//! | terminal | 1    | connected=1 output=2 error=3 closed=4                                | connect=16 input=17 resize=18 disconnect=19 close=20 |
//! | chat     | 2    | connected=1 stream=2 assistant=3 tool_call=4 tool_result=5 thinking=6 result=7 error=8 closed=9 | connect=16 message=17 disconnect=19 close=20 |
//! | system   | 3    | auth_success=1 auth_failed=2 pong=3                                  | auth=16 ping=17                                   |

pub mod codec;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;

/// Logical channel a frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Terminal,
    Chat,
    System,
}

impl Channel {
    pub fn code(self) -> u8 {
        match self {
            Self::Terminal => 1,
            Self::Chat => 2,
            Self::System => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(Self::Terminal),
            2 => Ok(Self::Chat),
            3 => Ok(Self::System),
            other => Err(ProtocolError::UnknownChannel(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Chat => "chat",
            Self::System => "system",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "terminal" => Ok(Self::Terminal),
            "chat" => Ok(Self::Chat),
            "system" => Ok(Self::System),
            other => Err(ProtocolError::UnknownChannelName(other.to_string())),
        }
    }

    fn types(self) -> &'static [(u8, FrameType)] {
        match self {
            Self::Terminal => TERMINAL_TYPES,
            Self::Chat => CHAT_TYPES,
            Self::System => SYSTEM_TYPES,
        }
    }
}

/// Frame type. Which types are legal depends on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    // server → client
    Connected,
    Output,
    Error,
    Closed,
    Stream,
    Assistant,
    ToolCall,
    ToolResult,
    Thinking,
    Result,
    AuthSuccess,
    AuthFailed,
    Pong,
    // client → server
    Connect,
    Input,
    Resize,
    Disconnect,
    Close,
    Message,
    Auth,
    Ping,
}

const TERMINAL_TYPES: &[(u8, FrameType)] = &[
    (1, FrameType::Connected),
    (2, FrameType::Output),
    (3, FrameType::Error),
    (4, FrameType::Closed),
    (0x10, FrameType::Connect),
    (0x11, FrameType::Input),
    (0x12, FrameType::Resize),
    (0x13, FrameType::Disconnect),
    (0x14, FrameType::Close),
];

const CHAT_TYPES: &[(u8, FrameType)] = &[
    (1, FrameType::Connected),
    (2, FrameType::Stream),
    (3, FrameType::Assistant),
    (4, FrameType::ToolCall),
    (5, FrameType::ToolResult),
    (6, FrameType::Thinking),
    (7, FrameType::Result),
    (8, FrameType::Error),
    (9, FrameType::Closed),
    (0x10, FrameType::Connect),
    (0x11, FrameType::Message),
    (0x13, FrameType::Disconnect),
    (0x14, FrameType::Close),
];

const SYSTEM_TYPES: &[(u8, FrameType)] = &[
    (1, FrameType::AuthSuccess),
    (2, FrameType::AuthFailed),
    (3, FrameType::Pong),
    (0x10, FrameType::Auth),
    (0x11, FrameType::Ping),
];

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Output => "output",
            Self::Error => "error",
            Self::Closed => "closed",
            Self::Stream => "stream",
            Self::Assistant => "assistant",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Thinking => "thinking",
            Self::Result => "result",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailed => "auth_failed",
            Self::Pong => "pong",
            Self::Connect => "connect",
            Self::Input => "input",
            Self::Resize => "resize",
            Self::Disconnect => "disconnect",
            Self::Close => "close",
            Self::Message => "message",
            Self::Auth => "auth",
            Self::Ping => "ping",
        }
    }

    /// Numeric code of this type on `channel`.
    pub fn code_on(self, channel: Channel) -> Result<u8, ProtocolError> {
        channel
            .types()
            .iter()
            .find(|(_, t)| *t == self)
            .map(|(code, _)| *code)
            .ok_or(ProtocolError::InvalidType {
                channel: channel.as_str(),
                kind: self.as_str(),
            })
    }

    pub fn from_code(channel: Channel, code: u8) -> Result<Self, ProtocolError> {
        channel
            .types()
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, t)| *t)
            .ok_or(ProtocolError::UnknownType {
                channel: channel.as_str(),
                code,
            })
    }

    pub fn from_name(channel: Channel, name: &str) -> Result<Self, ProtocolError> {
        channel
            .types()
            .iter()
            .find(|(_, t)| t.as_str() == name)
            .map(|(_, t)| *t)
            .ok_or_else(|| ProtocolError::UnknownTypeName {
                channel: channel.as_str(),
                name: name.to_string(),
            })
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: Channel,
    pub kind: FrameType,
    pub session_id: Option<String>,
    pub data: Value,
}

impl Frame {
    pub fn new(channel: Channel, kind: FrameType, session_id: Option<&str>, data: Value) -> Self {
        Self {
            channel,
            kind,
            session_id: session_id.map(str::to_string),
            data,
        }
    }

    pub fn system(kind: FrameType, data: Value) -> Self {
        Self::new(Channel::System, kind, None, data)
    }

    pub fn output(session_id: &str, text: &str) -> Self {
        Self::new(
            Channel::Terminal,
            FrameType::Output,
            Some(session_id),
            json!({ "data": text }),
        )
    }

    pub fn error(channel: Channel, session_id: Option<&str>, message: &str) -> Self {
        Self::new(channel, FrameType::Error, session_id, json!({ "message": message }))
    }

    pub fn closed(channel: Channel, session_id: &str, reason: &str) -> Self {
        Self::new(channel, FrameType::Closed, Some(session_id), json!({ "reason": reason }))
    }

    /// Deserialize `data` into a typed request payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = if self.data.is_null() {
            Value::Object(Map::new())
        } else {
            self.data.clone()
        };
        serde_json::from_value(data).map_err(|source| ProtocolError::Payload {
            kind: self.kind.as_str(),
            source,
        })
    }

    pub fn require_session(&self) -> Result<&str, ProtocolError> {
        self.session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingSession)
    }
}

/// `connect` payload on the terminal and chat channels.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    pub cwd: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    /// Terminal channel only: open a remote shell on this stored host.
    pub host_id: Option<String>,
}

/// Terminal `input` payload.
#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

/// Terminal `resize` payload.
#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

/// Chat `message` payload.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

/// System `auth` payload.
#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}
