//! Binary (MessagePack) and legacy text (JSON) frame encodings.
//!
//! Binary frames are MessagePack maps with short keys:
//! `{"c": channel, "t": type, "s"?: session_id, "d": data}`.
//! Text frames spell everything out:
//! `{"channel": "terminal", "type": "output", "session_id"?: "...", "data": {}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Channel, Frame, FrameType};
use crate::error::ProtocolError;

/// Which encoding a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Text,
}

/// An encoded frame ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Serialize, Deserialize)]
struct BinaryWire {
    c: u8,
    t: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<String>,
    #[serde(default = "empty_object")]
    d: Value,
}

#[derive(Serialize, Deserialize)]
struct TextWire {
    channel: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default = "empty_object")]
    data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

pub fn encode(frame: &Frame, encoding: Encoding) -> Result<Encoded, ProtocolError> {
    match encoding {
        Encoding::Binary => {
            let wire = BinaryWire {
                c: frame.channel.code(),
                t: frame.kind.code_on(frame.channel)?,
                s: frame.session_id.clone(),
                d: frame.data.clone(),
            };
            Ok(Encoded::Binary(rmp_serde::to_vec_named(&wire)?))
        }
        Encoding::Text => {
            // Validate the pairing even though the text form carries names.
            frame.kind.code_on(frame.channel)?;
            let wire = TextWire {
                channel: frame.channel.as_str().to_string(),
                kind: frame.kind.as_str().to_string(),
                session_id: frame.session_id.clone(),
                data: frame.data.clone(),
            };
            Ok(Encoded::Text(serde_json::to_string(&wire)?))
        }
    }
}

pub fn decode_binary(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let wire: BinaryWire = rmp_serde::from_slice(bytes)?;
    let channel = Channel::from_code(wire.c)?;
    let kind = FrameType::from_code(channel, wire.t)?;
    Ok(Frame {
        channel,
        kind,
        session_id: wire.s,
        data: wire.d,
    })
}

pub fn decode_text(text: &str) -> Result<Frame, ProtocolError> {
    let wire: TextWire = serde_json::from_str(text)?;
    let channel = Channel::from_name(&wire.channel)?;
    let kind = FrameType::from_name(channel, &wire.kind)?;
    Ok(Frame {
        channel,
        kind,
        session_id: wire.session_id,
        data: wire.data,
    })
}
