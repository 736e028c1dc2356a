//! Translation of agent stream records into chat frames.
//!
//! The agent emits one JSON record per line:
//!
//! | record `type`   | frames                                                     |
//! |-----------------|------------------------------------------------------------|
//! | `system`        | none (init captures the agent's own session id)            |
//! | `stream_event`  | `stream`, `thinking`, or `tool_call` once a block closes   |
//! | `assistant`     | `assistant`, plus `tool_call` for blocks not yet streamed  |
//! | `user`          | `tool_result` per tool_result block                        |
//! | `result`        | `result`, ends the turn                                    |
//!
//! Tool calls are assembled from `content_block_start` (id and name),
//! `input_json_delta` fragments, and `content_block_stop`. Fragments that do
//! not parse as JSON are delivered as `{"raw": "<fragments>"}`.

pub mod log;

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use tracing::debug;

use crate::protocol::FrameType;

/// Frames produced by one record.
#[derive(Debug, Default)]
pub struct Translation {
    pub frames: Vec<(FrameType, Value)>,
    /// The record belongs in the replayed conversation.
    pub conversational: bool,
    /// The record completes the current turn.
    pub ends_turn: bool,
}

#[derive(Debug)]
struct PendingToolCall {
    id: String,
    name: String,
    input: String,
}

#[derive(Debug, Default)]
pub struct ChatTranslator {
    pending: HashMap<u64, PendingToolCall>,
    /// Tool-use ids already delivered through streaming in this turn.
    emitted: HashSet<String>,
    agent_session_id: Option<String>,
}

impl ChatTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session id the agent reported in its init record.
    pub fn agent_session_id(&self) -> Option<&str> {
        self.agent_session_id.as_deref()
    }

    pub fn translate(&mut self, record: &Value) -> Translation {
        let mut out = Translation::default();
        match record["type"].as_str().unwrap_or_default() {
            "system" => {
                if record["subtype"] == "init" {
                    if let Some(id) = record["session_id"].as_str() {
                        debug!("agent session {id} initialized");
                        self.agent_session_id = Some(id.to_string());
                    }
                }
            }
            "stream_event" => self.stream_event(&record["event"], &mut out),
            "assistant" => {
                out.conversational = true;
                out.frames.push((
                    FrameType::Assistant,
                    json!({ "message": record["message"] }),
                ));
                for block in content_blocks(record) {
                    if block["type"] != "tool_use" {
                        continue;
                    }
                    let id = block["id"].as_str().unwrap_or_default();
                    if self.emitted.contains(id) {
                        continue;
                    }
                    self.emitted.insert(id.to_string());
                    out.frames.push((
                        FrameType::ToolCall,
                        json!({ "id": id, "name": block["name"], "input": block["input"] }),
                    ));
                }
            }
            "user" => {
                out.conversational = true;
                for block in content_blocks(record) {
                    if block["type"] == "tool_result" {
                        out.frames.push((
                            FrameType::ToolResult,
                            json!({
                                "tool_use_id": block["tool_use_id"],
                                "content": block["content"],
                                "is_error": block["is_error"].as_bool().unwrap_or(false),
                            }),
                        ));
                    }
                }
            }
            "result" => {
                out.ends_turn = true;
                out.frames.push((FrameType::Result, record.clone()));
                self.pending.clear();
                self.emitted.clear();
            }
            other => debug!("ignoring agent record type {other:?}"),
        }
        out
    }

    fn stream_event(&mut self, event: &Value, out: &mut Translation) {
        let index = event["index"].as_u64().unwrap_or_default();
        match event["type"].as_str().unwrap_or_default() {
            "content_block_start" => {
                let block = &event["content_block"];
                if block["type"] == "tool_use" {
                    self.pending.insert(
                        index,
                        PendingToolCall {
                            id: block["id"].as_str().unwrap_or_default().to_string(),
                            name: block["name"].as_str().unwrap_or_default().to_string(),
                            input: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => out
                        .frames
                        .push((FrameType::Stream, json!({ "text": delta["text"] }))),
                    "thinking_delta" => out
                        .frames
                        .push((FrameType::Thinking, json!({ "text": delta["thinking"] }))),
                    "input_json_delta" => {
                        if let Some(call) = self.pending.get_mut(&index) {
                            call.input
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(call) = self.pending.remove(&index) {
                    let input = assemble_input(&call.input);
                    self.emitted.insert(call.id.clone());
                    out.frames.push((
                        FrameType::ToolCall,
                        json!({ "id": call.id, "name": call.name, "input": input }),
                    ));
                }
            }
            _ => {}
        }
    }
}

/// Parse accumulated tool input. Empty input is an empty object.
fn assemble_input(fragments: &str) -> Value {
    if fragments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(fragments).unwrap_or_else(|_| json!({ "raw": fragments }))
}

fn content_blocks(record: &Value) -> impl Iterator<Item = &Value> {
    record["message"]["content"]
        .as_array()
        .into_iter()
        .flatten()
}

/// The stdin line that submits a user turn.
pub fn user_turn(text: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": text }],
        },
    })
}

/// Whether a logged record is part of the real conversation.
pub fn is_conversation_record(record: &Value) -> bool {
    matches!(record["type"].as_str(), Some("user" | "assistant"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(e: Value) -> Value {
        json!({ "type": "stream_event", "event": e })
    }

    #[test]
    fn test_tool_call_assembled_from_deltas() {
        let mut t = ChatTranslator::new();
        let start = t.translate(&event(json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": { "type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {} },
        })));
        assert!(start.frames.is_empty());
        for part in [r#"{"command":"#, r#""ls -la"}"#] {
            let d = t.translate(&event(json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": { "type": "input_json_delta", "partial_json": part },
            })));
            assert!(d.frames.is_empty());
        }
        let stop = t.translate(&event(json!({ "type": "content_block_stop", "index": 1 })));
        assert_eq!(stop.frames.len(), 1);
        let (kind, data) = &stop.frames[0];
        assert_eq!(*kind, FrameType::ToolCall);
        assert_eq!(data["id"], "toolu_1");
        assert_eq!(data["name"], "Bash");
        assert_eq!(data["input"], json!({ "command": "ls -la" }));
    }

    #[test]
    fn test_invalid_tool_input_falls_back_to_raw() {
        let mut t = ChatTranslator::new();
        t.translate(&event(json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "tool_use", "id": "toolu_2", "name": "Edit" },
        })));
        t.translate(&event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "input_json_delta", "partial_json": "{\"path\": \"a" },
        })));
        let stop = t.translate(&event(json!({ "type": "content_block_stop", "index": 0 })));
        assert_eq!(stop.frames[0].1["input"], json!({ "raw": "{\"path\": \"a" }));
    }

    #[test]
    fn test_assistant_skips_already_streamed_tool_calls() {
        let mut t = ChatTranslator::new();
        t.translate(&event(json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "tool_use", "id": "toolu_3", "name": "Read" },
        })));
        t.translate(&event(json!({ "type": "content_block_stop", "index": 0 })));
        let assistant = t.translate(&json!({
            "type": "assistant",
            "message": { "content": [
                { "type": "tool_use", "id": "toolu_3", "name": "Read", "input": {} },
                { "type": "tool_use", "id": "toolu_4", "name": "Grep", "input": { "q": "x" } },
            ]},
        }));
        assert!(assistant.conversational);
        let kinds: Vec<_> = assistant.frames.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![FrameType::Assistant, FrameType::ToolCall]);
        assert_eq!(assistant.frames[1].1["id"], "toolu_4");
    }

    #[test]
    fn test_text_thinking_and_results() {
        let mut t = ChatTranslator::new();
        let text = t.translate(&event(json!({
            "type": "content_block_delta", "index": 0,
            "delta": { "type": "text_delta", "text": "Hel" },
        })));
        assert_eq!(text.frames, vec![(FrameType::Stream, json!({ "text": "Hel" }))]);
        let thinking = t.translate(&event(json!({
            "type": "content_block_delta", "index": 0,
            "delta": { "type": "thinking_delta", "thinking": "hmm" },
        })));
        assert_eq!(thinking.frames[0].0, FrameType::Thinking);

        let user = t.translate(&json!({
            "type": "user",
            "message": { "content": [{ "type": "tool_result", "tool_use_id": "toolu_3", "content": "ok" }] },
        }));
        assert_eq!(user.frames[0].0, FrameType::ToolResult);
        assert_eq!(user.frames[0].1["is_error"], false);

        let result = t.translate(&json!({ "type": "result", "subtype": "success" }));
        assert!(result.ends_turn);
        assert!(!result.conversational);
        assert_eq!(result.frames[0].0, FrameType::Result);
    }

    #[test]
    fn test_system_init_captured_without_frames() {
        let mut t = ChatTranslator::new();
        let out = t.translate(&json!({ "type": "system", "subtype": "init", "session_id": "abc" }));
        assert!(out.frames.is_empty());
        assert_eq!(t.agent_session_id(), Some("abc"));
    }

    #[test]
    fn test_user_turn_shape() {
        let turn = user_turn("hi");
        assert!(is_conversation_record(&turn));
        assert_eq!(turn["message"]["content"][0]["text"], "hi");
        assert!(!is_conversation_record(&json!({ "type": "result" })));
    }
}
