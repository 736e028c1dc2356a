//! Error types for each layer.
//!
//! Lower layers never decide how an error reaches the browser: the WebSocket
//! layer maps these into channel `error` frames, the REST layer into JSON
//! bodies, and `main` into a non-zero exit.

use std::path::PathBuf;

use thiserror::Error;

/// A frame could not be decoded, encoded or interpreted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown channel code {0}")]
    UnknownChannel(u8),
    #[error("unknown channel {0:?}")]
    UnknownChannelName(String),
    #[error("unknown {channel} frame type code {code}")]
    UnknownType { channel: &'static str, code: u8 },
    #[error("unknown {channel} frame type {name:?}")]
    UnknownTypeName { channel: &'static str, name: String },
    #[error("{kind} frames are not valid on the {channel} channel")]
    InvalidType {
        channel: &'static str,
        kind: &'static str,
    },
    #[error("malformed binary frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("malformed text frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error("frame is missing a session id")]
    MissingSession,
}

/// A backing process could not be spawned, written or controlled.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("pty: {0}")]
    Pty(#[from] nix::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("process is no longer running")]
    Dead,
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),
    #[error("ssh key: {0}")]
    SshKey(#[from] russh_keys::Error),
    #[error("ssh authentication rejected for {0}")]
    AuthRejected(String),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
}

/// A registry operation failed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session limit reached ({0})")]
    LimitReached(usize),
    #[error("invalid session context: {0}")]
    InvalidContext(String),
    #[error("unknown remote host {0}")]
    UnknownHost(String),
    #[error("session {0} is closing")]
    Closing(String),
    #[error("session {id} is a {actual} session, not {expected}")]
    WrongKind {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The metadata store failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("store record is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// The configuration file could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
