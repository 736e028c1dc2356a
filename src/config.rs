//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AGENTMUX_API_KEY`, `AGENTMUX_LISTEN`,
//!    `AGENTMUX_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `agentmux.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:7681"
//! max_sessions = 32
//! data_dir = "~/.local/share/agentmux"
//! auth_timeout_secs = 10
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [terminal]
//! shell = "/bin/bash"
//! command = "claude"            # empty = plain login shell
//! working_dir = "~"
//! exit_input = "/exit\r"
//! shutdown_marker = "Goodbye!"
//! history_bytes = 262144
//! idle_grace_secs = 86400
//!
//! [chat]
//! command = "claude"
//! max_line_bytes = 10485760
//! queue_capacity = 1000
//! turn_timeout_secs = 300
//!
//! [remote]
//! connect_timeout_secs = 15
//! idle_grace_secs = 300
//!
//! [lifecycle]
//! polite_timeout_ms = 10000
//! term_timeout_ms = 3000
//! reap_interval_secs = 60
//!
//! [output]
//! flush_interval_ms = 20
//! flush_threshold_bytes = 4096
//! queue_capacity = 1024
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:7681`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum live sessions across all kinds (default 32).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Directory for chat logs and session metadata.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Seconds a fresh connection has to authenticate before it is dropped.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Shared token. Override with `AGENTMUX_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Terminal (PTY) sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Login shell used to run `command` (default `$SHELL`, then `/bin/sh`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Agent command line run inside the shell. Empty runs a plain login shell.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Working directory used when a connect request names none or an invalid one.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Input written to ask the agent to quit before any signal is sent.
    #[serde(default = "default_exit_input")]
    pub exit_input: String,
    /// Output text announcing a voluntary shutdown. Empty disables detection.
    #[serde(default = "default_shutdown_marker")]
    pub shutdown_marker: String,
    /// Replay history cap per session, in bytes.
    #[serde(default = "default_history_bytes")]
    pub history_bytes: usize,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Seconds a viewerless terminal is kept alive.
    #[serde(default = "default_long_grace_secs")]
    pub idle_grace_secs: u64,
}

/// Structured agent chat sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Agent binary.
    #[serde(default = "default_chat_command")]
    pub command: String,
    /// Arguments selecting the line-delimited JSON stream mode.
    #[serde(default = "default_chat_args")]
    pub args: Vec<String>,
    /// Flag followed by the session id when starting a new conversation.
    #[serde(default = "default_new_session_flag")]
    pub new_session_flag: String,
    /// Flag followed by the session id when resuming a logged conversation.
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    /// Longest accepted stdout line. Longer lines are discarded.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Inbound record queue between the reader and the session pump.
    #[serde(default = "default_chat_queue")]
    pub queue_capacity: usize,
    /// Seconds without agent output before a turn is reported unresponsive.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// Conversation records replayed to a new viewer.
    #[serde(default = "default_chat_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_long_grace_secs")]
    pub idle_grace_secs: u64,
}

/// Remote shells over SSH.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_remote_grace_secs")]
    pub idle_grace_secs: u64,
    /// `TERM` requested for the remote PTY.
    #[serde(default = "default_term")]
    pub term: String,
}

/// Graceful termination and reaping.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// How long a polite exit request is given before SIGTERM.
    #[serde(default = "default_polite_timeout_ms")]
    pub polite_timeout_ms: u64,
    /// How long SIGTERM is given before SIGKILL.
    #[serde(default = "default_term_timeout_ms")]
    pub term_timeout_ms: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

/// Output coalescing and per-viewer delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_threshold_bytes")]
    pub flush_threshold_bytes: usize,
    /// Frames buffered per (connection, session) before new ones are dropped.
    #[serde(default = "default_output_queue")]
    pub queue_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:7681".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_data_dir() -> String {
    "~/.local/share/agentmux".to_string()
}
fn default_auth_timeout_secs() -> u64 {
    10
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
fn default_agent_command() -> String {
    "claude".to_string()
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_exit_input() -> String {
    "/exit\r".to_string()
}
fn default_shutdown_marker() -> String {
    String::new()
}
fn default_history_bytes() -> usize {
    256 * 1024
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_long_grace_secs() -> u64 {
    24 * 60 * 60
}
fn default_chat_command() -> String {
    "claude".to_string()
}
fn default_chat_args() -> Vec<String> {
    [
        "-p",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
        "--include-partial-messages",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
fn default_new_session_flag() -> String {
    "--session-id".to_string()
}
fn default_resume_flag() -> String {
    "--resume".to_string()
}
fn default_max_line_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}
fn default_chat_queue() -> usize {
    1000
}
fn default_turn_timeout_secs() -> u64 {
    300
}
fn default_chat_history_limit() -> usize {
    500
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_remote_grace_secs() -> u64 {
    5 * 60
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_polite_timeout_ms() -> u64 {
    10_000
}
fn default_term_timeout_ms() -> u64 {
    3_000
}
fn default_reap_interval_secs() -> u64 {
    60
}
fn default_flush_interval_ms() -> u64 {
    20
}
fn default_flush_threshold_bytes() -> usize {
    4096
}
fn default_output_queue() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            data_dir: default_data_dir(),
            auth_timeout_secs: default_auth_timeout_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            command: default_agent_command(),
            working_dir: default_working_dir(),
            exit_input: default_exit_input(),
            shutdown_marker: default_shutdown_marker(),
            history_bytes: default_history_bytes(),
            rows: default_rows(),
            cols: default_cols(),
            idle_grace_secs: default_long_grace_secs(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            command: default_chat_command(),
            args: default_chat_args(),
            new_session_flag: default_new_session_flag(),
            resume_flag: default_resume_flag(),
            max_line_bytes: default_max_line_bytes(),
            queue_capacity: default_chat_queue(),
            turn_timeout_secs: default_turn_timeout_secs(),
            history_limit: default_chat_history_limit(),
            idle_grace_secs: default_long_grace_secs(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_grace_secs: default_remote_grace_secs(),
            term: default_term(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            polite_timeout_ms: default_polite_timeout_ms(),
            term_timeout_ms: default_term_timeout_ms(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            flush_threshold_bytes: default_flush_threshold_bytes(),
            queue_capacity: default_output_queue(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LifecycleConfig {
    pub fn polite_timeout(&self) -> Duration {
        Duration::from_millis(self.polite_timeout_ms)
    }

    pub fn term_timeout(&self) -> Duration {
        Duration::from_millis(self.term_timeout_ms)
    }
}

impl OutputConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks
    /// for `agentmux.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("agentmux.toml").exists() => {
                Self::from_file(Path::new("agentmux.toml"))?
            }
            None => Self::default(),
        };

        // Env var overrides
        if let Ok(key) = std::env::var("AGENTMUX_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("AGENTMUX_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("AGENTMUX_DATA_DIR") {
            config.server.data_dir = dir;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(crate::util::expand_tilde(&self.server.data_dir).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.chat.queue_capacity, 1000);
        assert_eq!(config.chat.max_line_bytes, 10 * 1024 * 1024);
        assert_eq!(config.terminal.idle_grace_secs, 86_400);
        assert_eq!(config.remote.idle_grace_secs, 300);
        assert_eq!(config.lifecycle.polite_timeout_ms, 10_000);
        assert_eq!(config.terminal.exit_input, "/exit\r");
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            "[output]\nflush_interval_ms = 5\n[terminal]\ncommand = \"\"\n",
        )
        .unwrap();
        assert_eq!(config.output.flush_interval_ms, 5);
        assert_eq!(config.output.flush_threshold_bytes, 4096);
        assert!(config.terminal.command.is_empty());
        assert_eq!(config.terminal.rows, 24);
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let err = Config::load(Some("/nonexistent/agentmux.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nlisten = 1").unwrap();
        let err = Config::load(path.to_str()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
