//! Configuration management for shellmux.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::known_hosts::HostKeyPolicy;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("read_chunk_size must be between 1 and {MAX_READ_CHUNK_SIZE}, got {0}")]
    InvalidReadChunkSize(usize),

    #[error("idle_poll_ms must be greater than 0")]
    InvalidIdlePoll,

    #[error("poll_interval_ms must be greater than 0")]
    InvalidPollInterval,

    #[error("poll_attempts must be greater than 0")]
    InvalidPollAttempts,

    #[error("terminal size must be at least 1x1, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound on a single dispatcher read.
pub const MAX_READ_CHUNK_SIZE: usize = 1024 * 1024;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Log output.
    pub logging: LoggingConfig,

    /// Session limits and housekeeping.
    pub session: SessionConfig,

    /// Readiness dispatcher tuning.
    pub dispatcher: DispatcherConfig,

    /// Connect handshake budget.
    pub handshake: HandshakeConfig,

    /// SSH defaults.
    pub ssh: SshConfig,

    /// Local shell defaults.
    pub pty: PtyConfig,

    /// Terminal emulation defaults.
    pub terminal: TerminalConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// How often finished sessions are swept, in seconds (0 disables).
    pub cleanup_interval_secs: u64,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long an idle dispatcher sleeps between checks, in milliseconds.
    pub idle_poll_ms: u64,

    /// Maximum bytes read from one session per readiness event.
    pub read_chunk_size: usize,

    /// Pause after a failed readiness wait, in milliseconds.
    pub select_backoff_ms: u64,
}

/// Handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Length of one readiness poll, in milliseconds.
    pub poll_interval_ms: u64,

    /// Number of polls before the handshake fails.
    pub poll_attempts: u32,
}

/// SSH configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// Default port.
    pub port: u16,

    /// Default user name; falls back to `$USER`.
    pub username: Option<String>,

    /// Terminal type requested for the remote pty.
    pub term: String,

    /// What to do with unknown or changed host keys.
    pub host_key_policy: HostKeyPolicy,

    /// Known hosts file; defaults to `~/.config/shellmux/known_hosts.json`.
    pub known_hosts_path: Option<PathBuf>,

    /// Keepalive interval in seconds (0 disables).
    pub keepalive_secs: u64,
}

/// Local shell configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PtyConfig {
    /// Shell to spawn for local sessions.
    pub shell: String,

    /// `TERM` exported to the shell.
    pub term: String,
}

/// Terminal emulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Lines kept after they scroll off the screen.
    pub scrollback: usize,

    /// Default width for new sessions.
    pub cols: u16,

    /// Default height for new sessions.
    pub rows: u16,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 1000,
            read_chunk_size: 1024,
            select_backoff_ms: 50,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            poll_attempts: 60,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: 22,
            username: None,
            term: "xterm-256color".to_string(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_path: None,
            keepalive_secs: 30,
        }
    }
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            term: "xterm-256color".to_string(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            scrollback: emulator::DEFAULT_SCROLLBACK,
            cols: 80,
            rows: 24,
        }
    }
}

impl DispatcherConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn select_backoff(&self) -> Duration {
        Duration::from_millis(self.select_backoff_ms)
    }
}

impl HandshakeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Total time the handshake may wait for the shell.
    pub fn budget(&self) -> Duration {
        self.poll_interval() * self.poll_attempts
    }
}

impl SshConfig {
    /// Resolves the user name, falling back to `$USER` and then `root`.
    pub fn resolve_username(&self, explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| self.username.clone())
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .unwrap_or_else(|| "root".to_string())
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.known_hosts_path
            .clone()
            .unwrap_or_else(crate::known_hosts::default_known_hosts_path)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellmux")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHELLMUX_SHELL: Override the local shell
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SHELLMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(shell) = std::env::var("SHELLMUX_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.pty.shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        let chunk = self.dispatcher.read_chunk_size;
        if chunk == 0 || chunk > MAX_READ_CHUNK_SIZE {
            return Err(ConfigError::InvalidReadChunkSize(chunk));
        }

        if self.dispatcher.idle_poll_ms == 0 {
            return Err(ConfigError::InvalidIdlePoll);
        }

        if self.handshake.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        if self.handshake.poll_attempts == 0 {
            return Err(ConfigError::InvalidPollAttempts);
        }

        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.terminal.cols,
                rows: self.terminal.rows,
            });
        }

        let shell_path = Path::new(&self.pty.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.pty.shell.clone()));
            }
        } else if which::which(&self.pty.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.pty.shell.clone()));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert_eq!(config.session.max_sessions, 64);
        assert_eq!(config.dispatcher.idle_poll_ms, 1000);
        assert_eq!(config.dispatcher.read_chunk_size, 1024);
        assert_eq!(config.dispatcher.select_backoff_ms, 50);
        assert_eq!(config.handshake.poll_interval_ms, 1000);
        assert_eq!(config.handshake.poll_attempts, 60);
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::TrustFirstUse);
        assert_eq!(config.terminal.cols, 80);
        assert_eq!(config.terminal.rows, 24);
        assert_eq!(config.terminal.scrollback, emulator::DEFAULT_SCROLLBACK);
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.dispatcher.idle_poll(), Duration::from_secs(1));
        assert_eq!(config.dispatcher.select_backoff(), Duration::from_millis(50));
        assert_eq!(config.handshake.budget(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[dispatcher]
read_chunk_size = 4096

[ssh]
host_key_policy = "strict"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.dispatcher.read_chunk_size, 4096);
        assert_eq!(config.dispatcher.idle_poll_ms, 1000);
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.ssh.port, 22);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[logging]
level = "debug"
file = "/tmp/shellmux.log"

[session]
max_sessions = 8
cleanup_interval_secs = 0

[dispatcher]
idle_poll_ms = 250
read_chunk_size = 2048
select_backoff_ms = 10

[handshake]
poll_interval_ms = 100
poll_attempts = 5

[ssh]
port = 2222
username = "deploy"
term = "vt100"
host_key_policy = "accept-any"
known_hosts_path = "/tmp/known_hosts.json"
keepalive_secs = 0

[pty]
shell = "/bin/sh"
term = "xterm"

[terminal]
scrollback = 100
cols = 132
rows = 50
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/shellmux.log")));
        assert_eq!(config.session.max_sessions, 8);
        assert_eq!(config.dispatcher.idle_poll_ms, 250);
        assert_eq!(config.handshake.poll_attempts, 5);
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.username.as_deref(), Some("deploy"));
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::AcceptAny);
        assert!(config.ssh.keepalive().is_none());
        assert_eq!(
            config.ssh.known_hosts_path(),
            PathBuf::from("/tmp/known_hosts.json")
        );
        assert_eq!(config.pty.shell, "/bin/sh");
        assert_eq!(config.terminal.cols, 132);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[dispatcher\nread_chunk_size = 1");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[handshake]\npoll_attempts = \"many\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let result = Config::from_toml("[ssh]\nhost_key_policy = \"yolo\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.ssh.port = 2200;
        config.ssh.host_key_policy = HostKeyPolicy::Strict;
        config.dispatcher.read_chunk_size = 512;

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/shellmux/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.session.max_sessions = 3;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.session.max_sessions, 3);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "this is not toml [").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("shellmux/config.toml"));
    }

    #[test]
    fn test_resolve_username() {
        let mut ssh = SshConfig::default();
        assert_eq!(ssh.resolve_username(Some("alice")), "alice");

        ssh.username = Some("deploy".to_string());
        assert_eq!(ssh.resolve_username(None), "deploy");
        assert_eq!(ssh.resolve_username(Some("alice")), "alice");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("SHELLMUX_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "trace");

        std::env::remove_var("SHELLMUX_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SHELLMUX_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "info");

        std::env::remove_var("SHELLMUX_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_shell() {
        std::env::remove_var("SHELLMUX_LOG_LEVEL");
        std::env::set_var("SHELLMUX_SHELL", "/bin/sh");

        let mut config = Config::default();
        config.pty.shell = "/bin/zsh".to_string();
        config.apply_env_overrides();
        assert_eq!(config.pty.shell, "/bin/sh");

        std::env::remove_var("SHELLMUX_SHELL");
    }

    #[test]
    fn test_validate_default_config() {
        let mut config = Config::default();
        config.pty.shell = "/bin/sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = Config::default();
        config.pty.shell = "/bin/sh".to_string();

        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_dispatcher() {
        let mut config = Config::default();
        config.pty.shell = "/bin/sh".to_string();

        config.dispatcher.read_chunk_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadChunkSize(0)));

        config.dispatcher.read_chunk_size = MAX_READ_CHUNK_SIZE + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReadChunkSize(_))
        ));

        config.dispatcher.read_chunk_size = 1024;
        config.dispatcher.idle_poll_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidIdlePoll));
    }

    #[test]
    fn test_validate_handshake() {
        let mut config = Config::default();
        config.pty.shell = "/bin/sh".to_string();

        config.handshake.poll_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollAttempts));

        config.handshake.poll_attempts = 1;
        config.handshake.poll_interval_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval));
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = Config::default();
        config.pty.shell = "/bin/sh".to_string();
        config.terminal.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_shell_path_absolute_not_exists() {
        let mut config = Config::default();
        config.pty.shell = "/nonexistent/path/to/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_path_in_path() {
        let mut config = Config::default();
        config.pty.shell = "sh".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.pty.shell = "/bin/sh".to_string();

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
