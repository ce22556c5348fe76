//! Configuration management for the termbridge server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termbridge/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default address the WebSocket server listens on.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen must be a socket address like 0.0.0.0:8080, got {0}")]
    InvalidListen(String),

    #[error("poll_interval_ms must be between 10 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("read_buffer_size must be between 512 and 65536, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("outbound_capacity must be greater than 0")]
    InvalidOutboundCapacity,

    #[error("input_capacity must be greater than 0")]
    InvalidInputCapacity,

    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("auth token entry {0} has an empty token or user")]
    InvalidTokenEntry(usize),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termbridge server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging configuration.
    pub server: ServerConfig,

    /// Shell and PTY session configuration.
    pub session: SessionConfig,

    /// Credential configuration.
    pub auth: AuthConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket listener.
    pub listen: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Shell and PTY session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell executed for every connection.
    pub shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Value of `TERM` in the shell environment.
    pub term: String,

    /// Value of `PS1` in the shell environment.
    pub prompt: String,

    /// Readiness wait bound for the PTY reader, in milliseconds.
    pub poll_interval_ms: u64,

    /// Maximum bytes read from the PTY per message.
    pub read_buffer_size: usize,

    /// Number of PTY chunks buffered per connection before the reader waits.
    pub outbound_capacity: usize,

    /// Number of client input chunks queued per session before input is dropped.
    pub input_capacity: usize,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Time a signaled shell gets to exit before it is killed, in milliseconds.
    pub kill_grace_ms: u64,
}

/// Credential configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Accept any non-empty credential and map it to `default_user`.
    ///
    /// Intended for local development only.
    pub allow_any_token: bool,

    /// User assigned to connections when `allow_any_token` is set.
    pub default_user: String,

    /// Directory under which user home directories live.
    pub home_root: PathBuf,

    /// Accepted credentials.
    pub tokens: Vec<TokenEntry>,
}

/// A single accepted credential and the user it resolves to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenEntry {
    /// The opaque credential presented by the client.
    pub token: String,

    /// Name of the user the shell runs as.
    pub user: String,

    /// Home directory override; defaults to `home_root/user`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            shell_args: vec!["--login".to_string()],
            term: "xterm-256color".to_string(),
            prompt: "\\u@\\h:\\w$ ".to_string(),
            poll_interval_ms: 100,
            read_buffer_size: 4096,
            outbound_capacity: 64,
            input_capacity: 256,
            max_sessions: 64,
            kill_grace_ms: 2000,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_any_token: false,
            default_user: "user".to_string(),
            home_root: PathBuf::from("/home"),
            tokens: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Readiness wait bound for the PTY reader.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Grace period between `SIGTERM` and `SIGKILL` during teardown.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termbridge")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMBRIDGE_LISTEN: Override the listen address
    /// - TERMBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMBRIDGE_SHELL: Override the shell executable
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("TERMBRIDGE_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen from environment: {}", listen);
                self.server.listen = listen;
            }
        }

        if let Ok(level) = std::env::var("TERMBRIDGE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("TERMBRIDGE_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.session.shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListen(self.server.listen.clone()));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        let session = &self.session;
        if !(10..=1000).contains(&session.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval(session.poll_interval_ms));
        }

        if !(512..=65536).contains(&session.read_buffer_size) {
            return Err(ConfigError::InvalidReadBufferSize(session.read_buffer_size));
        }

        if session.outbound_capacity == 0 {
            return Err(ConfigError::InvalidOutboundCapacity);
        }

        if session.input_capacity == 0 {
            return Err(ConfigError::InvalidInputCapacity);
        }

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        let shell_path = Path::new(&session.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(session.shell.clone()));
            }
        } else if which::which(&session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(session.shell.clone()));
        }

        for (index, entry) in self.auth.tokens.iter().enumerate() {
            if entry.token.is_empty() || entry.user.is_empty() {
                return Err(ConfigError::InvalidTokenEntry(index));
            }
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

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen))
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

    /// Default config pointed at a shell that exists on every test host.
    fn sh_config() -> Config {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.listen, DEFAULT_LISTEN);
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.session.shell, "/bin/bash");
        assert_eq!(config.session.shell_args, vec!["--login"]);
        assert_eq!(config.session.term, "xterm-256color");
        assert_eq!(config.session.poll_interval_ms, 100);
        assert_eq!(config.session.read_buffer_size, 4096);
        assert_eq!(config.session.input_capacity, 256);
        assert!(!config.auth.allow_any_token);
        assert!(config.auth.tokens.is_empty());
        assert_eq!(config.auth.home_root, PathBuf::from("/home"));
    }

    #[test]
    fn test_durations() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.kill_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
listen = "127.0.0.1:9000"

[session]
poll_interval_ms = 50
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.session.poll_interval_ms, 50);
        // Other values should be defaults
        assert_eq!(config.session.read_buffer_size, 4096);
        assert_eq!(config.server.log_level, "info");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[server]
listen = "127.0.0.1:7000"
log_level = "trace"

[session]
shell = "/bin/zsh"
shell_args = ["-l", "-i"]
term = "xterm"
prompt = "$ "
poll_interval_ms = 250
read_buffer_size = 8192
outbound_capacity = 16
max_sessions = 5
kill_grace_ms = 500

[auth]
allow_any_token = true
default_user = "dev"
home_root = "/srv/home"

[[auth.tokens]]
token = "s3cret"
user = "alice"

[[auth.tokens]]
token = "hunter2"
user = "bob"
home = "/opt/bob"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:7000");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.session.shell, "/bin/zsh");
        assert_eq!(config.session.shell_args, vec!["-l", "-i"]);
        assert_eq!(config.session.term, "xterm");
        assert_eq!(config.session.prompt, "$ ");
        assert_eq!(config.session.poll_interval_ms, 250);
        assert_eq!(config.session.read_buffer_size, 8192);
        assert_eq!(config.session.outbound_capacity, 16);
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.session.kill_grace_ms, 500);
        assert!(config.auth.allow_any_token);
        assert_eq!(config.auth.default_user, "dev");
        assert_eq!(config.auth.home_root, PathBuf::from("/srv/home"));
        assert_eq!(config.auth.tokens.len(), 2);
        assert_eq!(config.auth.tokens[0].user, "alice");
        assert_eq!(config.auth.tokens[0].home, None);
        assert_eq!(config.auth.tokens[1].home, Some(PathBuf::from("/opt/bob")));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nlisten = \"x\"\n");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
read_buffer_size = "large"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.server.log_level = "warn".to_string();
        original.session.max_sessions = 3;
        original.auth.tokens.push(TokenEntry {
            token: "abc".to_string(),
            user: "carol".to_string(),
            home: Some(PathBuf::from("/tmp")),
        });

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.session.poll_interval_ms = 20;
        original.save(&config_path).unwrap();

        assert!(config_path.exists());
        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("termbridge"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_validate_accepts_sh_config() {
        assert_eq!(sh_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_listen() {
        let mut config = sh_config();
        config.server.listen = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListen("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_poll_interval() {
        let mut config = sh_config();
        config.session.poll_interval_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(0)));

        config.session.poll_interval_ms = 5000;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(5000)));
    }

    #[test]
    fn test_validate_rejects_buffer_size() {
        let mut config = sh_config();
        config.session.read_buffer_size = 16;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReadBufferSize(16)));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = sh_config();
        config.session.outbound_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidOutboundCapacity));

        let mut config = sh_config();
        config.session.input_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidInputCapacity));
    }

    #[test]
    fn test_validate_rejects_max_sessions() {
        let mut config = sh_config();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));
    }

    #[test]
    fn test_validate_rejects_missing_shell() {
        let mut config = sh_config();
        config.session.shell = "/nonexistent/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );

        config.session.shell = "definitely-not-a-shell-xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_validate_rejects_log_level() {
        let mut config = sh_config();
        config.server.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_empty_token() {
        let mut config = sh_config();
        config.auth.tokens.push(TokenEntry {
            token: String::new(),
            user: "alice".to_string(),
            home: None,
        });
        assert_eq!(config.validate(), Err(ConfigError::InvalidTokenEntry(0)));
    }

    #[test]
    fn test_listen_addr() {
        let config = Config::default();
        assert_eq!(config.listen_addr().unwrap().port(), 8080);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("TERMBRIDGE_LISTEN", "127.0.0.1:1234");
        std::env::set_var("TERMBRIDGE_LOG_LEVEL", "debug");
        std::env::set_var("TERMBRIDGE_SHELL", "/bin/sh");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.listen, "127.0.0.1:1234");
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.session.shell, "/bin/sh");

        std::env::remove_var("TERMBRIDGE_LISTEN");
        std::env::remove_var("TERMBRIDGE_LOG_LEVEL");
        std::env::remove_var("TERMBRIDGE_SHELL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TERMBRIDGE_LISTEN", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.listen, DEFAULT_LISTEN);

        std::env::remove_var("TERMBRIDGE_LISTEN");
    }
}
