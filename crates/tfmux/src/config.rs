use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tfmux_protocol::TerminalSettings;
use thiserror::Error;
use tokio::fs;

use crate::process::RegistryConfig;
use crate::process::supervisor::SupervisorConfig;
use crate::signal::{Signal, SignalParseError};

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub process: ProcessConfig,
}

impl Config {
    /// Load from a YAML file. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terminal.reconnect_seconds == 0 {
            return Err(ConfigError::InvalidReconnect);
        }
        Signal::parse(&self.terminal.termination_signal)?;
        if let Some(credential) = &self.terminal.credential
            && !credential.contains(':')
        {
            return Err(ConfigError::InvalidCredential);
        }
        if let Some(index) = &self.terminal.index {
            match std::fs::metadata(index) {
                Ok(meta) if meta.is_dir() => {
                    return Err(ConfigError::IndexIsDirectory(index.clone()));
                }
                Ok(_) => {}
                Err(_) => return Err(ConfigError::IndexNotFound(index.clone())),
            }
        }
        if self.process.buffer_capacity == 0 {
            return Err(ConfigError::ZeroBufferCapacity);
        }
        Ok(())
    }

    /// The read-only settings exposed to clients.
    pub fn terminal_settings(&self) -> Result<TerminalSettings, ConfigError> {
        let signal = Signal::parse(&self.terminal.termination_signal)?;
        let client_prefs = self
            .terminal
            .client_options
            .iter()
            .map(|(key, value)| (key.clone(), client_option_value(value)))
            .collect::<serde_json::Map<_, _>>();

        Ok(TerminalSettings {
            reconnect_seconds: self.terminal.reconnect_seconds,
            terminal_type: self.terminal.terminal_type.clone(),
            termination_signal: signal.name().to_string(),
            termination_signal_code: signal.code(),
            read_only: self.terminal.read_only,
            check_origin: self.terminal.check_origin,
            max_clients: self.terminal.max_clients,
            once: self.terminal.once,
            index: self
                .terminal
                .index
                .as_ref()
                .map(|p| p.display().to_string()),
            unix_socket_path: self
                .server
                .unix_socket
                .as_ref()
                .map(|p| p.display().to_string()),
            client_prefs: serde_json::Value::Object(client_prefs),
        })
    }

    /// Everything the process registry needs.
    pub fn registry_config(&self) -> Result<RegistryConfig, ConfigError> {
        let termination_signal = Signal::parse(&self.terminal.termination_signal)?;
        let kill_timeout = match self.process.kill_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(RegistryConfig {
            buffer_capacity: self.process.buffer_capacity,
            supervisor: SupervisorConfig {
                terminal_type: self.terminal.terminal_type.clone(),
                termination_signal,
                kill_timeout,
            },
            settings: self.terminal_settings()?,
            credential: self.encoded_credential(),
        })
    }

    /// `user:pass` encoded the way HTTP basic auth carries it.
    pub fn encoded_credential(&self) -> Option<String> {
        self.terminal
            .credential
            .as_ref()
            .map(|c| STANDARD.encode(c.as_bytes()))
    }
}

/// Parse a `key=value` client option.
pub fn parse_client_option(option: &str) -> Result<(String, String), ConfigError> {
    match option.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ConfigError::InvalidClientOption(option.to_string())),
    }
}

/// Client option values are JSON when they parse as JSON, strings otherwise.
fn client_option_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Listen on this unix socket instead of TCP.
    #[serde(default)]
    pub unix_socket: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            unix_socket: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7681
}

fn default_request_timeout() -> u64 {
    300
}

// ============================================================================
// TerminalConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_reconnect")]
    pub reconnect_seconds: u64,
    #[serde(default = "default_termination_signal")]
    pub termination_signal: String,
    #[serde(default = "default_terminal_type")]
    pub terminal_type: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub check_origin: bool,
    /// 0 for unlimited.
    #[serde(default)]
    pub max_clients: u32,
    #[serde(default)]
    pub once: bool,
    #[serde(default)]
    pub index: Option<PathBuf>,
    #[serde(default)]
    pub client_options: BTreeMap<String, String>,
    /// `user:pass` for basic auth.
    #[serde(default)]
    pub credential: Option<String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            reconnect_seconds: default_reconnect(),
            termination_signal: default_termination_signal(),
            terminal_type: default_terminal_type(),
            read_only: false,
            check_origin: false,
            max_clients: 0,
            once: false,
            index: None,
            client_options: BTreeMap::new(),
            credential: None,
        }
    }
}

fn default_reconnect() -> u64 {
    10
}

fn default_termination_signal() -> String {
    "SIGHUP".to_string()
}

fn default_terminal_type() -> String {
    "xterm-256color".to_string()
}

// ============================================================================
// ProcessConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ProcessConfig {
    /// Output bytes retained per process.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// SIGKILL a process this long after it was asked to stop. 0 disables.
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_seconds: u64,
    /// How long shutdown waits for processes before killing them.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// Commands started at boot, one argv each.
    #[serde(default)]
    pub sessions: Vec<Vec<String>>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            kill_timeout_seconds: default_kill_timeout(),
            drain_timeout_seconds: default_drain_timeout(),
            sessions: Vec::new(),
        }
    }
}

fn default_buffer_capacity() -> usize {
    64 * 1024
}

fn default_kill_timeout() -> u64 {
    10
}

fn default_drain_timeout() -> u64 {
    15
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid termination signal: {0}")]
    Signal(#[from] SignalParseError),

    #[error("reconnect timeout must be greater than zero")]
    InvalidReconnect,

    #[error("credential must be in the form user:pass")]
    InvalidCredential,

    #[error("index file not found: {}", .0.display())]
    IndexNotFound(PathBuf),

    #[error("index path is a directory: {}", .0.display())]
    IndexIsDirectory(PathBuf),

    #[error("process buffer capacity must be greater than zero")]
    ZeroBufferCapacity,

    #[error("invalid client option '{0}', expected key=value")]
    InvalidClientOption(String),
}

// ============================================================================
// Tests
// ============================================================================
