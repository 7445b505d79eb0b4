//! Configuration system for the `MatchChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/matchchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use matchchat_proto::api::MAX_PAGE_SIZE;
use matchchat_proto::message::{MAX_BODY_SIZE, PeerId};

use crate::chat::ChatConfig;
use crate::transport::manager::{ManagerConfig, ReconnectPolicy};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A configured URL is not valid.
    #[error("invalid {field}: {source}")]
    InvalidUrl {
        /// Which setting.
        field: &'static str,
        /// Parse failure.
        source: url::ParseError,
    },

    /// A setting required to connect is missing.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    chat: ChatFileConfig,
    presence: PresenceFileConfig,
    reconnect: ReconnectFileConfig,
    ui: UiFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    push_url: Option<String>,
    api_url: Option<String>,
    self_id: Option<String>,
    peer_id: Option<String>,
    connect_timeout_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    send_timeout_ms: Option<u64>,
    history_timeout_ms: Option<u64>,
    page_size: Option<usize>,
    max_body_size: Option<usize>,
    resync_on_reconnect: Option<bool>,
    event_buffer: Option<usize>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    typing_debounce_ms: Option<u64>,
    typing_expiry_ms: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    jitter: Option<bool>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
    top_threshold_px: Option<f64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// WebSocket URL of the push channel.
    pub push_url: Url,
    /// Base URL of the request/response API.
    pub api_url: Url,
    /// The local user.
    pub self_id: PeerId,
    /// The matched user to chat with.
    pub peer_id: PeerId,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    // -- Server --
    /// Push channel WebSocket URL.
    pub push_url: Option<String>,
    /// Request/response API base URL.
    pub api_url: Option<String>,
    /// Local user id.
    pub self_id: Option<String>,
    /// Matched user id.
    pub peer_id: Option<String>,
    /// Timeout for opening the push channel.
    pub connect_timeout: Duration,

    // -- Chat --
    /// How long a send may wait for confirmation.
    pub send_timeout: Duration,
    /// How long a history fetch may take.
    pub history_timeout: Duration,
    /// Items per history page.
    pub page_size: usize,
    /// Maximum message body size in bytes.
    pub max_body_size: usize,
    /// Page in whatever arrived while disconnected after every reconnect.
    pub resync_on_reconnect: bool,
    /// Buffer size for the engine event channel.
    pub event_buffer: usize,

    // -- Presence --
    /// Outbound typing debounce window.
    pub typing_debounce: Duration,
    /// Inbound typing indicator lifetime.
    pub typing_expiry: Duration,

    // -- Reconnect --
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
    /// Distance from the top that triggers loading older history.
    pub top_threshold: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            push_url: None,
            api_url: None,
            self_id: None,
            peer_id: None,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            history_timeout: Duration::from_secs(15),
            page_size: 30,
            max_body_size: MAX_BODY_SIZE,
            resync_on_reconnect: true,
            event_buffer: 64,
            typing_debounce: Duration::from_millis(800),
            typing_expiry: Duration::from_millis(1200),
            reconnect: ReconnectPolicy::default(),
            timestamp_format: "%H:%M".to_string(),
            top_threshold: 200.0,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/matchchat/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let ms = Duration::from_millis;

        Self {
            push_url: cli
                .push_url
                .clone()
                .or_else(|| file.server.push_url.clone()),
            api_url: cli.api_url.clone().or_else(|| file.server.api_url.clone()),
            self_id: cli.self_id.clone().or_else(|| file.server.self_id.clone()),
            peer_id: cli.peer_id.clone().or_else(|| file.server.peer_id.clone()),
            connect_timeout: file
                .server
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            send_timeout: file.chat.send_timeout_ms.map_or(defaults.send_timeout, ms),
            history_timeout: file
                .chat
                .history_timeout_ms
                .map_or(defaults.history_timeout, ms),
            page_size: file
                .chat
                .page_size
                .map_or(defaults.page_size, clamp_page_size),
            max_body_size: file.chat.max_body_size.unwrap_or(defaults.max_body_size),
            resync_on_reconnect: file
                .chat
                .resync_on_reconnect
                .unwrap_or(defaults.resync_on_reconnect),
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            typing_debounce: file
                .presence
                .typing_debounce_ms
                .map_or(defaults.typing_debounce, ms),
            typing_expiry: file
                .presence
                .typing_expiry_ms
                .map_or(defaults.typing_expiry, ms),
            reconnect: ReconnectPolicy {
                initial: file
                    .reconnect
                    .initial_backoff_ms
                    .map_or(defaults.reconnect.initial, ms),
                max: file
                    .reconnect
                    .max_backoff_ms
                    .map_or(defaults.reconnect.max, ms),
                jitter: file.reconnect.jitter.unwrap_or(defaults.reconnect.jitter),
            },
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
            top_threshold: file.ui.top_threshold_px.unwrap_or(defaults.top_threshold),
        }
    }

    /// Parse the connection settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if a setting is absent and
    /// [`ConfigError::InvalidUrl`] if a URL does not parse.
    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        let parse = |field: &'static str, value: Option<&String>| {
            let value = value.ok_or(ConfigError::Missing(field))?;
            Url::parse(value).map_err(|source| ConfigError::InvalidUrl { field, source })
        };
        let id = |field: &'static str, value: Option<&String>| {
            value
                .filter(|v| !v.is_empty())
                .map(|v| PeerId::new(v.clone()))
                .ok_or(ConfigError::Missing(field))
        };
        Ok(Endpoints {
            push_url: parse("push_url", self.push_url.as_ref())?,
            api_url: parse("api_url", self.api_url.as_ref())?,
            self_id: id("self_id", self.self_id.as_ref())?,
            peer_id: id("peer_id", self.peer_id.as_ref())?,
        })
    }

    /// Engine settings.
    #[must_use]
    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            max_body_size: self.max_body_size,
            page_size: self.page_size,
            resync_on_reconnect: self.resync_on_reconnect,
            typing_debounce: self.typing_debounce,
            typing_expiry: self.typing_expiry,
            top_threshold: self.top_threshold,
            event_buffer: self.event_buffer,
        }
    }

    /// Transport settings.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            send_timeout: self.send_timeout,
            history_timeout: self.history_timeout,
            reconnect: self.reconnect.clone(),
            ..ManagerConfig::default()
        }
    }
}

/// Keep a configured page size within what the server will serve.
fn clamp_page_size(requested: usize) -> usize {
    let clamped = requested.clamp(1, MAX_PAGE_SIZE);
    if clamped != requested {
        tracing::warn!(requested, clamped, "page_size out of range, clamped");
    }
    clamped
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Terminal client for one-to-one matched chat")]
pub struct CliArgs {
    /// WebSocket URL of the push channel.
    #[arg(long, env = "MATCHCHAT_PUSH_URL")]
    pub push_url: Option<String>,

    /// Base URL of the HTTP API.
    #[arg(long, env = "MATCHCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "MATCHCHAT_SELF_ID")]
    pub self_id: Option<String>,

    /// The matched user to chat with.
    #[arg(long, env = "MATCHCHAT_PEER_ID")]
    pub peer_id: Option<String>,

    /// Path to config file (default: `~/.config/matchchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MATCHCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/matchchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("matchchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
