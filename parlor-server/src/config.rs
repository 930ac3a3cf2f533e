//! Configuration system for the Parlor server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/parlor/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use parlor::history::DEFAULT_HISTORY_LEN;
use parlor::room::RoomConfig;
use parlor::user::Delivery;

/// Errors that can occur when loading server configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    room: RoomFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    motd_file: Option<PathBuf>,
    whitelist_file: Option<PathBuf>,
    ops_file: Option<PathBuf>,
    passphrase: Option<String>,
    log_file: Option<PathBuf>,
    chat_log: Option<PathBuf>,
}

/// `[room]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RoomFileConfig {
    history_len: Option<usize>,
    room_queue: Option<usize>,
    user_queue: Option<usize>,
    send_timeout_secs: Option<u64>,
    theme: Option<String>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Parlor chat server")]
pub struct CliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "PARLOR_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/parlor/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// File whose contents are shown to users on join.
    #[arg(long)]
    pub motd: Option<PathBuf>,

    /// Authorized-keys file of whitelisted keys. Enables whitelist mode.
    #[arg(long)]
    pub whitelist: Option<PathBuf>,

    /// Authorized-keys file of operator keys.
    #[arg(long)]
    pub admin: Option<PathBuf>,

    /// Passphrase clients must give before joining.
    #[arg(long, env = "PARLOR_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Number of messages replayed to joining users.
    #[arg(long)]
    pub history_len: Option<usize>,

    /// Capacity of the room's broadcast queue.
    #[arg(long)]
    pub room_queue: Option<usize>,

    /// Capacity of each user's delivery queue.
    #[arg(long)]
    pub user_queue: Option<usize>,

    /// Seconds a user's queue may stay full before the user is dropped.
    #[arg(long)]
    pub send_timeout_secs: Option<u64>,

    /// Theme new users start with (colors, mono, hacker).
    #[arg(long)]
    pub theme: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PARLOR_LOG")]
    pub log_level: String,

    /// Write diagnostics to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Append the public chat transcript to this file.
    #[arg(long)]
    pub chat_log: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:2022`).
    pub bind_addr: String,
    /// MOTD file, if any.
    pub motd_file: Option<PathBuf>,
    /// Whitelist key file, if any.
    pub whitelist_file: Option<PathBuf>,
    /// Operator key file, if any.
    pub ops_file: Option<PathBuf>,
    /// Join passphrase, if any.
    pub passphrase: Option<String>,
    /// Messages kept for replay.
    pub history_len: usize,
    /// Broadcast queue capacity.
    pub room_queue: usize,
    /// Per-user delivery queue capacity.
    pub user_queue: usize,
    /// Delivery timeout in seconds.
    pub send_timeout_secs: u64,
    /// Default theme name.
    pub theme: String,
    /// Log level filter string.
    pub log_level: String,
    /// Diagnostics log file, if any.
    pub log_file: Option<PathBuf>,
    /// Chat transcript file, if any.
    pub chat_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2022".to_string(),
            motd_file: None,
            whitelist_file: None,
            ops_file: None,
            passphrase: None,
            history_len: DEFAULT_HISTORY_LEN,
            room_queue: 10,
            user_queue: 5,
            send_timeout_secs: 5,
            theme: "colors".to_string(),
            log_level: "info".to_string(),
            log_file: None,
            chat_log: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let server = &file.server;
        let room = &file.room;

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            motd_file: cli.motd.clone().or_else(|| server.motd_file.clone()),
            whitelist_file: cli
                .whitelist
                .clone()
                .or_else(|| server.whitelist_file.clone()),
            ops_file: cli.admin.clone().or_else(|| server.ops_file.clone()),
            passphrase: cli
                .passphrase
                .clone()
                .or_else(|| server.passphrase.clone())
                .filter(|p| !p.is_empty()),
            history_len: cli
                .history_len
                .or(room.history_len)
                .unwrap_or(defaults.history_len),
            room_queue: cli
                .room_queue
                .or(room.room_queue)
                .unwrap_or(defaults.room_queue),
            user_queue: cli
                .user_queue
                .or(room.user_queue)
                .unwrap_or(defaults.user_queue),
            send_timeout_secs: cli
                .send_timeout_secs
                .or(room.send_timeout_secs)
                .unwrap_or(defaults.send_timeout_secs),
            theme: cli
                .theme
                .clone()
                .or_else(|| room.theme.clone())
                .unwrap_or(defaults.theme),
            log_level: cli.log_level.clone(),
            log_file: cli.log_file.clone().or_else(|| server.log_file.clone()),
            chat_log: cli.chat_log.clone().or_else(|| server.chat_log.clone()),
        }
    }

    /// Room sizing derived from this configuration.
    #[must_use]
    pub const fn room_config(&self) -> RoomConfig {
        RoomConfig {
            history_len: self.history_len,
            queue_len: self.room_queue,
        }
    }

    /// Per-user delivery settings derived from this configuration. The
    /// backlog always has room for a full history replay.
    #[must_use]
    pub fn delivery(&self) -> Delivery {
        Delivery {
            queue: self.user_queue,
            timeout: Duration::from_secs(self.send_timeout_secs),
            backlog: Delivery::default().backlog.max(self.history_len),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
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
        config_dir.join("parlor").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
