//! Configuration types for Prism.
//!
//! All settings live in an optional `prism.json`. Every field has a default,
//! unknown fields are ignored, and a few values can be overridden from the
//! environment so the capture side and the tutor side agree on the channel
//! without sharing a file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PrismError, Result};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "prism.json";

/// Environment variable overriding the command channel name.
pub const ENV_COMMAND_CHANNEL: &str = "PRISM_COMMAND_CHANNEL";
/// Environment variable overriding the key/value server host.
pub const ENV_REDIS_HOST: &str = "PRISM_REDIS_HOST";
/// Environment variable overriding the key/value server port.
pub const ENV_REDIS_PORT: &str = "PRISM_REDIS_PORT";

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_redis_port() -> u16 {
    6379
}

const fn default_server_port() -> u16 {
    3000
}

fn default_program() -> String {
    "redis-cli".to_string()
}

const fn default_cols() -> u16 {
    160
}

const fn default_rows() -> u16 {
    40
}

fn default_channel() -> String {
    prism_store::DEFAULT_CHANNEL.to_string()
}

fn default_namespace() -> String {
    prism_store::DEFAULT_NAMESPACE.to_string()
}

/// Default bound on the out-of-band canonical query, in milliseconds.
const fn default_formatter_timeout_ms() -> u64 {
    1000
}

/// Default parser buffer limit in bytes.
const fn default_max_parser_buffer_bytes() -> usize {
    64 * 1024
}

/// Default delay before a worked example without follow-up completes.
const fn default_auto_complete_delay_ms() -> u64 {
    4000
}

/// Smallest parser buffer limit accepted.
const MIN_PARSER_BUFFER_BYTES: usize = 1024;

/// Main configuration for Prism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Key/value server the CLI and the state store talk to.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Address the capture server listens on.
    #[serde(default)]
    pub server: ServerConfig,

    /// CLI spawned on the pseudo-terminal.
    #[serde(default)]
    pub cli: CliConfig,

    /// Pub/sub channel carrying captured commands.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Prefix of lesson metadata keys.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// How captured commands cross from capture to tutor.
    #[serde(default)]
    pub transport: Transport,

    /// Bound on the canonical output re-query, in milliseconds.
    #[serde(default = "default_formatter_timeout_ms")]
    pub formatter_timeout_ms: u64,

    /// Parser buffer size at which stale output is evicted.
    #[serde(default = "default_max_parser_buffer_bytes")]
    pub max_parser_buffer_bytes: usize,

    /// Delay before a worked example without follow-up completes, in milliseconds.
    #[serde(default = "default_auto_complete_delay_ms")]
    pub auto_complete_delay_ms: u64,

    /// Optional JSON file with additional lesson plans.
    #[serde(default)]
    pub lessons_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            server: ServerConfig::default(),
            cli: CliConfig::default(),
            channel: default_channel(),
            namespace: default_namespace(),
            transport: Transport::default(),
            formatter_timeout_ms: default_formatter_timeout_ms(),
            max_parser_buffer_bytes: default_max_parser_buffer_bytes(),
            auto_complete_delay_ms: default_auto_complete_delay_ms(),
            lessons_file: None,
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `prism.json` in the current directory; without one the
    /// defaults are used. Environment overrides are applied in both cases.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            PrismError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `prism.json` in a specific directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `PrismError::ConfigParseError` if the file exists but is not
    /// valid JSON, and `PrismError::ConfigValidationError` if a value is out
    /// of range after environment overrides are applied.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut config: Self = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| PrismError::config_parse(path, e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(PrismError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides, reading variables through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(channel) = lookup(ENV_COMMAND_CHANNEL).filter(|v| !v.trim().is_empty()) {
            self.channel = channel;
        }
        if let Some(host) = lookup(ENV_REDIS_HOST).filter(|v| !v.trim().is_empty()) {
            self.redis.host = host;
        }
        if let Some(port) = lookup(ENV_REDIS_PORT) {
            self.redis.port = port.trim().parse().map_err(|_| {
                PrismError::config_validation(
                    format!("{ENV_REDIS_PORT} is not a valid port: '{port}'"),
                    format!("Set {ENV_REDIS_PORT} to a number between 1 and 65535"),
                )
            })?;
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `PrismError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.redis.port == 0 {
            return Err(PrismError::config_validation(
                "redis.port must be greater than 0",
                "Set redis.port to the port your server listens on (usually 6379) in prism.json",
            ));
        }

        if self.server.port == 0 {
            return Err(PrismError::config_validation(
                "server.port must be greater than 0",
                "Set server.port to a free port in prism.json",
            ));
        }

        if prism_capture::validate_size(self.cli.cols, self.cli.rows).is_err() {
            return Err(PrismError::config_validation(
                format!(
                    "cli.cols/cli.rows out of range: {}x{}",
                    self.cli.cols, self.cli.rows
                ),
                "Use cli.cols between 20 and 500 and cli.rows between 5 and 200 in prism.json",
            ));
        }

        if self.cli.program.trim().is_empty() {
            return Err(PrismError::config_validation(
                "cli.program must not be empty",
                "Set cli.program to the CLI executable (e.g. redis-cli) in prism.json",
            ));
        }

        if self.formatter_timeout_ms == 0 {
            return Err(PrismError::config_validation(
                "formatterTimeoutMs must be greater than 0",
                "Set formatterTimeoutMs to at least 1 in prism.json",
            ));
        }

        if self.max_parser_buffer_bytes < MIN_PARSER_BUFFER_BYTES {
            return Err(PrismError::config_validation(
                format!("maxParserBufferBytes must be at least {MIN_PARSER_BUFFER_BYTES}"),
                "Raise maxParserBufferBytes in prism.json",
            ));
        }

        if self.channel.trim().is_empty() {
            return Err(PrismError::config_validation(
                "channel must not be empty",
                format!("Set channel in prism.json or {ENV_COMMAND_CHANNEL}"),
            ));
        }

        if self.namespace.trim().is_empty() {
            return Err(PrismError::config_validation(
                "namespace must not be empty",
                "Set namespace in prism.json (default 'prism')",
            ));
        }

        Ok(())
    }

    /// The canonical query bound as a duration.
    #[must_use]
    pub const fn formatter_timeout(&self) -> Duration {
        Duration::from_millis(self.formatter_timeout_ms)
    }

    /// The worked-example auto-complete delay as a duration.
    #[must_use]
    pub const fn auto_complete_delay(&self) -> Duration {
        Duration::from_millis(self.auto_complete_delay_ms)
    }

    /// Arguments for launching the CLI against lesson database `database`.
    ///
    /// Uses `cli.args` verbatim when set.
    #[must_use]
    pub fn cli_args(&self, database: u8) -> Vec<String> {
        self.cli.args.clone().unwrap_or_else(|| {
            vec![
                "-h".to_string(),
                self.redis.host.clone(),
                "-p".to_string(),
                self.redis.port.to_string(),
                "-n".to_string(),
                database.to_string(),
            ]
        })
    }
}

/// Key/value server address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// Host name or address.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port.
    #[serde(default = "default_redis_port")]
    pub port: u16,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_redis_port(),
        }
    }
}

/// Capture server listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port.
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
        }
    }
}

/// The CLI run on the pseudo-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Executable to spawn.
    #[serde(default = "default_program")]
    pub program: String,
    /// Explicit arguments. When absent, host, port and lesson database are
    /// passed.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Initial terminal width.
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Initial terminal height.
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: None,
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// Transport carrying captured commands to the evaluator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transport {
    /// Pub/sub on the key/value server (default).
    #[default]
    Redis,
    /// In-process broadcast; capture and evaluator must share a process.
    Local,
}

impl Transport {
    /// Parses a string into a `Transport`, case-insensitively.
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Transport {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid transport '{s}': expected one of 'redis', 'local'"
            ))
        })
    }
}

impl Serialize for Transport {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            Self::Redis => "redis",
            Self::Local => "local",
        };
        serializer.serialize_str(s)
    }
}
