use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::{CallType, Credentials};

/// Environment variable that overrides `server.api_key`.
pub const API_KEY_ENV: &str = "RTCPROBE_API_KEY";
/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "RTCPROBE_CONFIG";

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidValue {
        path: PathBuf,
        field: String,
        value: String,
        valid_values: Vec<String>,
    },
    MissingValue {
        path: PathBuf,
        field: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError { path, source } => {
                write!(
                    f,
                    "Failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(f, "Invalid TOML syntax in {}: {}", path.display(), source)
            }
            ConfigError::InvalidValue {
                path,
                field,
                value,
                valid_values,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for '{}' in {}\n  Valid values: {}",
                    value,
                    field,
                    path.display(),
                    valid_values.join(", ")
                )
            }
            ConfigError::MissingValue { path, field } => {
                write!(f, "Missing '{}' in {}", field, path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::InvalidValue { .. } | ConfigError::MissingValue { .. } => None,
        }
    }
}

/// rtcprobe configuration loaded from `~/.config/rtcprobe/config.toml`.
///
/// Example:
/// ```toml
/// [server]
/// url = "https://erp.example.com"
/// database = "prod"
/// username = "me@example.com"
/// api_key = "..."
///
/// [call]
/// channel_id = 105
/// hold_secs = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub call: CallConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// File this config was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL, e.g. `https://erp.example.com` (no `/xmlrpc` suffix)
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    /// API key or password; `RTCPROBE_API_KEY` takes precedence
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout in seconds (default: 30)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            database: String::new(),
            username: String::new(),
            api_key: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Channel called when `--channel` is not given
    #[serde(default)]
    pub channel_id: Option<i64>,
    /// "audio" or "video"
    #[serde(default = "default_call_type")]
    pub call_type: String,
    /// Seconds the call stays open before its session is deleted (default: 30)
    #[serde(default = "default_hold")]
    pub hold_secs: u64,
    /// Delete the channel's existing call sessions before calling
    #[serde(default = "default_clean_before_call")]
    pub clean_before_call: bool,
}

fn default_call_type() -> String {
    "audio".to_string()
}

fn default_hold() -> u64 {
    30
}

fn default_clean_before_call() -> bool {
    true
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            channel_id: None,
            call_type: default_call_type(),
            hold_secs: default_hold(),
            clean_before_call: default_clean_before_call(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
    /// Trace XML-RPC request bodies (secret masked)
    #[serde(default)]
    pub log_requests: bool,
}

/// Overrides collected from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub channel_id: Option<i64>,
    pub call_type: Option<CallType>,
    pub hold_secs: Option<u64>,
    pub clean_before_call: Option<bool>,
    pub debug: bool,
}

impl Config {
    pub fn dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rtcprobe")
    }

    /// Config file path: `RTCPROBE_CONFIG` if set, else the default location.
    pub fn path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::dir().join("config.toml"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path())
    }

    /// Load and validate the file at `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self {
                source: Some(path.to_path_buf()),
                ..Self::default()
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.source = Some(path.to_path_buf());

        if config.call.call_type.parse::<CallType>().is_err() {
            return Err(ConfigError::InvalidValue {
                path: path.to_path_buf(),
                field: "call.call_type".to_string(),
                value: config.call.call_type,
                valid_values: vec!["audio".to_string(), "video".to_string()],
            });
        }

        if !config.server.url.is_empty()
            && !config.server.url.starts_with("https://")
            && !config.server.url.starts_with("http://")
        {
            return Err(ConfigError::InvalidValue {
                path: path.to_path_buf(),
                field: "server.url".to_string(),
                value: config.server.url,
                valid_values: vec!["https://...".to_string(), "http://...".to_string()],
            });
        }

        if config.server.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                path: path.to_path_buf(),
                field: "server.timeout_secs".to_string(),
                value: "0".to_string(),
                valid_values: vec!["1 or more".to_string()],
            });
        }

        Ok(config)
    }

    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(id) = overrides.channel_id {
            self.call.channel_id = Some(id);
        }
        if let Some(call_type) = overrides.call_type {
            self.call.call_type = call_type.to_string();
        }
        if let Some(hold) = overrides.hold_secs {
            self.call.hold_secs = hold;
        }
        if let Some(clean) = overrides.clean_before_call {
            self.call.clean_before_call = clean;
        }
        if overrides.debug {
            self.logging.debug = true;
        }
        // Check for API key environment variable
        if let Ok(api_key) = std::env::var(API_KEY_ENV)
            && !api_key.is_empty()
        {
            self.server.api_key = Some(api_key);
        }
        self
    }

    pub fn call_type(&self) -> CallType {
        self.call.call_type.parse().unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    /// Credentials for the client; every server field must be set.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let missing = |field: &str| ConfigError::MissingValue {
            path: self.source.clone().unwrap_or_else(Self::path),
            field: field.to_string(),
        };

        let required = |value: &str, field: &str| {
            if value.trim().is_empty() {
                Err(missing(field))
            } else {
                Ok(value.to_string())
            }
        };

        Ok(Credentials {
            server_url: required(&self.server.url, "server.url")?,
            database: required(&self.server.database, "server.database")?,
            username: required(&self.server.username, "server.username")?,
            secret: self
                .server
                .api_key
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| missing("server.api_key"))?,
        })
    }

    /// Copy safe to print: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(key) = copy.server.api_key.as_mut() {
            *key = if key.chars().count() <= 8 {
                "***".to_string()
            } else {
                let visible: String = key.chars().take(4).collect();
                format!("{visible}…")
            };
        }
        copy
    }
}
