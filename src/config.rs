//! Process configuration: defaults, a `key = value` file and `TUBEFLOW_*`
//! environment overrides, applied in that order.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::broker::SqliteBrokerSettings;
use crate::db::DatabaseOptions;
use crate::handler::{DownloadSettings, SupervisorSettings};
use crate::video::{DEFAULT_CONCURRENCY, RetryPolicy, ShardOverrides};

/// Prefix of environment variables that override configuration keys.
pub const ENV_PREFIX: &str = "TUBEFLOW_";

/// Keys whose file values are double-quoted strings.
const STRING_KEYS: &[&str] = &["broker_path", "db_path", "ytdlp_program", "cookies_file"];

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax on line {line}: expected key = value")]
    Syntax { line: usize },

    #[error("unknown configuration key '{key}' ({origin})")]
    UnknownKey { key: String, origin: String },

    #[error("invalid value for `{key}` ({origin}): {reason}")]
    InvalidValue {
        key: String,
        origin: String,
        reason: String,
    },
}

/// Where the broker lives and how consumers poll it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub path: PathBuf,
    pub connection_timeout: Duration,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let settings = SqliteBrokerSettings::default();
        Self {
            path: PathBuf::from("tubeflow-broker.sqlite"),
            connection_timeout: Duration::from_secs(5),
            poll_interval: settings.poll_interval,
            visibility_timeout: settings.visibility_timeout,
        }
    }
}

/// Message and video stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let options = DatabaseOptions::default();
        Self {
            path: PathBuf::from("tubeflow.sqlite"),
            max_connections: options.max_connections,
            busy_timeout_ms: options.busy_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub handler_retry_attempts: u32,
    pub handler_retry_timeout: Duration,
    pub download_retry_attempts: u32,
    pub download_retry_timeout: Duration,
    pub budget_reset_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let supervisor = SupervisorSettings::default();
        let download = RetryPolicy::default();
        Self {
            handler_retry_attempts: supervisor.retry_budget,
            handler_retry_timeout: supervisor.retry_timeout,
            download_retry_attempts: download.budget,
            download_retry_timeout: download.delay,
            budget_reset_after: supervisor.reset_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    pub ytdlp_program: PathBuf,
    pub concurrency: usize,
    pub cookies_file: Option<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            ytdlp_program: PathBuf::from("yt-dlp"),
            concurrency: DEFAULT_CONCURRENCY,
            cookies_file: None,
        }
    }
}

/// Everything a `tubeflow` process needs to wire itself up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
}

impl AppConfig {
    /// Loads `path` (or the default config file when it exists) and applies
    /// environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit file cannot be read or any
    /// key or value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match resolve_default_config_path().filter(|p| p.exists()) {
                Some(default_path) => Self::from_file(&default_path)?,
                None => Self::default(),
            },
        };
        config.apply_env(env::vars())?;
        Ok(config)
    }

    /// Reads a config file over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on I/O, syntax or validation failures.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loading config file");
        Self::parse(&raw)
    }

    /// Parses `key = value` lines over the defaults. `#` starts a comment
    /// outside of quoted strings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on syntax or validation failures.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (index, raw_line) in raw.lines().enumerate() {
            let line_number = index + 1;
            let line = strip_inline_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let Some((raw_key, raw_value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax { line: line_number });
            };

            let key = raw_key.trim();
            let origin = format!("line {line_number}");
            let value = raw_value.trim();
            let value = if STRING_KEYS.contains(&key) {
                parse_string_literal(value).ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    origin: origin.clone(),
                    reason: "expected double-quoted string".to_string(),
                })?
            } else {
                value
            };
            config.apply_setting(key, value, &origin)?;
        }
        Ok(config)
    }

    /// Applies every `TUBEFLOW_<KEY>` variable from `vars`; other variables
    /// are ignored. Values are taken verbatim, without quotes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown keys or invalid values.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            self.apply_setting(&key, value.trim(), &format!("env {name}"))?;
        }
        Ok(())
    }

    fn apply_setting(&mut self, key: &str, value: &str, origin: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: key.to_string(),
            origin: origin.to_string(),
            reason,
        };
        let seconds = |range: std::ops::RangeInclusive<u64>| {
            parse_in_range(value, range).map(Duration::from_secs).map_err(invalid)
        };

        match key {
            "broker_path" => self.broker.path = PathBuf::from(value),
            "broker_connection_timeout_secs" => self.broker.connection_timeout = seconds(1..=3600)?,
            "broker_poll_interval_ms" => {
                self.broker.poll_interval =
                    Duration::from_millis(parse_in_range(value, 10..=60_000).map_err(invalid)?);
            }
            "broker_visibility_timeout_secs" => {
                self.broker.visibility_timeout = seconds(1..=7 * 24 * 3600)?;
            }
            "db_path" => self.database.path = PathBuf::from(value),
            "db_max_connections" => {
                self.database.max_connections = narrow(parse_in_range(value, 1..=20).map_err(invalid)?);
            }
            "db_busy_timeout_ms" => {
                self.database.busy_timeout_ms =
                    narrow(parse_in_range(value, 0..=120_000).map_err(invalid)?);
            }
            "handler_retry_attempts" => {
                self.retry.handler_retry_attempts = narrow(parse_in_range(value, 0..=1000).map_err(invalid)?);
            }
            "handler_retry_timeout_secs" => self.retry.handler_retry_timeout = seconds(1..=3600)?,
            "download_retry_attempts" => {
                self.retry.download_retry_attempts = narrow(parse_in_range(value, 0..=1000).map_err(invalid)?);
            }
            "download_retry_timeout_secs" => self.retry.download_retry_timeout = seconds(1..=3600)?,
            "budget_reset_after_secs" => self.retry.budget_reset_after = seconds(1..=3600)?,
            "ytdlp_program" => self.download.ytdlp_program = PathBuf::from(value),
            "concurrency" => {
                self.download.concurrency =
                    usize::try_from(parse_in_range(value, 1..=100).map_err(invalid)?).unwrap_or(1);
            }
            "cookies_file" => {
                self.download.cookies_file = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            unknown => {
                return Err(ConfigError::UnknownKey {
                    key: unknown.to_string(),
                    origin: origin.to_string(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn broker_settings(&self) -> SqliteBrokerSettings {
        SqliteBrokerSettings {
            poll_interval: self.broker.poll_interval,
            visibility_timeout: self.broker.visibility_timeout,
            ..SqliteBrokerSettings::default()
        }
    }

    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            max_connections: self.database.max_connections,
            busy_timeout_ms: self.database.busy_timeout_ms,
        }
    }

    #[must_use]
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            retry_budget: self.retry.handler_retry_attempts,
            retry_timeout: self.retry.handler_retry_timeout,
            reset_after: self.retry.budget_reset_after,
        }
    }

    #[must_use]
    pub fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            retry: RetryPolicy::new(
                self.retry.download_retry_attempts,
                self.retry.download_retry_timeout,
            ),
            concurrency: self.download.concurrency,
            shard_overrides: ShardOverrides::default(),
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/tubeflow/config.toml`
/// 2. `$HOME/.config/tubeflow/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("tubeflow").join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("tubeflow")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Option<&str> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        return None;
    }
    Some(&raw_value[1..raw_value.len() - 1])
}

fn parse_in_range(raw_value: &str, range: std::ops::RangeInclusive<u64>) -> Result<u64, String> {
    let token = raw_value.trim();
    if token.is_empty() {
        return Err("expected integer value".to_string());
    }
    let value = token
        .parse::<u64>()
        .map_err(|e| format!("expected non-negative integer: {e}"))?;
    if !range.contains(&value) {
        return Err(format!(
            "{value} is out of range {}..={}",
            range.start(),
            range.end()
        ));
    }
    Ok(value)
}

/// Values are range-checked before narrowing; saturate rather than panic.
fn narrow(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
