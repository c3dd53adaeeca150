//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::util::bytes::parse_size;

mod cli;

pub use cli::{CliArgs, Command, GlobalOverrides, HashArgs, PutArgs, RunArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "docgen";
const ENV_PREFIX: &str = "DOCGEN";
const DEFAULT_CACHE_DIR_NAME: &str = "docgen-cache";
const DEFAULT_CACHE_RATIO: f64 = 0.7;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3_600;
const DEFAULT_LOCK_STALE_SECS: u64 = 600;
const DEFAULT_LOCK_WAIT_MS: u64 = 5_000;
const DEFAULT_UPLOAD_MAX_FILE_SIZE: &str = "25MB";
const DEFAULT_CLOGS_MAX_BATCH_SIZE: u64 = 50;
const DEFAULT_CLOGS_INITIAL_DELAY_MS: u64 = 1_000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub uploads: UploadSettings,
    pub clogs: ClogsSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub directory: PathBuf,
    /// `None` disables eviction.
    pub max_size: Option<u64>,
    pub min_retain: u64,
    pub ratio: f64,
    /// `None` disables the periodic cleanup task.
    pub cleanup_interval: Option<Duration>,
    pub lock_stale: Duration,
    pub lock_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_file_size: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct ClogsSettings {
    pub enabled: bool,
    /// Present whenever `enabled` is true.
    pub http: Option<ClogsHttpSettings>,
    pub queue: ClogsQueueSettings,
    pub defaults: ClogsDefaults,
    pub metadata: Option<Map<String, Value>>,
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct ClogsHttpSettings {
    pub api_url: Url,
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ClogsQueueSettings {
    pub max_batch_size: NonZeroUsize,
    /// `None` means batches only leave on explicit flushes.
    pub batch_timeout: Option<Duration>,
    pub initial_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ClogsDefaults {
    pub env: Option<String>,
    pub level: Option<String>,
    pub pattern: Option<String>,
    pub retention: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Command::Run(args) = &cli.command {
        raw.apply_run_overrides(args);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    uploads: RawUploadSettings,
    clogs: RawClogsSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(size) = overrides.cache_max_size.as_ref() {
            self.cache.max_size = Some(size.clone());
        }
    }

    fn apply_run_overrides(&mut self, overrides: &RunArgs) {
        if let Some(seconds) = overrides.cleanup_interval_seconds {
            self.cache.cleanup_interval_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.clogs_enabled {
            self.clogs.enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            uploads,
            clogs,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let uploads = build_upload_settings(uploads)?;
        let cache = build_cache_settings(cache, &uploads)?;
        let clogs = build_clogs_settings(clogs)?;

        Ok(Self {
            logging,
            cache,
            uploads,
            clogs,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upload_settings(uploads: RawUploadSettings) -> Result<UploadSettings, LoadError> {
    let raw = uploads
        .max_file_size
        .unwrap_or_else(|| DEFAULT_UPLOAD_MAX_FILE_SIZE.to_string());
    let bytes = size_value(&raw, "uploads.max_file_size")?;
    let max_file_size = NonZeroU64::new(bytes)
        .ok_or_else(|| LoadError::invalid("uploads.max_file_size", "must be greater than zero"))?;

    Ok(UploadSettings { max_file_size })
}

fn build_cache_settings(
    cache: RawCacheSettings,
    uploads: &UploadSettings,
) -> Result<CacheSettings, LoadError> {
    let directory = cache
        .directory
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.directory",
            "path must not be empty",
        ));
    }

    let max_size = match non_empty(cache.max_size) {
        Some(raw) => Some(size_value(&raw, "cache.max_size")?),
        None => None,
    };

    let min_retain = match non_empty(cache.min_retain) {
        Some(raw) => size_value(&raw, "cache.min_retain")?,
        None => uploads.max_file_size.get(),
    };

    let ratio = cache.ratio.unwrap_or(DEFAULT_CACHE_RATIO);
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(LoadError::invalid(
            "cache.ratio",
            "must be greater than 0 and at most 1",
        ));
    }

    let interval_secs = cache
        .cleanup_interval_seconds
        .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS);
    let cleanup_interval = (interval_secs > 0).then(|| Duration::from_secs(interval_secs));

    let stale_secs = cache.lock_stale_seconds.unwrap_or(DEFAULT_LOCK_STALE_SECS);
    if stale_secs == 0 {
        return Err(LoadError::invalid(
            "cache.lock_stale_seconds",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        directory,
        max_size,
        min_retain,
        ratio,
        cleanup_interval,
        lock_stale: Duration::from_secs(stale_secs),
        lock_wait: Duration::from_millis(cache.lock_wait_ms.unwrap_or(DEFAULT_LOCK_WAIT_MS)),
    })
}

fn build_clogs_settings(clogs: RawClogsSettings) -> Result<ClogsSettings, LoadError> {
    let enabled = clogs.enabled.unwrap_or(false);
    let http = if enabled {
        Some(build_clogs_http_settings(clogs.http)?)
    } else {
        None
    };

    let batch_value = clogs
        .queue
        .max_batch_size
        .unwrap_or(DEFAULT_CLOGS_MAX_BATCH_SIZE);
    let max_batch_size = usize::try_from(batch_value)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid("clogs.queue.max_batch_size", "must be greater than zero")
        })?;

    let batch_timeout = clogs.queue.batch_timeout_ms.map(Duration::from_millis);
    if batch_timeout.is_some_and(|timeout| timeout.is_zero()) {
        return Err(LoadError::invalid(
            "clogs.queue.batch_timeout_ms",
            "must be greater than zero; omit it to flush only on demand",
        ));
    }

    let initial_delay = Some(Duration::from_millis(
        clogs
            .queue
            .initial_delay_ms
            .unwrap_or(DEFAULT_CLOGS_INITIAL_DELAY_MS),
    ));

    Ok(ClogsSettings {
        enabled,
        http,
        queue: ClogsQueueSettings {
            max_batch_size,
            batch_timeout,
            initial_delay,
        },
        defaults: ClogsDefaults {
            env: non_empty(clogs.defaults.env),
            level: non_empty(clogs.defaults.level),
            pattern: clogs.defaults.pattern,
            retention: non_empty(clogs.defaults.retention),
        },
        metadata: clogs.metadata.filter(|map| !map.is_empty()),
        data: clogs.data.filter(|map| !map.is_empty()),
    })
}

fn build_clogs_http_settings(http: RawClogsHttpSettings) -> Result<ClogsHttpSettings, LoadError> {
    let api_url = required_url(http.api_url, "clogs.http.api_url")?;
    let token_url = required_url(http.token_url, "clogs.http.token_url")?;
    let client_id = non_empty(http.client_id).ok_or_else(|| {
        LoadError::invalid("clogs.http.client_id", "required when clogs is enabled")
    })?;
    let client_secret = non_empty(http.client_secret).ok_or_else(|| {
        LoadError::invalid("clogs.http.client_secret", "required when clogs is enabled")
    })?;

    Ok(ClogsHttpSettings {
        api_url,
        token_url,
        client_id,
        client_secret,
    })
}

fn required_url(value: Option<String>, key: &'static str) -> Result<Url, LoadError> {
    let raw = non_empty(value)
        .ok_or_else(|| LoadError::invalid(key, "required when clogs is enabled"))?;
    Url::parse(&raw).map_err(|err| LoadError::invalid(key, format!("invalid URL `{raw}`: {err}")))
}

fn size_value(raw: &str, key: &'static str) -> Result<u64, LoadError> {
    parse_size(raw).map_err(|err| LoadError::invalid(key, err.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    directory: Option<PathBuf>,
    max_size: Option<String>,
    min_retain: Option<String>,
    ratio: Option<f64>,
    cleanup_interval_seconds: Option<u64>,
    lock_stale_seconds: Option<u64>,
    lock_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUploadSettings {
    max_file_size: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClogsSettings {
    enabled: Option<bool>,
    http: RawClogsHttpSettings,
    queue: RawClogsQueueSettings,
    defaults: RawClogsDefaults,
    metadata: Option<Map<String, Value>>,
    data: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClogsHttpSettings {
    api_url: Option<String>,
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClogsQueueSettings {
    max_batch_size: Option<u64>,
    batch_timeout_ms: Option<u64>,
    initial_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClogsDefaults {
    env: Option<String>,
    level: Option<String>,
    pattern: Option<String>,
    retention: Option<String>,
}
