//! Configuration loading for the sync core.
//!
//! Durations are integer milliseconds. Every section has defaults, so a TOML
//! file only needs to name what it overrides; unknown fields are rejected.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "STOOP_SYNC_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub mutation: MutationConfig,
    pub realtime: RealtimeConfig,
    pub presence: PresenceConfig,
    pub memory: MemoryConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// How long fetched data counts as fresh.
    pub stale_time_ms: u64,
    /// How long an unobserved entry survives before GC.
    pub gc_time_ms: u64,
    /// How often the GC sweep runs.
    pub gc_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 30_000,
            gc_time_ms: 5 * 60_000,
            gc_interval_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Three retries, for idempotent reads.
    pub fn reads() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Two retries, for writes that only retry network-class failures.
    pub fn mutations() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::reads()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub request_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            retry: RetryConfig::reads(),
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MutationConfig {
    pub request_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            retry: RetryConfig::mutations(),
        }
    }
}

impl MutationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Where realtime inserts land in a cached collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InsertPlacement {
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Consecutive failed attempts before giving up. Zero means never.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 250,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealtimeConfig {
    /// Field that identifies a row inside collections.
    pub identity_field: String,
    pub insert_placement: InsertPlacement,
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            identity_field: "id".to_string(),
            insert_placement: InsertPlacement::Back,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresenceConfig {
    /// A user is online while their last heartbeat is at most this old.
    pub online_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// How often the signed-in user announces their own heartbeat.
    pub heartbeat_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_timeout_ms: 5 * 60_000,
            sweep_interval_ms: 60_000,
            heartbeat_interval_ms: 60_000,
        }
    }
}

impl PresenceConfig {
    pub fn online_timeout(&self) -> Duration {
        Duration::from_millis(self.online_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub sample_interval_ms: u64,
    /// Percentage (0-100) that triggers light cleanup.
    pub pressure_threshold: f64,
    /// Percentage (0-100) that triggers aggressive cleanup.
    pub critical_threshold: f64,
    /// Light cleanup removes unobserved entries idle for longer than this.
    pub idle_cutoff_ms: u64,
    /// Byte budget the cache footprint is measured against.
    pub budget_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 30_000,
            pressure_threshold: 75.0,
            critical_threshold: 90.0,
            idle_cutoff_ms: 5 * 60_000,
            budget_bytes: 64 * 1024 * 1024,
        }
    }
}

impl MemoryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn idle_cutoff(&self) -> Duration {
        Duration::from_millis(self.idle_cutoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceConfig {
    /// Version string; a snapshot written under a different buster is discarded.
    pub buster: String,
    /// Snapshots older than this are discarded on restore.
    pub max_age_ms: u64,
    /// Key the snapshot is stored under.
    pub storage_key: String,
    pub persist_interval_ms: u64,
    /// Directory used by the file-backed storage.
    pub directory: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            buster: "v1".to_string(),
            max_age_ms: 24 * 60 * 60_000,
            storage_key: "stoop-query-cache".to_string(),
            persist_interval_ms: 1_000,
            directory: None,
        }
    }
}

impl PersistenceConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

impl SyncConfig {
    /// Load from `--config <path>` or the `STOOP_SYNC_CONFIG` variable, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.stale_time_ms > self.cache.gc_time_ms {
            return Err(ConfigError::InvalidValue {
                field: "cache.stale_time_ms",
                reason: "must be <= cache.gc_time_ms".to_string(),
            });
        }
        if self.cache.gc_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.gc_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.fetch.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fetch.request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.mutation.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mutation.request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        validate_retry("fetch.retry", &self.fetch.retry)?;
        validate_retry("mutation.retry", &self.mutation.retry)?;
        if self.mutation.retry.max_retries > self.fetch.retry.max_retries {
            return Err(ConfigError::InvalidValue {
                field: "mutation.retry.max_retries",
                reason: "must be <= fetch.retry.max_retries".to_string(),
            });
        }
        if self.realtime.identity_field.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "realtime.identity_field",
                reason: "must not be empty".to_string(),
            });
        }
        let reconnect = &self.realtime.reconnect;
        if reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "realtime.reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if reconnect.max_ms < reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "realtime.reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "realtime.reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.presence.online_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "presence.online_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.presence.heartbeat_interval_ms == 0
            || self.presence.heartbeat_interval_ms > self.presence.online_timeout_ms
        {
            return Err(ConfigError::InvalidValue {
                field: "presence.heartbeat_interval_ms",
                reason: "must be > 0 and <= presence.online_timeout_ms".to_string(),
            });
        }
        if self.presence.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "presence.sweep_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        let memory = &self.memory;
        if memory.sample_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.sample_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if !(0.0..=100.0).contains(&memory.pressure_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "memory.pressure_threshold",
                reason: "must be within 0..=100".to_string(),
            });
        }
        if !(0.0..=100.0).contains(&memory.critical_threshold)
            || memory.critical_threshold < memory.pressure_threshold
        {
            return Err(ConfigError::InvalidValue {
                field: "memory.critical_threshold",
                reason: "must be within 0..=100 and >= pressure_threshold".to_string(),
            });
        }
        if memory.budget_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.budget_bytes",
                reason: "must be > 0".to_string(),
            });
        }
        if self.persistence.buster.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "persistence.buster",
                reason: "must not be empty".to_string(),
            });
        }
        if self.persistence.storage_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "persistence.storage_key",
                reason: "must not be empty".to_string(),
            });
        }
        if self.persistence.persist_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "persistence.persist_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn validate_retry(field: &'static str, retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "max_backoff_ms must be >= initial_backoff_ms".to_string(),
        });
    }
    if retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "backoff_multiplier must be >= 1.0".to_string(),
        });
    }
    Ok(())
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
