//! # Stage: Store Configuration
//!
//! ## Responsibility
//! Resolve, once and up front, which backend the store runs on and with what
//! retention parameters.  Loaded from TOML or built in code.
//!
//! ```toml
//! [backend]
//! kind = "redis"
//! url = "redis://127.0.0.1:6379/0"
//!
//! [retention]
//! key_ttl_days = 90
//! ```
//!
//! ## NOT Responsible For
//! - Connecting (see `PatternStore::open`)
//! - Switching backends on a live dataset; migration goes through export/import

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Which storage engine to instantiate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Transactional single-file store with retry-on-contention.
    Sqlite(SqliteConfig),
    /// Lock-free store using MULTI/EXEC batches and key expiry.
    Redis(RedisConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Sqlite(_) => "sqlite",
            BackendConfig::Redis(_) => "redis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
    /// Per-connection busy timeout handed to SQLite.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Total attempts for a write that keeps hitting a locked database.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` sleeps `n * retry_backoff_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Prefix for every key this store owns (`<ns>:pattern:...`).
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: default_namespace(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// Caps and expiry applied by both backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Idle lifetime of patterns and logs (Redis key TTL; SQLite idle purge).
    #[serde(default = "default_key_ttl_days")]
    pub key_ttl_days: u64,
    /// Newest fix outcomes kept per repository.
    #[serde(default = "default_fix_outcome_cap")]
    pub fix_outcome_cap: usize,
    /// Newest learning sessions kept per repository.
    #[serde(default = "default_session_cap")]
    pub session_cap: usize,
    /// Newest learning changes kept per (repository, pattern type).
    #[serde(default = "default_change_cap")]
    pub change_cap: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            key_ttl_days: default_key_ttl_days(),
            fix_outcome_cap: default_fix_outcome_cap(),
            session_cap: default_session_cap(),
            change_cap: default_change_cap(),
        }
    }
}

impl RetentionConfig {
    pub fn key_ttl_secs(&self) -> u64 {
        self.key_ttl_days.saturating_mul(86_400)
    }

    pub fn key_ttl_ms(&self) -> u64 {
        self.key_ttl_secs().saturating_mul(1000)
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

/// Key separator and SCAN glob metacharacters.
const NAMESPACE_FORBIDDEN: [char; 6] = [':', '*', '?', '[', ']', '\\'];

fn default_namespace() -> String {
    "pattern_store".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_key_ttl_days() -> u64 {
    90
}

fn default_fix_outcome_cap() -> usize {
    1000
}

fn default_session_cap() -> usize {
    500
}

fn default_change_cap() -> usize {
    100
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl StoreConfig {
    /// SQLite store at `path` with default retention.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::Sqlite(SqliteConfig::new(path)),
            retention: RetentionConfig::default(),
        }
    }

    /// Redis store at `url` with default namespace and retention.
    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig::Redis(RedisConfig::new(url)),
            retention: RetentionConfig::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        let config: StoreConfig =
            toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject settings that would make a backend misbehave silently.
    pub fn validate(&self) -> StoreResult<()> {
        match &self.backend {
            BackendConfig::Sqlite(c) => {
                if c.path.as_os_str().is_empty() {
                    return Err(StoreError::Config("sqlite path is empty".into()));
                }
                if c.max_attempts == 0 {
                    return Err(StoreError::Config("max_attempts must be at least 1".into()));
                }
            }
            BackendConfig::Redis(c) => {
                if c.url.trim().is_empty() {
                    return Err(StoreError::Config("redis url is empty".into()));
                }
                if c.namespace.trim().is_empty()
                    || c.namespace.contains(|ch: char| NAMESPACE_FORBIDDEN.contains(&ch))
                {
                    return Err(StoreError::Config(format!(
                        "redis namespace must be non-empty and contain none of {:?}",
                        NAMESPACE_FORBIDDEN
                    )));
                }
            }
        }
        let r = &self.retention;
        if r.key_ttl_days == 0 || r.fix_outcome_cap == 0 || r.session_cap == 0 || r.change_cap == 0 {
            return Err(StoreError::Config("retention values must be non-zero".into()));
        }
        Ok(())
    }
}
