//! Anonymized persistence and trend analytics for learned code-review
//! patterns.
//!
//! A [`PatternStore`] is opened once against either a transactional SQLite
//! file or a Redis instance and exposes the same operations on both:
//! learned team patterns, issue-rule trends, fix outcomes, learning sessions
//! and an audit trail of how each pattern evolved.  Every opaque document is
//! scrubbed by the [`anonymizer`] before it is written.
//!
//! ```no_run
//! use pattern_store::{PatternStore, StoreConfig};
//! use serde_json::json;
//!
//! let store = PatternStore::open(&StoreConfig::sqlite("patterns.db"))?;
//! store.store_pattern("/repo", "naming", &json!({"style": "snake_case"}), 0.8)?;
//! let insights = store.get_comprehensive_insights("/repo");
//! println!("{:?}", insights.summary.recommendations);
//! # Ok::<(), pattern_store::StoreError>(())
//! ```

pub mod anonymizer;
pub mod cli;
pub mod config;
pub mod error;
pub mod insights;
pub mod models;

#[cfg_attr(not(feature = "redis-backing"), allow(dead_code))]
mod atomic;
mod backend;
mod relational;
mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use anonymizer::{is_sensitive_path, Anonymizer};
pub use config::{BackendConfig, RedisConfig, RetentionConfig, SqliteConfig, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use models::*;
pub use store::{PatternStore, DEFAULT_DAYS_BACK};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
