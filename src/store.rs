//! # Stage: Pattern Store
//!
//! ## Responsibility
//! The caller-facing operation set.  Validates input, forces every opaque
//! document through the [`Anonymizer`], delegates to the backend chosen at
//! construction, and composes reads into trends, analytics and insights.
//!
//! ## Guarantees
//! - Nothing reaches a backend without passing sanitize + verify
//! - A rejected write persists nothing and is logged without its content
//! - Writes return `Err` on failure; reads never fail, they log and return
//!   an empty value
//! - The backend is fixed for the lifetime of the store; moving data between
//!   backends goes through `export_patterns` / `import_patterns`
//!
//! ## NOT Responsible For
//! - Scheduling (callers decide when to learn, track or clean up)
//! - Choosing which source files to learn from (`anonymizer::is_sensitive_path`)

use std::path::Path;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::anonymizer::Anonymizer;
use crate::backend::{self, Backend, RetentionSweep};
use crate::config::{BackendConfig, RedisConfig, RetentionConfig, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::insights;
use crate::models::{
    CleanupReport, ComprehensiveInsights, ExportDocument, FixOutcome, FixSuccessRate,
    HealthStatus, IssuePattern, IssueTrends, LearningAnalytics, LearningChange, LearningSession,
    TeamPattern,
};
use crate::relational::SqliteBackend;

/// Window used by the trend, analytics and evolution reads when the caller
/// has no preference.
pub const DEFAULT_DAYS_BACK: u64 = 30;

type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

pub struct PatternStore {
    backend: Box<dyn Backend>,
    anonymizer: Anonymizer,
    retention: RetentionConfig,
    clock: Clock,
}

impl std::fmt::Debug for PatternStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternStore")
            .field("backend", &self.backend.name())
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "redis-backing")]
fn open_redis(config: &RedisConfig, retention: &RetentionConfig) -> StoreResult<Box<dyn Backend>> {
    Ok(Box::new(crate::atomic::RedisBackend::connect(
        config.clone(),
        retention.clone(),
    )?))
}

#[cfg(not(feature = "redis-backing"))]
fn open_redis(_config: &RedisConfig, _retention: &RetentionConfig) -> StoreResult<Box<dyn Backend>> {
    Err(StoreError::Unavailable(
        "redis backend selected but this build lacks the `redis-backing` feature".to_string(),
    ))
}

fn require(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::invalid(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_range(field: &str, value: f64, lo: f64, hi: f64) -> StoreResult<()> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(StoreError::invalid(format!(
            "{} must be within [{}, {}], got {}",
            field, lo, hi, value
        )));
    }
    Ok(())
}

fn is_empty_document(doc: &Value) -> bool {
    match doc {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

impl PatternStore {
    /// Validate `config` and connect to the backend it names.
    ///
    /// An unreachable Redis is an error: the store never falls back to
    /// SQLite on its own.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let backend: Box<dyn Backend> = match &config.backend {
            BackendConfig::Sqlite(c) => {
                Box::new(SqliteBackend::open(c.clone(), config.retention.clone())?)
            }
            BackendConfig::Redis(c) => open_redis(c, &config.retention)?,
        };
        info!(backend = backend.name(), "pattern store opened");
        Ok(Self::with_backend(backend, config.retention.clone()))
    }

    pub(crate) fn with_backend(backend: Box<dyn Backend>, retention: RetentionConfig) -> Self {
        Self {
            backend,
            anonymizer: Anonymizer::new(),
            retention,
            clock: Box::new(crate::now_ms),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Sanitize and verify `doc`.  On rejection, log which matcher fired and
    /// where, never the document.
    fn gate(&self, repo: &str, pattern_type: &str, field: &'static str, doc: &Value) -> StoreResult<Value> {
        self.anonymizer.scrub(doc).map_err(|matcher| {
            error!(
                repo,
                pattern_type,
                field,
                matcher,
                "write rejected: sensitive content survived sanitization"
            );
            StoreError::Rejected { matcher }
        })
    }

    fn read_or_default<T: Default>(&self, op: &'static str, repo: &str, result: StoreResult<T>) -> T {
        result.unwrap_or_else(|e| {
            error!(op, repo, backend = self.backend.name(), error = %e, "read failed; returning empty result");
            T::default()
        })
    }

    // -----------------------------------------------------------------------
    // Patterns
    // -----------------------------------------------------------------------

    /// Insert or update the pattern for `(repo, pattern_type)`.
    pub fn store_pattern(
        &self,
        repo: &str,
        pattern_type: &str,
        data: &Value,
        confidence: f64,
    ) -> StoreResult<TeamPattern> {
        let validated = require("repo_path", repo)
            .and_then(|_| require("pattern_type", pattern_type))
            .and_then(|_| {
                if is_empty_document(data) {
                    Err(StoreError::invalid("pattern_data must not be empty"))
                } else {
                    Ok(())
                }
            })
            .and_then(|_| require_range("confidence", confidence, 0.0, 1.0));
        if let Err(e) = validated {
            warn!(repo, pattern_type, error = %e, "store_pattern refused");
            return Err(e);
        }
        let clean = self.gate(repo, pattern_type, "pattern_data", data)?;
        self.backend
            .upsert_pattern(repo, pattern_type, &clean, confidence, self.now())
    }

    /// Patterns for `repo`, optionally one type, at or above `min_confidence`,
    /// sorted by confidence then usage, both descending.
    pub fn get_team_patterns(
        &self,
        repo: &str,
        pattern_type: Option<&str>,
        min_confidence: f64,
    ) -> Vec<TeamPattern> {
        let loaded = self.read_or_default("get_team_patterns", repo, self.backend.load_patterns(repo));
        backend::rank_patterns(loaded, pattern_type, min_confidence)
    }

    /// Overwrite the confidence of an existing pattern.
    pub fn update_confidence(
        &self,
        repo: &str,
        pattern_type: &str,
        confidence: f64,
    ) -> StoreResult<TeamPattern> {
        require("repo_path", repo)?;
        require("pattern_type", pattern_type)?;
        require_range("confidence", confidence, 0.0, 1.0)?;
        self.backend
            .set_confidence(repo, pattern_type, confidence, self.now())?
            .ok_or_else(|| {
                warn!(repo, pattern_type, "update_confidence on unknown pattern");
                StoreError::NotFound {
                    repo: repo.to_string(),
                    pattern_type: pattern_type.to_string(),
                }
            })
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    pub fn track_issue_pattern(
        &self,
        repo: &str,
        issue_type: &str,
        issue_rule: &str,
        severity: &str,
    ) -> StoreResult<IssuePattern> {
        require("repo_path", repo)?;
        require("issue_type", issue_type)?;
        require("issue_rule", issue_rule)?;
        require("severity", severity)?;
        self.backend
            .track_issue(repo, issue_type, issue_rule, severity, self.now())
    }

    pub fn get_issue_trends(&self, repo: &str, days_back: u64) -> IssueTrends {
        let since = backend::window_start(self.now(), days_back);
        let issues = self.read_or_default("get_issue_trends", repo, self.backend.load_issues(repo, since));
        backend::issue_trends(issues, days_back)
    }

    // -----------------------------------------------------------------------
    // Fix outcomes
    // -----------------------------------------------------------------------

    pub fn record_fix_outcome(
        &self,
        repo: &str,
        issue_type: &str,
        fix_type: &str,
        success: bool,
        feedback_score: f64,
        metadata: Option<&Value>,
    ) -> StoreResult<()> {
        require("repo_path", repo)?;
        require("issue_type", issue_type)?;
        require("fix_type", fix_type)?;
        require_range("feedback_score", feedback_score, -1.0, 1.0)?;
        let metadata = match metadata {
            Some(doc) => self.gate(repo, issue_type, "metadata", doc)?,
            None => Value::Null,
        };
        self.backend.append_fix_outcome(&FixOutcome {
            repo_path: repo.to_string(),
            issue_type: issue_type.to_string(),
            fix_type: fix_type.to_string(),
            success,
            feedback_score,
            applied_at: self.now(),
            metadata,
        })
    }

    pub fn get_fix_success_rates(&self, repo: &str) -> Vec<FixSuccessRate> {
        let outcomes = self.read_or_default("get_fix_success_rates", repo, self.backend.load_fix_outcomes(repo));
        backend::fix_success_rates(&outcomes)
    }

    // -----------------------------------------------------------------------
    // Learning sessions
    // -----------------------------------------------------------------------

    pub fn record_learning_session(
        &self,
        repo: &str,
        session_type: &str,
        patterns_learned: u64,
        insights_generated: u64,
        session_data: Option<&Value>,
    ) -> StoreResult<()> {
        require("repo_path", repo)?;
        require("session_type", session_type)?;
        let session_data = match session_data {
            Some(doc) => self.gate(repo, session_type, "session_data", doc)?,
            None => Value::Null,
        };
        self.backend.append_session(&LearningSession {
            repo_path: repo.to_string(),
            session_type: session_type.to_string(),
            patterns_learned,
            insights_generated,
            session_data,
            created_at: self.now(),
        })
    }

    pub fn get_learning_analytics(&self, repo: &str, days_back: u64) -> LearningAnalytics {
        let since = backend::window_start(self.now(), days_back);
        let sessions = self.read_or_default(
            "get_learning_analytics",
            repo,
            self.backend.load_sessions(repo, since),
        );
        backend::learning_analytics(&sessions, days_back)
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    /// Append an externally described change to the audit log of
    /// `(repo, pattern_type)`.  Pattern writes append their own changes.
    pub fn record_learning_change(
        &self,
        repo: &str,
        pattern_type: &str,
        before: Option<&Value>,
        after: &Value,
        reason: &str,
        confidence_change: f64,
    ) -> StoreResult<LearningChange> {
        require("repo_path", repo)?;
        require("pattern_type", pattern_type)?;
        require("reason", reason)?;
        if !confidence_change.is_finite() {
            return Err(StoreError::invalid("confidence_change must be finite"));
        }
        let before_data = before
            .map(|doc| self.gate(repo, pattern_type, "before_data", doc))
            .transpose()?;
        let after_data = self.gate(repo, pattern_type, "after_data", after)?;
        let reason = match self.gate(repo, pattern_type, "reason", &Value::String(reason.to_string()))? {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let change = LearningChange {
            change_id: uuid::Uuid::new_v4().to_string(),
            repo_path: repo.to_string(),
            pattern_type: pattern_type.to_string(),
            before_data,
            after_data,
            reason,
            confidence_change,
            created_at: self.now(),
        };
        self.backend.append_change(&change)?;
        Ok(change)
    }

    /// Changes to `(repo, pattern_type)` within the window, newest first.
    pub fn get_pattern_evolution(
        &self,
        repo: &str,
        pattern_type: &str,
        days_back: u64,
    ) -> Vec<LearningChange> {
        let since = backend::window_start(self.now(), days_back);
        self.read_or_default(
            "get_pattern_evolution",
            repo,
            self.backend.load_changes(repo, pattern_type, since),
        )
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Drop log entries older than `days_to_keep` days, decay stale issue
    /// trends and purge patterns and issues idle past the key TTL.
    pub fn cleanup_old_data(&self, days_to_keep: u64) -> StoreResult<CleanupReport> {
        let sweep = RetentionSweep::new(self.now(), days_to_keep, self.retention.key_ttl_ms());
        let report = self.backend.cleanup(&sweep)?;
        info!(
            backend = self.backend.name(),
            days_to_keep,
            removed = report.total_removed(),
            decayed = report.issues_decayed,
            "retention sweep finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Export / import
    // -----------------------------------------------------------------------

    /// Snapshot everything known about `repo`, re-checked by the anonymizer,
    /// and optionally write it to `file` as pretty JSON.
    pub fn export_patterns(&self, repo: &str, file: Option<&Path>) -> StoreResult<ExportDocument> {
        require("repo_path", repo)?;
        let document = ExportDocument {
            repo_path: repo.to_string(),
            exported_at: self.now(),
            team_patterns: self.get_team_patterns(repo, None, 0.0),
            issue_trends: self.get_issue_trends(repo, DEFAULT_DAYS_BACK),
            fix_success_rates: self.get_fix_success_rates(repo),
            learning_analytics: self.get_learning_analytics(repo, DEFAULT_DAYS_BACK),
        };
        let clean = self.gate(repo, "*", "export", &serde_json::to_value(&document)?)?;
        if let Some(path) = file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, serde_json::to_string_pretty(&clean)?)?;
            info!(repo, path = %path.display(), patterns = document.team_patterns.len(), "patterns exported");
        }
        Ok(serde_json::from_value(clean)?)
    }

    /// Replay every pattern in an export file into `repo` through
    /// `store_pattern`.  Returns how many were stored; rejected entries are
    /// logged and skipped.
    pub fn import_patterns(&self, repo: &str, file: &Path) -> StoreResult<usize> {
        require("repo_path", repo)?;
        let raw = std::fs::read_to_string(file)?;
        let document: ExportDocument = serde_json::from_str(&raw)?;
        let mut imported = 0usize;
        for p in &document.team_patterns {
            match self.store_pattern(repo, &p.pattern_type, &p.pattern_data, p.confidence) {
                Ok(_) => imported += 1,
                Err(e) => warn!(repo, pattern_type = %p.pattern_type, error = %e, "skipping pattern on import"),
            }
        }
        info!(
            repo,
            source = %document.repo_path,
            imported,
            total = document.team_patterns.len(),
            "patterns imported"
        );
        Ok(imported)
    }

    // -----------------------------------------------------------------------
    // Composite reads
    // -----------------------------------------------------------------------

    pub fn get_comprehensive_insights(&self, repo: &str) -> ComprehensiveInsights {
        let team_patterns = self.get_team_patterns(repo, None, 0.0);
        let issue_trends = self.get_issue_trends(repo, DEFAULT_DAYS_BACK);
        let fix_success_rates = self.get_fix_success_rates(repo);
        let learning_analytics = self.get_learning_analytics(repo, DEFAULT_DAYS_BACK);
        let summary = insights::summarize(&team_patterns, &issue_trends, &fix_success_rates);
        ComprehensiveInsights {
            repo_path: repo.to_string(),
            backend: self.backend.name().to_string(),
            generated_at: self.now(),
            team_patterns,
            issue_trends,
            fix_success_rates,
            learning_analytics,
            summary,
        }
    }

    pub fn health_check(&self) -> HealthStatus {
        let status = self.backend.health();
        if !status.healthy {
            warn!(backend = %status.backend, target = %status.target, "backend unhealthy");
        }
        status
    }
}
