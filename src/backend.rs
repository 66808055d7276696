//! # Stage: Backend Contract
//!
//! ## Responsibility
//! The storage primitives both engines implement, plus the pure derivations
//! (ranking, grouping, windowing, change records) that turn raw rows into the
//! caller-facing views.  Keeping the derivations here, rather than in each
//! engine, is what makes the two backends observationally identical.
//!
//! ## Guarantees
//! - Each mutating primitive is atomic: an upsert and its audit append land
//!   together or not at all
//! - Append-only logs are returned newest first
//! - Inputs reaching a backend have already passed validation and the
//!   anonymization gate in `PatternStore`
//!
//! ## NOT Responsible For
//! - Validation, sanitization, logging of read fallbacks (see `store`)

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::StoreResult;
use crate::models::{
    CleanupReport, FixOutcome, FixSuccessRate, HealthStatus, IssuePattern, IssueTrends,
    LearningAnalytics, LearningChange, LearningSession, TeamPattern,
};

/// Issues reported by `get_issue_trends`.
pub const TOP_ISSUE_LIMIT: usize = 20;

/// Added to an issue's trend score on every occurrence.
pub const TREND_INCREMENT: f64 = 0.1;

/// Multiplier applied to a stale issue's trend score per retention sweep.
pub const TREND_DECAY: f64 = 0.9;

pub const MS_PER_DAY: u64 = 86_400_000;

// ---------------------------------------------------------------------------
// Retention sweep parameters
// ---------------------------------------------------------------------------

/// Absolute cut-offs for one `cleanup_old_data` run, computed once so both
/// engines apply the same instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSweep {
    /// Log entries at or before this instant are deleted; issues last seen at
    /// or before it have their trend score decayed.
    pub cutoff_ms: u64,
    /// Patterns and issues untouched since this instant are purged.
    pub idle_cutoff_ms: u64,
}

impl RetentionSweep {
    pub fn new(now_ms: u64, days_to_keep: u64, key_ttl_ms: u64) -> Self {
        Self {
            cutoff_ms: now_ms.saturating_sub(days_to_keep.saturating_mul(MS_PER_DAY)),
            idle_cutoff_ms: now_ms.saturating_sub(key_ttl_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Storage primitives shared by the SQLite and Redis engines.
pub trait Backend: Send + Sync {
    /// Short identifier reported by health checks ("sqlite", "redis").
    fn name(&self) -> &'static str;

    /// Insert or replace a pattern and append its learning change in one
    /// atomic unit.  Returns the stored row.
    fn upsert_pattern(
        &self,
        repo: &str,
        pattern_type: &str,
        data: &Value,
        confidence: f64,
        now_ms: u64,
    ) -> StoreResult<TeamPattern>;

    /// All patterns for `repo`, unordered.
    fn load_patterns(&self, repo: &str) -> StoreResult<Vec<TeamPattern>>;

    /// Overwrite the confidence of an existing pattern and append its change.
    /// `Ok(None)` when the pattern does not exist.
    fn set_confidence(
        &self,
        repo: &str,
        pattern_type: &str,
        confidence: f64,
        now_ms: u64,
    ) -> StoreResult<Option<TeamPattern>>;

    fn track_issue(
        &self,
        repo: &str,
        issue_type: &str,
        issue_rule: &str,
        severity: &str,
        now_ms: u64,
    ) -> StoreResult<IssuePattern>;

    /// Issues for `repo` last seen at or after `since_ms`, unordered.
    fn load_issues(&self, repo: &str, since_ms: u64) -> StoreResult<Vec<IssuePattern>>;

    fn append_fix_outcome(&self, outcome: &FixOutcome) -> StoreResult<()>;

    /// Fix outcome log for `repo`, newest first.
    fn load_fix_outcomes(&self, repo: &str) -> StoreResult<Vec<FixOutcome>>;

    fn append_session(&self, session: &LearningSession) -> StoreResult<()>;

    /// Sessions for `repo` created at or after `since_ms`, newest first.
    fn load_sessions(&self, repo: &str, since_ms: u64) -> StoreResult<Vec<LearningSession>>;

    fn append_change(&self, change: &LearningChange) -> StoreResult<()>;

    /// Changes for `(repo, pattern_type)` at or after `since_ms`, newest first.
    fn load_changes(
        &self,
        repo: &str,
        pattern_type: &str,
        since_ms: u64,
    ) -> StoreResult<Vec<LearningChange>>;

    fn cleanup(&self, sweep: &RetentionSweep) -> StoreResult<CleanupReport>;

    fn health(&self) -> HealthStatus;
}

// ---------------------------------------------------------------------------
// Change records
// ---------------------------------------------------------------------------

/// Build the learning change for a pattern write.
pub fn pattern_change(
    before: Option<&TeamPattern>,
    after: &TeamPattern,
    reason: Option<String>,
    now_ms: u64,
) -> LearningChange {
    let before_confidence = before.map(|b| b.confidence).unwrap_or(0.0);
    let reason = reason.unwrap_or_else(|| match before {
        Some(b) => format!(
            "pattern updated: confidence {:.2} -> {:.2}, usage {}",
            b.confidence, after.confidence, after.usage_count
        ),
        None => format!("new pattern learned with confidence {:.2}", after.confidence),
    });
    LearningChange {
        change_id: uuid::Uuid::new_v4().to_string(),
        repo_path: after.repo_path.clone(),
        pattern_type: after.pattern_type.clone(),
        before_data: before.map(TeamPattern::snapshot),
        after_data: after.snapshot(),
        reason,
        confidence_change: after.confidence - before_confidence,
        created_at: now_ms,
    }
}

/// The row an upsert produces from the previous row, if any.
pub fn next_pattern(
    existing: Option<&TeamPattern>,
    repo: &str,
    pattern_type: &str,
    data: &Value,
    confidence: f64,
    now_ms: u64,
) -> TeamPattern {
    match existing {
        Some(prev) => TeamPattern {
            repo_path: prev.repo_path.clone(),
            pattern_type: prev.pattern_type.clone(),
            pattern_data: data.clone(),
            confidence,
            usage_count: prev.usage_count.saturating_add(1),
            created_at: prev.created_at,
            updated_at: now_ms,
        },
        None => TeamPattern {
            repo_path: repo.to_string(),
            pattern_type: pattern_type.to_string(),
            pattern_data: data.clone(),
            confidence,
            usage_count: 1,
            created_at: now_ms,
            updated_at: now_ms,
        },
    }
}

/// The row and audit entry produced by overwriting an existing pattern's
/// confidence.  Usage count and data are left as they were.
pub fn confidence_update(
    existing: &TeamPattern,
    confidence: f64,
    now_ms: u64,
) -> (TeamPattern, LearningChange) {
    let next = TeamPattern {
        confidence,
        updated_at: now_ms,
        ..existing.clone()
    };
    let reason = format!(
        "confidence adjusted {:.2} -> {:.2}",
        existing.confidence, confidence
    );
    let change = pattern_change(Some(existing), &next, Some(reason), now_ms);
    (next, change)
}

/// The row a tracked occurrence produces from the previous row, if any.
pub fn next_issue(
    existing: Option<&IssuePattern>,
    repo: &str,
    issue_type: &str,
    issue_rule: &str,
    severity: &str,
    now_ms: u64,
) -> IssuePattern {
    match existing {
        Some(prev) => IssuePattern {
            severity: severity.to_string(),
            frequency: prev.frequency.saturating_add(1),
            trend_score: prev.trend_score + TREND_INCREMENT,
            last_seen: now_ms,
            ..prev.clone()
        },
        None => IssuePattern {
            repo_path: repo.to_string(),
            issue_type: issue_type.to_string(),
            issue_rule: issue_rule.to_string(),
            severity: severity.to_string(),
            frequency: 1,
            trend_score: TREND_INCREMENT,
            last_seen: now_ms,
            created_at: now_ms,
        },
    }
}

// ---------------------------------------------------------------------------
// Derived views
// ---------------------------------------------------------------------------

fn desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Filter by type and minimum confidence, then order by confidence desc,
/// usage desc, type asc.
pub fn rank_patterns(
    mut patterns: Vec<TeamPattern>,
    pattern_type: Option<&str>,
    min_confidence: f64,
) -> Vec<TeamPattern> {
    patterns.retain(|p| {
        pattern_type.map_or(true, |t| p.pattern_type == t) && p.confidence >= min_confidence
    });
    patterns.sort_by(|a, b| {
        desc(a.confidence, b.confidence)
            .then_with(|| b.usage_count.cmp(&a.usage_count))
            .then_with(|| a.pattern_type.cmp(&b.pattern_type))
    });
    patterns
}

/// Rank windowed issues and build the frequency-weighted distributions.
pub fn issue_trends(mut issues: Vec<IssuePattern>, days_back: u64) -> IssueTrends {
    let mut by_issue_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_severity: BTreeMap<String, u64> = BTreeMap::new();
    for issue in &issues {
        *by_issue_type.entry(issue.issue_type.clone()).or_insert(0) += issue.frequency;
        *by_severity.entry(issue.severity.clone()).or_insert(0) += issue.frequency;
    }
    issues.sort_by(|a, b| {
        desc(a.trend_score, b.trend_score)
            .then_with(|| b.frequency.cmp(&a.frequency))
            .then_with(|| a.issue_type.cmp(&b.issue_type))
            .then_with(|| a.issue_rule.cmp(&b.issue_rule))
    });
    issues.truncate(TOP_ISSUE_LIMIT);
    IssueTrends {
        days_back,
        top_issues: issues,
        by_issue_type,
        by_severity,
    }
}

/// Group outcomes by fix type, ordered by fix type.
pub fn fix_success_rates(outcomes: &[FixOutcome]) -> Vec<FixSuccessRate> {
    #[derive(Default)]
    struct Acc {
        attempts: u64,
        successes: u64,
        feedback_sum: f64,
    }
    let mut groups: BTreeMap<&str, Acc> = BTreeMap::new();
    for o in outcomes {
        let acc = groups.entry(o.fix_type.as_str()).or_default();
        acc.attempts += 1;
        if o.success {
            acc.successes += 1;
        }
        acc.feedback_sum += o.feedback_score;
    }
    groups
        .into_iter()
        .map(|(fix_type, acc)| FixSuccessRate {
            fix_type: fix_type.to_string(),
            attempts: acc.attempts,
            successes: acc.successes,
            success_rate: acc.successes as f64 / acc.attempts as f64,
            avg_feedback: acc.feedback_sum / acc.attempts as f64,
        })
        .collect()
}

pub fn learning_analytics(sessions: &[LearningSession], days_back: u64) -> LearningAnalytics {
    let mut out = LearningAnalytics {
        days_back,
        ..LearningAnalytics::default()
    };
    for s in sessions {
        out.total_sessions += 1;
        out.total_patterns_learned += s.patterns_learned;
        out.total_insights_generated += s.insights_generated;
        *out.sessions_by_type.entry(s.session_type.clone()).or_insert(0) += 1;
    }
    if out.total_sessions > 0 {
        out.avg_patterns_per_session =
            out.total_patterns_learned as f64 / out.total_sessions as f64;
    }
    out
}

/// Start of a `days_back` window ending at `now_ms`.
pub fn window_start(now_ms: u64, days_back: u64) -> u64 {
    now_ms.saturating_sub(days_back.saturating_mul(MS_PER_DAY))
}

#[cfg(test)]
pub(crate) fn make_issue(issue_type: &str, rule: &str, trend: f64, freq: u64) -> IssuePattern {
    IssuePattern {
        repo_path: "/r".to_string(),
        issue_type: issue_type.to_string(),
        issue_rule: rule.to_string(),
        severity: "warning".to_string(),
        frequency: freq,
        trend_score: trend,
        last_seen: 0,
        created_at: 0,
    }
}
