//! Records persisted by the store and the derived views computed from them.
//!
//! Timestamps are milliseconds since the Unix epoch throughout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A learned coding convention for one repository and category.
///
/// Unique per `(repo_path, pattern_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamPattern {
    pub repo_path: String,
    pub pattern_type: String,
    /// Sanitized, opaque pattern document.
    pub pattern_data: Value,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    /// Number of times this key has been stored.
    pub usage_count: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TeamPattern {
    /// Snapshot used as the before/after image of a learning change.
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "pattern_data": self.pattern_data,
            "confidence": self.confidence,
            "usage_count": self.usage_count,
        })
    }
}

/// A recurring issue rule, keyed by `(repo_path, issue_type, issue_rule)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuePattern {
    pub repo_path: String,
    pub issue_type: String,
    pub issue_rule: String,
    pub severity: String,
    pub frequency: u64,
    /// +0.1 per occurrence, ×0.9 per retention sweep once stale.
    pub trend_score: f64,
    pub last_seen: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub repo_path: String,
    pub issue_type: String,
    pub fix_type: String,
    pub success: bool,
    /// Within `[-1, 1]`.
    pub feedback_score: f64,
    pub applied_at: u64,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSession {
    pub repo_path: String,
    pub session_type: String,
    pub patterns_learned: u64,
    pub insights_generated: u64,
    #[serde(default)]
    pub session_data: Value,
    pub created_at: u64,
}

/// One audit entry describing how a pattern changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningChange {
    pub change_id: String,
    pub repo_path: String,
    pub pattern_type: String,
    pub before_data: Option<Value>,
    pub after_data: Value,
    pub reason: String,
    pub confidence_change: f64,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// Derived views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueTrends {
    pub days_back: u64,
    /// Ranked by trend score then frequency, at most 20 entries.
    pub top_issues: Vec<IssuePattern>,
    /// Frequency-weighted counts over every issue in the window.
    pub by_issue_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixSuccessRate {
    pub fix_type: String,
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub avg_feedback: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningAnalytics {
    pub days_back: u64,
    pub total_sessions: u64,
    pub total_patterns_learned: u64,
    pub total_insights_generated: u64,
    pub avg_patterns_per_session: f64,
    pub sessions_by_type: BTreeMap<String, u64>,
}

/// Per-pattern-type confidence figures feeding the recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeConfidence {
    pub pattern_type: String,
    pub count: u64,
    pub average_confidence: f64,
    pub high_confidence_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightsSummary {
    pub confidence_by_type: Vec<TypeConfidence>,
    pub top_trending: Vec<IssuePattern>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveInsights {
    pub repo_path: String,
    pub backend: String,
    pub generated_at: u64,
    pub team_patterns: Vec<TeamPattern>,
    pub issue_trends: IssueTrends,
    pub fix_success_rates: Vec<FixSuccessRate>,
    pub learning_analytics: LearningAnalytics,
    pub summary: InsightsSummary,
}

/// Portable per-repository snapshot; the only migration path between backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub repo_path: String,
    pub exported_at: u64,
    pub team_patterns: Vec<TeamPattern>,
    pub issue_trends: IssueTrends,
    pub fix_success_rates: Vec<FixSuccessRate>,
    pub learning_analytics: LearningAnalytics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub backend: String,
    pub healthy: bool,
    /// Database path or Redis endpoint with credentials stripped.
    pub target: String,
    pub detail: Option<String>,
}

/// What a retention sweep removed or changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub fix_outcomes_removed: u64,
    pub sessions_removed: u64,
    pub changes_removed: u64,
    pub issues_decayed: u64,
    pub patterns_expired: u64,
    pub issues_expired: u64,
}

impl CleanupReport {
    pub fn total_removed(&self) -> u64 {
        self.fix_outcomes_removed
            + self.sessions_removed
            + self.changes_removed
            + self.patterns_expired
            + self.issues_expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_carries_confidence_and_usage() {
        let p = TeamPattern {
            repo_path: "/r".into(),
            pattern_type: "naming".into(),
            pattern_data: serde_json::json!({"v": 1}),
            confidence: 0.5,
            usage_count: 3,
            created_at: 1,
            updated_at: 2,
        };
        let snap = p.snapshot();
        assert_eq!(snap["confidence"], 0.5);
        assert_eq!(snap["usage_count"], 3);
        assert_eq!(snap["pattern_data"]["v"], 1);
    }

    #[test]
    fn test_fix_outcome_metadata_defaults_to_null() {
        let json = r#"{"repo_path":"/r","issue_type":"t","fix_type":"f","success":true,
                       "feedback_score":0.0,"applied_at":5}"#;
        let f: FixOutcome = serde_json::from_str(json).unwrap();
        assert!(f.metadata.is_null());
    }

    #[test]
    fn test_cleanup_report_total() {
        let r = CleanupReport {
            fix_outcomes_removed: 1,
            sessions_removed: 2,
            changes_removed: 3,
            issues_decayed: 100,
            patterns_expired: 4,
            issues_expired: 5,
        };
        assert_eq!(r.total_removed(), 15);
    }
}
