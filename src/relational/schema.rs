//! SQLite schema for the relational backend.
//!
//! Timestamps are INTEGER milliseconds since the Unix epoch.  `id` columns
//! give every append-only log its insertion order.

pub const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

-- ============================================
-- PATTERNS
-- ============================================

CREATE TABLE IF NOT EXISTS team_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_path TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    pattern_data TEXT NOT NULL,             -- sanitized JSON document
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    usage_count INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(repo_path, pattern_type)
);

CREATE INDEX IF NOT EXISTS idx_team_patterns_repo ON team_patterns(repo_path);

CREATE TABLE IF NOT EXISTS issue_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_path TEXT NOT NULL,
    issue_type TEXT NOT NULL,
    issue_rule TEXT NOT NULL,
    severity TEXT NOT NULL,
    frequency INTEGER NOT NULL DEFAULT 1,
    trend_score REAL NOT NULL DEFAULT 0.1,
    last_seen INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(repo_path, issue_type, issue_rule)
);

CREATE INDEX IF NOT EXISTS idx_issue_patterns_repo ON issue_patterns(repo_path, last_seen);

-- ============================================
-- APPEND-ONLY LOGS
-- ============================================

CREATE TABLE IF NOT EXISTS fix_outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_path TEXT NOT NULL,
    issue_type TEXT NOT NULL,
    fix_type TEXT NOT NULL,
    success INTEGER NOT NULL,               -- 0 / 1
    feedback_score REAL NOT NULL CHECK (feedback_score >= -1.0 AND feedback_score <= 1.0),
    applied_at INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT 'null'
);

CREATE INDEX IF NOT EXISTS idx_fix_outcomes_repo ON fix_outcomes(repo_path);

CREATE TABLE IF NOT EXISTS learning_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_path TEXT NOT NULL,
    session_type TEXT NOT NULL,
    patterns_learned INTEGER NOT NULL DEFAULT 0,
    insights_generated INTEGER NOT NULL DEFAULT 0,
    session_data TEXT NOT NULL DEFAULT 'null',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_learning_sessions_repo ON learning_sessions(repo_path);

CREATE TABLE IF NOT EXISTS learning_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_id TEXT NOT NULL UNIQUE,
    repo_path TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    before_data TEXT,                       -- NULL for a newly learned pattern
    after_data TEXT NOT NULL,
    reason TEXT NOT NULL,
    confidence_change REAL NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_learning_history_repo ON learning_history(repo_path, pattern_type);
"#;

/// Tables owned by the store, in creation order.
pub const TABLES: [&str; 5] = [
    "team_patterns",
    "issue_patterns",
    "fix_outcomes",
    "learning_sessions",
    "learning_history",
];
