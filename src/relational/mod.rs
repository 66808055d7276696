//! # Stage: Relational Backend (SQLite)
//!
//! ## Responsibility
//! Transactional implementation of [`Backend`].  Every logical write opens
//! its own connection, runs inside one `BEGIN IMMEDIATE` transaction (upsert
//! plus audit append together) and commits or rolls back as a unit.
//!
//! ## Guarantees
//! - Atomic: a pattern upsert and its learning change commit together
//! - Contention-tolerant: a locked database is retried up to
//!   `max_attempts` times, sleeping `attempt * retry_backoff_ms` in between
//! - Released: connections and transactions are dropped on every exit path,
//!   which rolls back anything uncommitted
//!
//! ## NOT Responsible For
//! - Validation or anonymization (done by `PatternStore` before calling in)

mod schema;

use std::path::Path;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{
    confidence_update, next_issue, next_pattern, pattern_change, Backend, RetentionSweep,
    TREND_DECAY,
};
use crate::config::{RetentionConfig, SqliteConfig};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    CleanupReport, FixOutcome, HealthStatus, IssuePattern, LearningChange, LearningSession,
    TeamPattern,
};

use schema::{SCHEMA, TABLES};

pub struct SqliteBackend {
    config: SqliteConfig,
    retention: RetentionConfig,
}

impl SqliteBackend {
    /// Create the database file (and parent directory) if needed and apply
    /// the schema.
    pub fn open(config: SqliteConfig, retention: RetentionConfig) -> StoreResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let backend = Self { config, retention };
        let conn = backend.connect()?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %backend.config.path.display(), "sqlite pattern store ready");
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.config.path)?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        Ok(conn)
    }

    fn with_read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction, retrying while the database
    /// is locked by another writer.
    fn with_write<T>(
        &self,
        op: &'static str,
        f: impl Fn(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.try_write(&f) {
                Ok(value) => return Ok(value),
                Err(StoreError::Sqlite(e)) if is_contention(&e) => {
                    if attempt == attempts {
                        break;
                    }
                    let backoff_ms = self.config.retry_backoff_ms.saturating_mul(attempt as u64);
                    warn!(op, attempt, backoff_ms, "sqlite write contended; retrying");
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
                Err(e) => return Err(e),
            }
        }
        warn!(op, attempts, "sqlite write gave up after repeated contention");
        Err(StoreError::Contention { attempts })
    }

    fn try_write<T>(&self, f: &impl Fn(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn is_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn ms_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    Ok(v.max(0) as u64)
}

const PATTERN_COLS: &str =
    "repo_path, pattern_type, pattern_data, confidence, usage_count, created_at, updated_at";

fn row_to_pattern(row: &Row<'_>) -> rusqlite::Result<TeamPattern> {
    Ok(TeamPattern {
        repo_path: row.get(0)?,
        pattern_type: row.get(1)?,
        pattern_data: json_col(row, 2)?,
        confidence: row.get(3)?,
        usage_count: ms_col(row, 4)?,
        created_at: ms_col(row, 5)?,
        updated_at: ms_col(row, 6)?,
    })
}

const ISSUE_COLS: &str =
    "repo_path, issue_type, issue_rule, severity, frequency, trend_score, last_seen, created_at";

fn row_to_issue(row: &Row<'_>) -> rusqlite::Result<IssuePattern> {
    Ok(IssuePattern {
        repo_path: row.get(0)?,
        issue_type: row.get(1)?,
        issue_rule: row.get(2)?,
        severity: row.get(3)?,
        frequency: ms_col(row, 4)?,
        trend_score: row.get(5)?,
        last_seen: ms_col(row, 6)?,
        created_at: ms_col(row, 7)?,
    })
}

fn select_pattern(
    conn: &Connection,
    repo: &str,
    pattern_type: &str,
) -> StoreResult<Option<TeamPattern>> {
    let sql = format!(
        "SELECT {} FROM team_patterns WHERE repo_path = ?1 AND pattern_type = ?2",
        PATTERN_COLS
    );
    Ok(conn
        .query_row(&sql, params![repo, pattern_type], row_to_pattern)
        .optional()?)
}

fn write_pattern(conn: &Connection, p: &TeamPattern) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO team_patterns
             (repo_path, pattern_type, pattern_data, confidence, usage_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(repo_path, pattern_type) DO UPDATE SET
             pattern_data = excluded.pattern_data,
             confidence = excluded.confidence,
             usage_count = excluded.usage_count,
             updated_at = excluded.updated_at",
        params![
            p.repo_path,
            p.pattern_type,
            serde_json::to_string(&p.pattern_data)?,
            p.confidence,
            p.usage_count as i64,
            p.created_at as i64,
            p.updated_at as i64,
        ],
    )?;
    Ok(())
}

fn insert_change(conn: &Connection, c: &LearningChange, cap: usize) -> StoreResult<()> {
    let before = c.before_data.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO learning_history
             (change_id, repo_path, pattern_type, before_data, after_data, reason,
              confidence_change, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            c.change_id,
            c.repo_path,
            c.pattern_type,
            before,
            serde_json::to_string(&c.after_data)?,
            c.reason,
            c.confidence_change,
            c.created_at as i64,
        ],
    )?;
    conn.execute(
        "DELETE FROM learning_history
         WHERE repo_path = ?1 AND pattern_type = ?2 AND id NOT IN (
             SELECT id FROM learning_history
             WHERE repo_path = ?1 AND pattern_type = ?2
             ORDER BY id DESC LIMIT ?3)",
        params![c.repo_path, c.pattern_type, cap as i64],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Backend impl
// ---------------------------------------------------------------------------

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn upsert_pattern(
        &self,
        repo: &str,
        pattern_type: &str,
        data: &Value,
        confidence: f64,
        now_ms: u64,
    ) -> StoreResult<TeamPattern> {
        self.with_write("upsert_pattern", |conn| {
            let existing = select_pattern(conn, repo, pattern_type)?;
            let next = next_pattern(existing.as_ref(), repo, pattern_type, data, confidence, now_ms);
            write_pattern(conn, &next)?;
            let change = pattern_change(existing.as_ref(), &next, None, now_ms);
            insert_change(conn, &change, self.retention.change_cap)?;
            Ok(next)
        })
    }

    fn load_patterns(&self, repo: &str) -> StoreResult<Vec<TeamPattern>> {
        self.with_read(|conn| {
            let sql = format!("SELECT {} FROM team_patterns WHERE repo_path = ?1", PATTERN_COLS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![repo], row_to_pattern)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn set_confidence(
        &self,
        repo: &str,
        pattern_type: &str,
        confidence: f64,
        now_ms: u64,
    ) -> StoreResult<Option<TeamPattern>> {
        self.with_write("update_confidence", |conn| {
            let Some(existing) = select_pattern(conn, repo, pattern_type)? else {
                return Ok(None);
            };
            let (next, change) = confidence_update(&existing, confidence, now_ms);
            conn.execute(
                "UPDATE team_patterns SET confidence = ?3, updated_at = ?4
                 WHERE repo_path = ?1 AND pattern_type = ?2",
                params![repo, pattern_type, confidence, now_ms as i64],
            )?;
            insert_change(conn, &change, self.retention.change_cap)?;
            Ok(Some(next))
        })
    }

    fn track_issue(
        &self,
        repo: &str,
        issue_type: &str,
        issue_rule: &str,
        severity: &str,
        now_ms: u64,
    ) -> StoreResult<IssuePattern> {
        self.with_write("track_issue_pattern", |conn| {
            let sql = format!(
                "SELECT {} FROM issue_patterns
                 WHERE repo_path = ?1 AND issue_type = ?2 AND issue_rule = ?3",
                ISSUE_COLS
            );
            let existing = conn
                .query_row(&sql, params![repo, issue_type, issue_rule], row_to_issue)
                .optional()?;
            let next = next_issue(existing.as_ref(), repo, issue_type, issue_rule, severity, now_ms);
            conn.execute(
                "INSERT INTO issue_patterns
                     (repo_path, issue_type, issue_rule, severity, frequency, trend_score,
                      last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(repo_path, issue_type, issue_rule) DO UPDATE SET
                     severity = excluded.severity,
                     frequency = excluded.frequency,
                     trend_score = excluded.trend_score,
                     last_seen = excluded.last_seen",
                params![
                    next.repo_path,
                    next.issue_type,
                    next.issue_rule,
                    next.severity,
                    next.frequency as i64,
                    next.trend_score,
                    next.last_seen as i64,
                    next.created_at as i64,
                ],
            )?;
            Ok(next)
        })
    }

    fn load_issues(&self, repo: &str, since_ms: u64) -> StoreResult<Vec<IssuePattern>> {
        self.with_read(|conn| {
            let sql = format!(
                "SELECT {} FROM issue_patterns WHERE repo_path = ?1 AND last_seen >= ?2",
                ISSUE_COLS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![repo, since_ms as i64], row_to_issue)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn append_fix_outcome(&self, o: &FixOutcome) -> StoreResult<()> {
        let metadata = serde_json::to_string(&o.metadata)?;
        let cap = self.retention.fix_outcome_cap as i64;
        self.with_write("record_fix_outcome", |conn| {
            conn.execute(
                "INSERT INTO fix_outcomes
                     (repo_path, issue_type, fix_type, success, feedback_score, applied_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    o.repo_path,
                    o.issue_type,
                    o.fix_type,
                    o.success,
                    o.feedback_score,
                    o.applied_at as i64,
                    metadata,
                ],
            )?;
            conn.execute(
                "DELETE FROM fix_outcomes WHERE repo_path = ?1 AND id NOT IN (
                     SELECT id FROM fix_outcomes WHERE repo_path = ?1 ORDER BY id DESC LIMIT ?2)",
                params![o.repo_path, cap],
            )?;
            Ok(())
        })
    }

    fn load_fix_outcomes(&self, repo: &str) -> StoreResult<Vec<FixOutcome>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT repo_path, issue_type, fix_type, success, feedback_score, applied_at, metadata
                 FROM fix_outcomes WHERE repo_path = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![repo], |row| {
                Ok(FixOutcome {
                    repo_path: row.get(0)?,
                    issue_type: row.get(1)?,
                    fix_type: row.get(2)?,
                    success: row.get(3)?,
                    feedback_score: row.get(4)?,
                    applied_at: ms_col(row, 5)?,
                    metadata: json_col(row, 6)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn append_session(&self, s: &LearningSession) -> StoreResult<()> {
        let data = serde_json::to_string(&s.session_data)?;
        let cap = self.retention.session_cap as i64;
        self.with_write("record_learning_session", |conn| {
            conn.execute(
                "INSERT INTO learning_sessions
                     (repo_path, session_type, patterns_learned, insights_generated, session_data,
                      created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    s.repo_path,
                    s.session_type,
                    s.patterns_learned as i64,
                    s.insights_generated as i64,
                    data,
                    s.created_at as i64,
                ],
            )?;
            conn.execute(
                "DELETE FROM learning_sessions WHERE repo_path = ?1 AND id NOT IN (
                     SELECT id FROM learning_sessions WHERE repo_path = ?1 ORDER BY id DESC LIMIT ?2)",
                params![s.repo_path, cap],
            )?;
            Ok(())
        })
    }

    fn load_sessions(&self, repo: &str, since_ms: u64) -> StoreResult<Vec<LearningSession>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT repo_path, session_type, patterns_learned, insights_generated, session_data,
                        created_at
                 FROM learning_sessions WHERE repo_path = ?1 AND created_at >= ?2
                 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![repo, since_ms as i64], |row| {
                Ok(LearningSession {
                    repo_path: row.get(0)?,
                    session_type: row.get(1)?,
                    patterns_learned: ms_col(row, 2)?,
                    insights_generated: ms_col(row, 3)?,
                    session_data: json_col(row, 4)?,
                    created_at: ms_col(row, 5)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn append_change(&self, change: &LearningChange) -> StoreResult<()> {
        self.with_write("record_learning_change", |conn| {
            insert_change(conn, change, self.retention.change_cap)
        })
    }

    fn load_changes(
        &self,
        repo: &str,
        pattern_type: &str,
        since_ms: u64,
    ) -> StoreResult<Vec<LearningChange>> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT change_id, repo_path, pattern_type, before_data, after_data, reason,
                        confidence_change, created_at
                 FROM learning_history
                 WHERE repo_path = ?1 AND pattern_type = ?2 AND created_at >= ?3
                 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![repo, pattern_type, since_ms as i64], |row| {
                Ok(LearningChange {
                    change_id: row.get(0)?,
                    repo_path: row.get(1)?,
                    pattern_type: row.get(2)?,
                    before_data: opt_json_col(row, 3)?,
                    after_data: json_col(row, 4)?,
                    reason: row.get(5)?,
                    confidence_change: row.get(6)?,
                    created_at: ms_col(row, 7)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn cleanup(&self, sweep: &RetentionSweep) -> StoreResult<CleanupReport> {
        let cutoff = sweep.cutoff_ms as i64;
        let idle = sweep.idle_cutoff_ms as i64;
        self.with_write("cleanup_old_data", |conn| {
            let mut report = CleanupReport::default();

            report.fix_outcomes_removed =
                conn.execute("DELETE FROM fix_outcomes WHERE applied_at <= ?1", params![cutoff])? as u64;
            report.fix_outcomes_removed += conn.execute(
                "DELETE FROM fix_outcomes WHERE repo_path IN (
                     SELECT repo_path FROM fix_outcomes GROUP BY repo_path
                     HAVING MAX(applied_at) <= ?1)",
                params![idle],
            )? as u64;

            report.sessions_removed = conn
                .execute("DELETE FROM learning_sessions WHERE created_at <= ?1", params![cutoff])?
                as u64;
            report.sessions_removed += conn.execute(
                "DELETE FROM learning_sessions WHERE repo_path IN (
                     SELECT repo_path FROM learning_sessions GROUP BY repo_path
                     HAVING MAX(created_at) <= ?1)",
                params![idle],
            )? as u64;

            report.changes_removed = conn
                .execute("DELETE FROM learning_history WHERE created_at <= ?1", params![cutoff])?
                as u64;
            report.changes_removed += conn.execute(
                "DELETE FROM learning_history WHERE (repo_path, pattern_type) IN (
                     SELECT repo_path, pattern_type FROM learning_history
                     GROUP BY repo_path, pattern_type HAVING MAX(created_at) <= ?1)",
                params![idle],
            )? as u64;

            report.patterns_expired = conn
                .execute("DELETE FROM team_patterns WHERE updated_at <= ?1", params![idle])?
                as u64;
            report.issues_expired = conn
                .execute("DELETE FROM issue_patterns WHERE last_seen <= ?1", params![idle])?
                as u64;
            report.issues_decayed = conn.execute(
                "UPDATE issue_patterns SET trend_score = trend_score * ?2 WHERE last_seen <= ?1",
                params![cutoff, TREND_DECAY],
            )? as u64;

            Ok(report)
        })
    }

    fn health(&self) -> HealthStatus {
        let target = self.path().display().to_string();
        let probe = self.with_read(|conn| {
            for table in TABLES {
                let present: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |row| row.get(0),
                )?;
                if present == 0 {
                    return Err(StoreError::Unavailable(format!("missing table {}", table)));
                }
            }
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM team_patterns", [], |row| row.get(0))?;
            Ok(count)
        });
        match probe {
            Ok(count) => HealthStatus {
                backend: self.name().to_string(),
                healthy: true,
                target,
                detail: Some(format!("{} patterns stored", count)),
            },
            Err(e) => HealthStatus {
                backend: self.name().to_string(),
                healthy: false,
                target,
                detail: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn backend_in(dir: &TempDir) -> SqliteBackend {
        SqliteBackend::open(
            SqliteConfig::new(dir.path().join("patterns.db")),
            RetentionConfig::default(),
        )
        .unwrap()
    }

    fn fix(repo: &str, fix_type: &str, success: bool, at: u64) -> FixOutcome {
        FixOutcome {
            repo_path: repo.into(),
            issue_type: "style".into(),
            fix_type: fix_type.into(),
            success,
            feedback_score: 0.0,
            applied_at: at,
            metadata: json!({"pr": 1}),
        }
    }

    fn session(repo: &str, at: u64) -> LearningSession {
        LearningSession {
            repo_path: repo.into(),
            session_type: "review".into(),
            patterns_learned: 2,
            insights_generated: 1,
            session_data: Value::Null,
            created_at: at,
        }
    }

    #[test]
    fn test_open_creates_all_tables() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        let conn = b.connect().unwrap();
        for table in TABLES {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(n, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/p.db");
        SqliteBackend::open(SqliteConfig::new(&path), RetentionConfig::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_upsert_increments_usage_and_appends_changes() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.upsert_pattern("/r", "naming", &json!({"v": 1}), 0.4, 10).unwrap();
        let p = b.upsert_pattern("/r", "naming", &json!({"v": 2}), 0.9, 20).unwrap();
        assert_eq!(p.usage_count, 2);
        assert_eq!(p.created_at, 10);

        let stored = b.load_patterns("/r").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].pattern_data, json!({"v": 2}));

        let changes = b.load_changes("/r", "naming", 0).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[1].before_data.is_none());
        assert_eq!(changes[0].before_data.as_ref().unwrap()["confidence"], 0.4);
    }

    #[test]
    fn test_set_confidence_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        assert!(b.set_confidence("/r", "naming", 0.5, 1).unwrap().is_none());
    }

    #[test]
    fn test_set_confidence_keeps_usage_and_audits() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.upsert_pattern("/r", "naming", &json!({}), 0.4, 1).unwrap();
        let p = b.set_confidence("/r", "naming", 0.7, 2).unwrap().unwrap();
        assert_eq!(p.usage_count, 1);
        assert_eq!(p.confidence, 0.7);
        let changes = b.load_changes("/r", "naming", 0).unwrap();
        assert!(changes[0].reason.starts_with("confidence adjusted"));
    }

    #[test]
    fn test_track_issue_twice() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.track_issue("/r", "style", "E501", "low", 1).unwrap();
        let i = b.track_issue("/r", "style", "E501", "low", 2).unwrap();
        assert_eq!(i.frequency, 2);
        assert_eq!(i.trend_score, 0.2);
        let loaded = b.load_issues("/r", 0).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].trend_score, 0.2);
    }

    #[test]
    fn test_load_issues_respects_window() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.track_issue("/r", "style", "old", "low", 100).unwrap();
        b.track_issue("/r", "style", "new", "low", 900).unwrap();
        let loaded = b.load_issues("/r", 500).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].issue_rule, "new");
    }

    #[test]
    fn test_fix_outcome_log_is_capped_newest_first() {
        let dir = TempDir::new().unwrap();
        let retention = RetentionConfig {
            fix_outcome_cap: 3,
            ..RetentionConfig::default()
        };
        let b = SqliteBackend::open(SqliteConfig::new(dir.path().join("p.db")), retention).unwrap();
        for i in 0..5 {
            b.append_fix_outcome(&fix("/r", "autofix", true, i)).unwrap();
        }
        b.append_fix_outcome(&fix("/other", "autofix", true, 9)).unwrap();
        let log = b.load_fix_outcomes("/r").unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].applied_at, 4);
        assert_eq!(log[0].metadata, json!({"pr": 1}));
        assert_eq!(b.load_fix_outcomes("/other").unwrap().len(), 1);
    }

    #[test]
    fn test_session_window() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.append_session(&session("/r", 10)).unwrap();
        b.append_session(&session("/r", 1000)).unwrap();
        assert_eq!(b.load_sessions("/r", 500).unwrap().len(), 1);
        assert_eq!(b.load_sessions("/r", 0).unwrap().len(), 2);
    }

    #[test]
    fn test_cleanup_deletes_logs_and_decays_stale_issues() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.append_fix_outcome(&fix("/r", "autofix", true, 100)).unwrap();
        b.append_session(&session("/r", 100)).unwrap();
        b.upsert_pattern("/r", "naming", &json!({}), 0.5, 5_000).unwrap();
        b.track_issue("/r", "style", "E1", "low", 100).unwrap();
        b.track_issue("/r", "style", "E2", "low", 5_000).unwrap();

        let report = b
            .cleanup(&RetentionSweep { cutoff_ms: 1_000, idle_cutoff_ms: 10 })
            .unwrap();
        assert_eq!(report.fix_outcomes_removed, 1);
        assert_eq!(report.sessions_removed, 1);
        assert_eq!(report.issues_decayed, 1);
        assert_eq!(report.patterns_expired, 0);

        assert!(b.load_fix_outcomes("/r").unwrap().is_empty());
        let issues = b.load_issues("/r", 0).unwrap();
        let e1 = issues.iter().find(|i| i.issue_rule == "E1").unwrap();
        let e2 = issues.iter().find(|i| i.issue_rule == "E2").unwrap();
        assert!((e1.trend_score - 0.1 * TREND_DECAY).abs() < 1e-12);
        assert_eq!(e2.trend_score, 0.1);
        assert_eq!(b.load_patterns("/r").unwrap().len(), 1);
    }

    #[test]
    fn test_cleanup_purges_idle_patterns_and_issues() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.upsert_pattern("/r", "naming", &json!({}), 0.5, 100).unwrap();
        b.track_issue("/r", "style", "E1", "low", 100).unwrap();
        let report = b
            .cleanup(&RetentionSweep { cutoff_ms: 50, idle_cutoff_ms: 200 })
            .unwrap();
        assert_eq!(report.patterns_expired, 1);
        assert_eq!(report.issues_expired, 1);
        assert_eq!(report.changes_removed, 1);
        assert!(b.load_patterns("/r").unwrap().is_empty());
    }

    #[test]
    fn test_health_reports_pattern_count() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.upsert_pattern("/r", "naming", &json!({}), 0.5, 1).unwrap();
        let h = b.health();
        assert!(h.healthy);
        assert_eq!(h.backend, "sqlite");
        assert_eq!(h.detail.as_deref(), Some("1 patterns stored"));
    }

    #[test]
    fn test_health_flags_missing_table() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        b.connect().unwrap().execute_batch("DROP TABLE fix_outcomes;").unwrap();
        let h = b.health();
        assert!(!h.healthy);
        assert!(h.detail.unwrap().contains("fix_outcomes"));
    }

    // -------------------------------------------------------------------
    // Contention
    // -------------------------------------------------------------------

    fn fast_retry_backend(dir: &TempDir, backoff_ms: u64) -> SqliteBackend {
        let mut cfg = SqliteConfig::new(dir.path().join("locked.db"));
        cfg.busy_timeout_ms = 1;
        cfg.retry_backoff_ms = backoff_ms;
        SqliteBackend::open(cfg, RetentionConfig::default()).unwrap()
    }

    #[test]
    fn test_write_gives_up_while_locked() {
        let dir = TempDir::new().unwrap();
        let b = fast_retry_backend(&dir, 1);
        let blocker = Connection::open(b.path()).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let err = b.append_fix_outcome(&fix("/r", "autofix", true, 1)).unwrap_err();
        assert!(matches!(err, StoreError::Contention { attempts: 3 }));

        blocker.execute_batch("ROLLBACK;").unwrap();
        assert!(b.load_fix_outcomes("/r").unwrap().is_empty());
    }

    #[test]
    fn test_write_succeeds_after_lock_released() {
        let dir = TempDir::new().unwrap();
        let b = fast_retry_backend(&dir, 100);
        let path = b.path().to_path_buf();
        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = std::thread::spawn(move || {
            let conn = Connection::open(path).unwrap();
            conn.execute_batch("BEGIN EXCLUSIVE;").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            conn.execute_batch("COMMIT;").unwrap();
        });
        locked_rx.recv().unwrap();
        b.append_fix_outcome(&fix("/r", "autofix", true, 1)).unwrap();
        holder.join().unwrap();
        assert_eq!(b.load_fix_outcomes("/r").unwrap().len(), 1);
    }

    #[test]
    fn test_failed_write_rolls_back_whole_unit() {
        let dir = TempDir::new().unwrap();
        let b = backend_in(&dir);
        let result: StoreResult<()> = b.with_write("test", |conn| {
            conn.execute(
                "INSERT INTO learning_sessions (repo_path, session_type, created_at)
                 VALUES ('/r', 'x', 1)",
                [],
            )?;
            Err(StoreError::invalid("abort"))
        });
        assert!(result.is_err());
        assert!(b.load_sessions("/r", 0).unwrap().is_empty());
    }
}
