//! # Stage: Atomic Backend (Redis)
//!
//! ## Responsibility
//! Lock-free implementation of [`Backend`] for many concurrent writers.
//! Every multi-key update is sent as one MULTI/EXEC batch: a pattern upsert
//! writes its hash fields, bumps `usage_count`, refreshes expiry, indexes the
//! pattern type and appends its learning change in a single unit.
//!
//! ## Key layout
//! ```text
//! <ns>:pattern:<repo>:<type>      hash   pattern_data, confidence, usage_count, created_at, updated_at
//! <ns>:issues:<repo>              hash   "<issue_type>:<issue_rule>" -> IssuePattern JSON
//! <ns>:fixes:<repo>               list   FixOutcome JSON, newest first
//! <ns>:sessions:<repo>            list   LearningSession JSON, newest first
//! <ns>:changes:<repo>:<type>      list   LearningChange JSON, newest first
//! <ns>:index:patterns:<repo>      set    known pattern types
//! ```
//! Repo, type and rule parts have `%` and `:` percent-escaped, so `a:b`/`c`
//! and `a`/`b:c` land on different keys.
//!
//! ## Guarantees
//! - Isolated: each batch is one MULTI/EXEC, so no other client's command
//!   runs inside it.  Redis has no rollback; a command failing at runtime
//!   (WRONGTYPE on a foreign key) is reported as a failed operation but the
//!   rest of the batch still applies.  There is no retry loop
//! - Cleanup never overwrites a concurrent write: log entries are removed by
//!   value, and issue and pattern purges are compare-and-act on the value the
//!   sweep read
//! - Every key touched by a write gets its expiry refreshed to the retention TTL
//! - Per-key upserts are last-writer-wins; `usage_count` uses HINCRBY so
//!   concurrent stores of one key are all counted
//!
//! ## NOT Responsible For
//! - Connection pooling (one short-lived connection per call)
//! - Cross-node consistency (single Redis primary only)

pub mod ops;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::backend::{
    confidence_update, next_issue, next_pattern, pattern_change, Backend, RetentionSweep,
    TREND_DECAY,
};
use crate::config::{RedisConfig, RetentionConfig};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    CleanupReport, FixOutcome, HealthStatus, IssuePattern, LearningChange,
    LearningSession, TeamPattern,
};

use ops::{Command, RedisOps};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Keys {
    ns: String,
}

/// Escape a caller-supplied name for use between `:` separators.
fn key_part(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`key_part`].  Every `%` in an escaped part starts `%25` or
/// `%3A`, so replacing colons first is unambiguous.
fn unescape_key_part(part: &str) -> String {
    part.replace("%3A", ":").replace("%25", "%")
}

/// Field name of an issue inside `<ns>:issues:<repo>`.
fn issue_field(issue_type: &str, issue_rule: &str) -> String {
    format!("{}:{}", key_part(issue_type), key_part(issue_rule))
}

impl Keys {
    fn pattern(&self, repo: &str, pattern_type: &str) -> String {
        format!("{}:pattern:{}:{}", self.ns, key_part(repo), key_part(pattern_type))
    }

    fn issues(&self, repo: &str) -> String {
        format!("{}:issues:{}", self.ns, key_part(repo))
    }

    fn fixes(&self, repo: &str) -> String {
        format!("{}:fixes:{}", self.ns, key_part(repo))
    }

    fn sessions(&self, repo: &str) -> String {
        format!("{}:sessions:{}", self.ns, key_part(repo))
    }

    fn changes(&self, repo: &str, pattern_type: &str) -> String {
        format!("{}:changes:{}:{}", self.ns, key_part(repo), key_part(pattern_type))
    }

    fn index_prefix(&self) -> String {
        format!("{}:index:patterns:", self.ns)
    }

    fn index(&self, repo: &str) -> String {
        format!("{}{}", self.index_prefix(), key_part(repo))
    }

    fn scan(&self, family: &str) -> String {
        format!("{}:{}:*", self.ns, family)
    }
}

/// Strip `user:password@` from a connection URL before it is reported.
pub fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{}://{}", scheme, host),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

fn redis_err(e: String) -> StoreError {
    StoreError::Redis(e)
}

fn decode<T: DeserializeOwned>(raw: &str) -> StoreResult<T> {
    Ok(serde_json::from_str(raw)?)
}

fn encode<T: Serialize>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn field<T: FromStr>(fields: &HashMap<String, String>, key: &str, name: &str) -> StoreResult<T> {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StoreError::Redis(format!("malformed field '{}' in {}", name, key)))
}

// ---------------------------------------------------------------------------
// RedisBackend
// ---------------------------------------------------------------------------

pub struct RedisBackend {
    ops: Arc<dyn RedisOps>,
    keys: Keys,
    target: String,
    retention: RetentionConfig,
}

impl RedisBackend {
    /// Connect and PING.  Any failure is returned, never papered over.
    #[cfg(feature = "redis-backing")]
    pub fn connect(config: RedisConfig, retention: RetentionConfig) -> StoreResult<Self> {
        let timeout = std::time::Duration::from_millis(config.connect_timeout_ms);
        let connector = ops::RedisConnector::open(&config.url, timeout)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {}", e)))?;
        connector
            .ping()
            .map_err(|e| StoreError::Unavailable(format!("redis ping failed: {}", e)))?;
        tracing::debug!(target = %redact_url(&config.url), "redis pattern store ready");
        Ok(Self::with_ops(Arc::new(connector), config, retention))
    }

    /// Construct with an injected `RedisOps` implementation.
    pub fn with_ops(ops: Arc<dyn RedisOps>, config: RedisConfig, retention: RetentionConfig) -> Self {
        Self {
            ops,
            keys: Keys { ns: config.namespace },
            target: redact_url(&config.url),
            retention,
        }
    }

    fn ttl(&self) -> u64 {
        self.retention.key_ttl_secs()
    }

    fn exec(&self, batch: &[Command]) -> StoreResult<()> {
        self.ops.exec_atomic(batch).map_err(redis_err)
    }

    /// Commands appending `value` to a capped newest-first log.
    fn log_append(&self, key: String, value: String, cap: usize) -> [Command; 3] {
        [
            Command::LPush { key: key.clone(), value },
            Command::LTrim { key: key.clone(), start: 0, stop: cap as isize - 1 },
            Command::Expire { key, seconds: self.ttl() },
        ]
    }

    fn read_pattern(&self, repo: &str, pattern_type: &str) -> StoreResult<Option<TeamPattern>> {
        let key = self.keys.pattern(repo, pattern_type);
        let fields = self.ops.hgetall(&key).map_err(redis_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let raw_data = fields
            .get("pattern_data")
            .ok_or_else(|| StoreError::Redis(format!("missing pattern_data in {}", key)))?;
        Ok(Some(TeamPattern {
            repo_path: repo.to_string(),
            pattern_type: pattern_type.to_string(),
            pattern_data: decode(raw_data)?,
            confidence: field(&fields, &key, "confidence")?,
            usage_count: field(&fields, &key, "usage_count")?,
            created_at: field(&fields, &key, "created_at")?,
            updated_at: field(&fields, &key, "updated_at")?,
        }))
    }

    fn read_log<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Vec<T>> {
        let raw = self.ops.lrange(key, 0, -1).map_err(redis_err)?;
        raw.iter().map(|r| decode(r)).collect()
    }

    /// Queue removal of every entry at or before the cutoff, or of the whole
    /// log once its newest entry has gone idle.  Entries are removed by value
    /// from the tail, so appends and cap trims landing after the read are left
    /// alone and the key keeps the expiry its last append gave it.  Returns
    /// the number of entries queued.
    fn sweep_log<T>(
        &self,
        key: &str,
        sweep: &RetentionSweep,
        ts: impl Fn(&T) -> u64,
        batch: &mut Vec<Command>,
    ) -> StoreResult<u64>
    where
        T: DeserializeOwned,
    {
        let raw = self.ops.lrange(key, 0, -1).map_err(redis_err)?;
        let mut entries = Vec::with_capacity(raw.len());
        let mut newest: Option<u64> = None;
        for entry in raw {
            let at = match serde_json::from_str::<T>(&entry) {
                Ok(parsed) => Some(ts(&parsed)),
                Err(e) => {
                    warn!(key, error = %e, "dropping unreadable log entry");
                    None
                }
            };
            newest = newest.max(at);
            entries.push((entry, at));
        }
        let idle = newest.map_or(true, |at| at <= sweep.idle_cutoff_ms);
        let mut removed = 0;
        for (entry, at) in entries {
            if idle || at.map_or(true, |at| at <= sweep.cutoff_ms) {
                batch.push(Command::LRem { key: key.to_string(), count: -1, value: entry });
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn sweep_issues(
        &self,
        key: &str,
        sweep: &RetentionSweep,
        report: &mut CleanupReport,
        batch: &mut Vec<Command>,
    ) -> StoreResult<()> {
        let fields = self.ops.hgetall(key).map_err(redis_err)?;
        for (name, raw) in fields {
            let mut issue: IssuePattern = match serde_json::from_str(&raw) {
                Ok(i) => i,
                Err(e) => {
                    warn!(key, error = %e, "dropping unreadable issue entry");
                    batch.push(Command::HDelIfEq { key: key.to_string(), field: name, expected: raw });
                    continue;
                }
            };
            if issue.last_seen <= sweep.idle_cutoff_ms {
                report.issues_expired += 1;
                batch.push(Command::HDelIfEq { key: key.to_string(), field: name, expected: raw });
            } else if issue.last_seen <= sweep.cutoff_ms {
                issue.trend_score *= TREND_DECAY;
                report.issues_decayed += 1;
                batch.push(Command::HSetIfEq {
                    key: key.to_string(),
                    field: name,
                    expected: raw,
                    value: encode(&issue)?,
                });
            }
        }
        Ok(())
    }

    fn sweep_patterns(
        &self,
        index_key: &str,
        repo: &str,
        sweep: &RetentionSweep,
        report: &mut CleanupReport,
        batch: &mut Vec<Command>,
    ) -> StoreResult<()> {
        for pattern_type in self.ops.smembers(index_key).map_err(redis_err)? {
            let key = self.keys.pattern(repo, &pattern_type);
            match self.read_pattern(repo, &pattern_type)? {
                Some(p) if p.updated_at > sweep.idle_cutoff_ms => continue,
                Some(p) => {
                    report.patterns_expired += 1;
                    batch.push(Command::DelIfFieldEq {
                        key: key.clone(),
                        field: "updated_at".to_string(),
                        expected: p.updated_at.to_string(),
                    });
                }
                None => {}
            }
            batch.push(Command::SRemIfMissing {
                key: index_key.to_string(),
                member: pattern_type,
                witness: key,
            });
        }
        Ok(())
    }

    fn scan(&self, family: &str) -> StoreResult<Vec<String>> {
        self.ops.scan_keys(&self.keys.scan(family)).map_err(redis_err)
    }
}

impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn upsert_pattern(
        &self,
        repo: &str,
        pattern_type: &str,
        data: &Value,
        confidence: f64,
        now_ms: u64,
    ) -> StoreResult<TeamPattern> {
        let existing = self.read_pattern(repo, pattern_type)?;
        let next = next_pattern(existing.as_ref(), repo, pattern_type, data, confidence, now_ms);
        let change = pattern_change(existing.as_ref(), &next, None, now_ms);

        let key = self.keys.pattern(repo, pattern_type);
        let index = self.keys.index(repo);
        let mut fields = vec![
            ("pattern_data".to_string(), encode(&next.pattern_data)?),
            ("confidence".to_string(), next.confidence.to_string()),
            ("updated_at".to_string(), next.updated_at.to_string()),
        ];
        if existing.is_none() {
            fields.push(("created_at".to_string(), next.created_at.to_string()));
        }
        let mut batch = vec![
            Command::HSet { key: key.clone(), fields },
            Command::HIncrBy { key: key.clone(), field: "usage_count".to_string(), delta: 1 },
            Command::Expire { key, seconds: self.ttl() },
            Command::SAdd { key: index.clone(), member: pattern_type.to_string() },
            Command::Expire { key: index, seconds: self.ttl() },
        ];
        batch.extend(self.log_append(
            self.keys.changes(repo, pattern_type),
            encode(&change)?,
            self.retention.change_cap,
        ));
        self.exec(&batch)?;
        Ok(next)
    }

    fn load_patterns(&self, repo: &str) -> StoreResult<Vec<TeamPattern>> {
        let types = self.ops.smembers(&self.keys.index(repo)).map_err(redis_err)?;
        let mut out = Vec::with_capacity(types.len());
        for pattern_type in types {
            if let Some(p) = self.read_pattern(repo, &pattern_type)? {
                out.push(p);
            }
        }
        Ok(out)
    }

    fn set_confidence(
        &self,
        repo: &str,
        pattern_type: &str,
        confidence: f64,
        now_ms: u64,
    ) -> StoreResult<Option<TeamPattern>> {
        let Some(existing) = self.read_pattern(repo, pattern_type)? else {
            return Ok(None);
        };
        let (next, change) = confidence_update(&existing, confidence, now_ms);
        let key = self.keys.pattern(repo, pattern_type);
        let mut batch = vec![
            Command::HSet {
                key: key.clone(),
                fields: vec![
                    ("confidence".to_string(), next.confidence.to_string()),
                    ("updated_at".to_string(), next.updated_at.to_string()),
                ],
            },
            Command::Expire { key, seconds: self.ttl() },
            Command::Expire { key: self.keys.index(repo), seconds: self.ttl() },
        ];
        batch.extend(self.log_append(
            self.keys.changes(repo, pattern_type),
            encode(&change)?,
            self.retention.change_cap,
        ));
        self.exec(&batch)?;
        Ok(Some(next))
    }

    fn track_issue(
        &self,
        repo: &str,
        issue_type: &str,
        issue_rule: &str,
        severity: &str,
        now_ms: u64,
    ) -> StoreResult<IssuePattern> {
        let key = self.keys.issues(repo);
        let name = issue_field(issue_type, issue_rule);
        let existing: Option<IssuePattern> = match self.ops.hget(&key, &name).map_err(redis_err)? {
            Some(raw) => Some(decode(&raw)?),
            None => None,
        };
        let next = next_issue(existing.as_ref(), repo, issue_type, issue_rule, severity, now_ms);
        self.exec(&[
            Command::HSet { key: key.clone(), fields: vec![(name, encode(&next)?)] },
            Command::Expire { key, seconds: self.ttl() },
        ])?;
        Ok(next)
    }

    fn load_issues(&self, repo: &str, since_ms: u64) -> StoreResult<Vec<IssuePattern>> {
        let fields = self.ops.hgetall(&self.keys.issues(repo)).map_err(redis_err)?;
        let mut out = Vec::with_capacity(fields.len());
        for raw in fields.values() {
            let issue: IssuePattern = decode(raw)?;
            if issue.last_seen >= since_ms {
                out.push(issue);
            }
        }
        Ok(out)
    }

    fn append_fix_outcome(&self, outcome: &FixOutcome) -> StoreResult<()> {
        let batch = self.log_append(
            self.keys.fixes(&outcome.repo_path),
            encode(outcome)?,
            self.retention.fix_outcome_cap,
        );
        self.exec(&batch)
    }

    fn load_fix_outcomes(&self, repo: &str) -> StoreResult<Vec<FixOutcome>> {
        self.read_log(&self.keys.fixes(repo))
    }

    fn append_session(&self, session: &LearningSession) -> StoreResult<()> {
        let batch = self.log_append(
            self.keys.sessions(&session.repo_path),
            encode(session)?,
            self.retention.session_cap,
        );
        self.exec(&batch)
    }

    fn load_sessions(&self, repo: &str, since_ms: u64) -> StoreResult<Vec<LearningSession>> {
        let mut sessions: Vec<LearningSession> = self.read_log(&self.keys.sessions(repo))?;
        sessions.retain(|s| s.created_at >= since_ms);
        Ok(sessions)
    }

    fn append_change(&self, change: &LearningChange) -> StoreResult<()> {
        let batch = self.log_append(
            self.keys.changes(&change.repo_path, &change.pattern_type),
            encode(change)?,
            self.retention.change_cap,
        );
        self.exec(&batch)
    }

    fn load_changes(
        &self,
        repo: &str,
        pattern_type: &str,
        since_ms: u64,
    ) -> StoreResult<Vec<LearningChange>> {
        let mut changes: Vec<LearningChange> =
            self.read_log(&self.keys.changes(repo, pattern_type))?;
        changes.retain(|c| c.created_at >= since_ms);
        Ok(changes)
    }

    fn cleanup(&self, sweep: &RetentionSweep) -> StoreResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let mut batch = Vec::new();

        for key in self.scan("fixes")? {
            report.fix_outcomes_removed +=
                self.sweep_log::<FixOutcome>(&key, sweep, |o| o.applied_at, &mut batch)?;
        }
        for key in self.scan("sessions")? {
            report.sessions_removed +=
                self.sweep_log::<LearningSession>(&key, sweep, |s| s.created_at, &mut batch)?;
        }
        for key in self.scan("changes")? {
            report.changes_removed +=
                self.sweep_log::<LearningChange>(&key, sweep, |c| c.created_at, &mut batch)?;
        }
        let index_prefix = self.keys.index_prefix();
        for key in self.ops.scan_keys(&format!("{}*", index_prefix)).map_err(redis_err)? {
            let Some(repo) = key.strip_prefix(&index_prefix).map(unescape_key_part) else {
                continue;
            };
            self.sweep_patterns(&key, &repo, sweep, &mut report, &mut batch)?;
        }
        for key in self.scan("issues")? {
            self.sweep_issues(&key, sweep, &mut report, &mut batch)?;
        }

        self.exec(&batch)?;
        Ok(report)
    }

    fn health(&self) -> HealthStatus {
        match self.ops.ping() {
            Ok(()) => HealthStatus {
                backend: self.name().to_string(),
                healthy: true,
                target: self.target.clone(),
                detail: Some(format!("namespace {}", self.keys.ns)),
            },
            Err(e) => HealthStatus {
                backend: self.name().to_string(),
                healthy: false,
                target: self.target.clone(),
                detail: Some(e),
            },
        }
    }
}
