//! The Redis command seam used by [`super::RedisBackend`].
//!
//! Writes are expressed as a list of [`Command`]s and handed to
//! [`RedisOps::exec_atomic`] as one MULTI/EXEC transaction.  Reads are plain
//! single-command calls.  Errors cross the seam as `String`s and are mapped
//! to `StoreError::Redis` by the backend.
//!
//! The `*If*` commands are compare-and-act steps evaluated by the server
//! inside the transaction, so a decision made from an earlier read is
//! dropped when another client changed the value in between.

use std::collections::HashMap;

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    HSet { key: String, fields: Vec<(String, String)> },
    HIncrBy { key: String, field: String, delta: i64 },
    SAdd { key: String, member: String },
    LPush { key: String, value: String },
    LTrim { key: String, start: isize, stop: isize },
    /// LREM semantics: negative `count` removes from the tail.
    LRem { key: String, count: isize, value: String },
    Expire { key: String, seconds: u64 },
    /// Set `field` to `value` only while it still holds `expected`.
    HSetIfEq { key: String, field: String, expected: String, value: String },
    /// Delete `field` only while it still holds `expected`.
    HDelIfEq { key: String, field: String, expected: String },
    /// Delete the whole hash only while `field` still holds `expected`.
    DelIfFieldEq { key: String, field: String, expected: String },
    /// Remove `member` from the set only if `witness` no longer exists.
    SRemIfMissing { key: String, member: String, witness: String },
}

/// Abstraction over the Redis operations needed by `RedisBackend`.
/// Implemented by [`RedisConnector`] and by `MockRedisOps` in tests.
pub trait RedisOps: Send + Sync {
    /// Run every command in order as one MULTI/EXEC transaction.  No other
    /// client's command runs in between.  Like EXEC, a command failing at
    /// runtime does not undo the ones before it; the first error is returned.
    fn exec_atomic(&self, batch: &[Command]) -> Result<(), String>;
    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, String>;
    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, String>;
    fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, String>;
    fn smembers(&self, key: &str) -> Result<Vec<String>, String>;
    /// Every key matching a glob `pattern`, via incremental SCAN.
    fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, String>;
    fn ping(&self) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// redis::Client impl
// ---------------------------------------------------------------------------

#[cfg(feature = "redis-backing")]
pub use connector::RedisConnector;

#[cfg(feature = "redis-backing")]
mod connector {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{Command, RedisOps};

    /// Opens a fresh blocking connection per call, so concurrent callers
    /// never share a connection and no client-side lock is held.
    pub struct RedisConnector {
        client: redis::Client,
        timeout: Duration,
    }

    impl RedisConnector {
        pub fn open(url: &str, timeout: Duration) -> Result<Self, String> {
            let client = redis::Client::open(url).map_err(|e| e.to_string())?;
            Ok(Self { client, timeout })
        }

        fn conn(&self) -> Result<redis::Connection, String> {
            self.client
                .get_connection_with_timeout(self.timeout)
                .map_err(|e| format!("Redis connection failed: {}", e))
        }
    }

    const HSET_IF_EQ: &str = "if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then \
         return redis.call('HSET', KEYS[1], ARGV[1], ARGV[3]) end return 0";
    const HDEL_IF_EQ: &str = "if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then \
         return redis.call('HDEL', KEYS[1], ARGV[1]) end return 0";
    const DEL_IF_FIELD_EQ: &str = "if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then \
         return redis.call('DEL', KEYS[1]) end return 0";
    const SREM_IF_MISSING: &str = "if redis.call('EXISTS', KEYS[2]) == 0 then \
         return redis.call('SREM', KEYS[1], ARGV[1]) end return 0";

    fn push_command(pipe: &mut redis::Pipeline, command: &Command) {
        match command {
            Command::HSet { key, fields } => {
                let p = pipe.cmd("HSET").arg(key);
                for (field, value) in fields {
                    p.arg(field).arg(value);
                }
            }
            Command::HIncrBy { key, field, delta } => {
                pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta);
            }
            Command::SAdd { key, member } => {
                pipe.cmd("SADD").arg(key).arg(member);
            }
            Command::LPush { key, value } => {
                pipe.cmd("LPUSH").arg(key).arg(value);
            }
            Command::LTrim { key, start, stop } => {
                pipe.cmd("LTRIM").arg(key).arg(*start).arg(*stop);
            }
            Command::LRem { key, count, value } => {
                pipe.cmd("LREM").arg(key).arg(*count).arg(value);
            }
            Command::Expire { key, seconds } => {
                pipe.cmd("EXPIRE").arg(key).arg(*seconds);
            }
            Command::HSetIfEq { key, field, expected, value } => {
                pipe.cmd("EVAL")
                    .arg(HSET_IF_EQ)
                    .arg(1)
                    .arg(key)
                    .arg(field)
                    .arg(expected)
                    .arg(value);
            }
            Command::HDelIfEq { key, field, expected } => {
                pipe.cmd("EVAL").arg(HDEL_IF_EQ).arg(1).arg(key).arg(field).arg(expected);
            }
            Command::DelIfFieldEq { key, field, expected } => {
                pipe.cmd("EVAL")
                    .arg(DEL_IF_FIELD_EQ)
                    .arg(1)
                    .arg(key)
                    .arg(field)
                    .arg(expected);
            }
            Command::SRemIfMissing { key, member, witness } => {
                pipe.cmd("EVAL")
                    .arg(SREM_IF_MISSING)
                    .arg(2)
                    .arg(key)
                    .arg(witness)
                    .arg(member);
            }
        }
        pipe.ignore();
    }

    impl RedisOps for RedisConnector {
        fn exec_atomic(&self, batch: &[Command]) -> Result<(), String> {
            if batch.is_empty() {
                return Ok(());
            }
            let mut conn = self.conn()?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            for command in batch {
                push_command(&mut pipe, command);
            }
            pipe.query::<()>(&mut conn).map_err(|e| e.to_string())
        }

        fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, String> {
            let mut conn = self.conn()?;
            redis::cmd("HGETALL")
                .arg(key)
                .query::<HashMap<String, String>>(&mut conn)
                .map_err(|e| e.to_string())
        }

        fn hget(&self, key: &str, field: &str) -> Result<Option<String>, String> {
            let mut conn = self.conn()?;
            redis::cmd("HGET")
                .arg(key)
                .arg(field)
                .query::<Option<String>>(&mut conn)
                .map_err(|e| e.to_string())
        }

        fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, String> {
            let mut conn = self.conn()?;
            redis::cmd("LRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query::<Vec<String>>(&mut conn)
                .map_err(|e| e.to_string())
        }

        fn smembers(&self, key: &str) -> Result<Vec<String>, String> {
            let mut conn = self.conn()?;
            redis::cmd("SMEMBERS")
                .arg(key)
                .query::<Vec<String>>(&mut conn)
                .map_err(|e| e.to_string())
        }

        fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, String> {
            let mut conn = self.conn()?;
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query(&mut conn)
                    .map_err(|e| e.to_string())?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort_unstable();
            keys.dedup();
            Ok(keys)
        }

        fn ping(&self) -> Result<(), String> {
            let mut conn = self.conn()?;
            redis::cmd("PING")
                .query::<String>(&mut conn)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
    }
}
