//! In-process `RedisOps` used by the backend and store tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::ops::{Command, RedisOps};

#[derive(Debug, Default)]
struct Keyspace {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    ttls: HashMap<String, u64>,
}

impl Keyspace {
    fn exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key) || self.lists.contains_key(key) || self.sets.contains_key(key)
    }

    fn wrong_type(&self, key: &str, kind: &str) -> Result<(), String> {
        let actual = if self.hashes.contains_key(key) {
            "hash"
        } else if self.lists.contains_key(key) {
            "list"
        } else if self.sets.contains_key(key) {
            "set"
        } else {
            return Ok(());
        };
        if actual == kind {
            Ok(())
        } else {
            Err(format!("WRONGTYPE {} holds a {}", key, actual))
        }
    }

    fn remove(&mut self, key: &str) {
        self.hashes.remove(key);
        self.lists.remove(key);
        self.sets.remove(key);
        self.ttls.remove(key);
    }

    /// Redis deletes keys whose collection became empty.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = self.hashes.get(key).map_or(false, |h| h.is_empty())
            || self.lists.get(key).map_or(false, |l| l.is_empty())
            || self.sets.get(key).map_or(false, |s| s.is_empty());
        if empty {
            self.remove(key);
        }
    }

    fn apply(&mut self, command: &Command) -> Result<(), String> {
        match command {
            Command::HSet { key, fields } => {
                self.wrong_type(key, "hash")?;
                let hash = self.hashes.entry(key.clone()).or_default();
                for (f, v) in fields {
                    hash.insert(f.clone(), v.clone());
                }
            }
            Command::HIncrBy { key, field, delta } => {
                self.wrong_type(key, "hash")?;
                let hash = self.hashes.entry(key.clone()).or_default();
                let current: i64 = match hash.get(field) {
                    Some(v) => v
                        .parse()
                        .map_err(|_| "ERR hash value is not an integer".to_string())?,
                    None => 0,
                };
                hash.insert(field.clone(), (current + delta).to_string());
            }
            Command::SAdd { key, member } => {
                self.wrong_type(key, "set")?;
                self.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            Command::LPush { key, value } => {
                self.wrong_type(key, "list")?;
                self.lists.entry(key.clone()).or_default().insert(0, value.clone());
            }
            Command::LTrim { key, start, stop } => {
                self.wrong_type(key, "list")?;
                if let Some(list) = self.lists.get_mut(key) {
                    let (s, e) = resolve_range(list.len(), *start, *stop);
                    *list = if s < e { list[s..e].to_vec() } else { Vec::new() };
                }
                self.drop_if_empty(key);
            }
            Command::LRem { key, count, value } => {
                self.wrong_type(key, "list")?;
                if let Some(list) = self.lists.get_mut(key) {
                    let limit = if *count == 0 { usize::MAX } else { count.unsigned_abs() };
                    let mut hits: Vec<usize> = list
                        .iter()
                        .enumerate()
                        .filter(|(_, v)| *v == value)
                        .map(|(i, _)| i)
                        .collect();
                    if *count < 0 {
                        hits.reverse();
                    }
                    hits.truncate(limit);
                    hits.sort_unstable();
                    for i in hits.into_iter().rev() {
                        list.remove(i);
                    }
                }
                self.drop_if_empty(key);
            }
            Command::Expire { key, seconds } => {
                if self.exists(key) {
                    self.ttls.insert(key.clone(), *seconds);
                }
            }
            Command::HSetIfEq { key, field, expected, value } => {
                if self.hash_field_is(key, field, expected)? {
                    if let Some(hash) = self.hashes.get_mut(key) {
                        hash.insert(field.clone(), value.clone());
                    }
                }
            }
            Command::HDelIfEq { key, field, expected } => {
                if self.hash_field_is(key, field, expected)? {
                    if let Some(hash) = self.hashes.get_mut(key) {
                        hash.remove(field);
                    }
                    self.drop_if_empty(key);
                }
            }
            Command::DelIfFieldEq { key, field, expected } => {
                if self.hash_field_is(key, field, expected)? {
                    self.remove(key);
                }
            }
            Command::SRemIfMissing { key, member, witness } => {
                self.wrong_type(key, "set")?;
                if !self.exists(witness) {
                    if let Some(set) = self.sets.get_mut(key) {
                        set.remove(member);
                    }
                    self.drop_if_empty(key);
                }
            }
        }
        Ok(())
    }

    fn hash_field_is(&self, key: &str, field: &str, expected: &str) -> Result<bool, String> {
        self.wrong_type(key, "hash")?;
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .map_or(false, |v| v == expected))
    }
}

/// Convert Redis inclusive (possibly negative) indices to a half-open range.
fn resolve_range(len: usize, start: isize, stop: isize) -> (usize, usize) {
    let len = len as isize;
    let norm = |i: isize| if i < 0 { (len + i).max(0) } else { i };
    let s = norm(start).min(len);
    let e = (norm(stop) + 1).min(len);
    (s as usize, e.max(s) as usize)
}

type Interleaved = Box<dyn FnOnce() + Send>;

/// Mock mirroring the subset of Redis the atomic backend uses.  Batches
/// behave like EXEC: commands run in order under one lock, a runtime error
/// is reported but does not undo earlier commands, and an injected abort
/// discards the whole batch.
#[derive(Default)]
pub struct MockRedisOps {
    state: Mutex<Keyspace>,
    fail_next_batch: AtomicBool,
    fail_ping: AtomicBool,
    before_next_batch: Mutex<Option<Interleaved>>,
}

impl MockRedisOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `exec_atomic` call fail without applying anything.
    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    /// Run `other_client` right before the next batch executes, as if another
    /// writer's transaction landed between this client's reads and its EXEC.
    pub fn before_next_batch(&self, other_client: impl FnOnce() + Send + 'static) {
        *self.before_next_batch.lock().unwrap() = Some(Box::new(other_client));
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// Simulate a key reaching its TTL.
    pub fn expire_now(&self, key: &str) {
        self.state.lock().unwrap().remove(key);
    }

    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.state.lock().unwrap().ttls.get(key).copied()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.state.lock().unwrap().exists(key)
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.state.lock().unwrap().lists.get(key).map_or(0, Vec::len)
    }

    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut keys: Vec<String> = state
            .hashes
            .keys()
            .chain(state.lists.keys())
            .chain(state.sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl RedisOps for MockRedisOps {
    fn exec_atomic(&self, batch: &[Command]) -> Result<(), String> {
        let other_client = self.before_next_batch.lock().unwrap().take();
        if let Some(other_client) = other_client {
            other_client();
        }
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err("mock EXECABORT".to_string());
        }
        let mut state = self.state.lock().unwrap();
        let mut first_error = None;
        for command in batch {
            if let Err(e) = state.apply(command) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, String> {
        let state = self.state.lock().unwrap();
        state.wrong_type(key, "hash")?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, String> {
        let state = self.state.lock().unwrap();
        state.wrong_type(key, "hash")?;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, String> {
        let state = self.state.lock().unwrap();
        state.wrong_type(key, "list")?;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let (s, e) = resolve_range(list.len(), start, stop);
        Ok(list[s..e].to_vec())
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>, String> {
        let state = self.state.lock().unwrap();
        state.wrong_type(key, "set")?;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, String> {
        let matches = |k: &String| match pattern.strip_suffix('*') {
            Some(prefix) => k.starts_with(prefix),
            None => k == pattern,
        };
        Ok(self.keys().into_iter().filter(matches).collect())
    }

    fn ping(&self) -> Result<(), String> {
        if self.fail_ping.load(Ordering::SeqCst) {
            Err("mock ping failure".to_string())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(key: &str, v: &str) -> Command {
        Command::LPush { key: key.into(), value: v.into() }
    }

    #[test]
    fn ltrim_keeps_newest() {
        let m = MockRedisOps::new();
        for v in ["a", "b", "c", "d"] {
            m.exec_atomic(&[push("l", v)]).unwrap();
        }
        m.exec_atomic(&[Command::LTrim { key: "l".into(), start: 0, stop: 1 }]).unwrap();
        assert_eq!(m.lrange("l", 0, -1).unwrap(), vec!["d", "c"]);
    }

    #[test]
    fn runtime_error_keeps_the_other_commands_like_exec() {
        let m = MockRedisOps::new();
        m.exec_atomic(&[push("l", "a")]).unwrap();
        let err = m.exec_atomic(&[
            Command::HSet { key: "h".into(), fields: vec![("f".into(), "v".into())] },
            Command::HSet { key: "l".into(), fields: vec![("f".into(), "v".into())] },
            push("l", "b"),
        ]);
        assert!(err.unwrap_err().starts_with("WRONGTYPE"));
        assert!(m.exists("h"));
        assert_eq!(m.lrange("l", 0, -1).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn lrem_from_tail_removes_one_copy() {
        let m = MockRedisOps::new();
        for v in ["x", "y", "x"] {
            m.exec_atomic(&[push("l", v)]).unwrap();
        }
        m.exec_atomic(&[Command::LRem { key: "l".into(), count: -1, value: "x".into() }])
            .unwrap();
        assert_eq!(m.lrange("l", 0, -1).unwrap(), vec!["x", "y"]);
        m.exec_atomic(&[Command::LRem { key: "l".into(), count: 0, value: "x".into() }])
            .unwrap();
        assert_eq!(m.lrange("l", 0, -1).unwrap(), vec!["y"]);
    }

    #[test]
    fn conditional_hash_commands_check_current_value() {
        let m = MockRedisOps::new();
        let set = |v: &str| Command::HSet { key: "h".into(), fields: vec![("f".into(), v.into())] };
        m.exec_atomic(&[set("old")]).unwrap();
        m.exec_atomic(&[Command::HSetIfEq {
            key: "h".into(),
            field: "f".into(),
            expected: "stale".into(),
            value: "lost".into(),
        }])
        .unwrap();
        assert_eq!(m.hget("h", "f").unwrap().as_deref(), Some("old"));
        m.exec_atomic(&[Command::DelIfFieldEq {
            key: "h".into(),
            field: "f".into(),
            expected: "stale".into(),
        }])
        .unwrap();
        assert!(m.exists("h"));
        m.exec_atomic(&[Command::HDelIfEq { key: "h".into(), field: "f".into(), expected: "old".into() }])
            .unwrap();
        assert!(!m.exists("h"));
    }

    #[test]
    fn srem_if_missing_respects_witness() {
        let m = MockRedisOps::new();
        m.exec_atomic(&[
            Command::SAdd { key: "s".into(), member: "m".into() },
            push("w", "1"),
        ])
        .unwrap();
        let srem = Command::SRemIfMissing { key: "s".into(), member: "m".into(), witness: "w".into() };
        m.exec_atomic(&[srem.clone()]).unwrap();
        assert_eq!(m.smembers("s").unwrap(), vec!["m"]);
        m.expire_now("w");
        m.exec_atomic(&[srem]).unwrap();
        assert!(!m.exists("s"));
    }

    #[test]
    fn interleaved_client_runs_before_the_batch() {
        let m = std::sync::Arc::new(MockRedisOps::new());
        let other = m.clone();
        m.before_next_batch(move || other.exec_atomic(&[push("l", "other")]).unwrap());
        m.exec_atomic(&[push("l", "mine")]).unwrap();
        assert_eq!(m.lrange("l", 0, -1).unwrap(), vec!["mine", "other"]);
    }

    #[test]
    fn injected_failure_applies_nothing() {
        let m = MockRedisOps::new();
        m.fail_next_batch();
        assert!(m.exec_atomic(&[push("l", "a")]).is_err());
        assert!(!m.exists("l"));
        m.exec_atomic(&[push("l", "a")]).unwrap();
        assert!(m.exists("l"));
    }

    #[test]
    fn expire_only_applies_to_existing_keys() {
        let m = MockRedisOps::new();
        m.exec_atomic(&[Command::Expire { key: "x".into(), seconds: 5 }]).unwrap();
        assert_eq!(m.ttl("x"), None);
        m.exec_atomic(&[push("x", "1"), Command::Expire { key: "x".into(), seconds: 5 }])
            .unwrap();
        assert_eq!(m.ttl("x"), Some(5));
    }

    #[test]
    fn scan_matches_prefix_glob() {
        let m = MockRedisOps::new();
        m.exec_atomic(&[push("ns:fixes:/a", "1"), push("ns:sessions:/a", "1")]).unwrap();
        assert_eq!(m.scan_keys("ns:fixes:*").unwrap(), vec!["ns:fixes:/a"]);
    }
}
