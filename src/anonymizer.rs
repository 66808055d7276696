//! # Stage: Anonymization Gate
//!
//! ## Responsibility
//! The single place sensitive-data policy is enforced.  Every document bound
//! for storage is rewritten by [`Anonymizer::sanitize`] and then checked by
//! [`Anonymizer::verify`]; only a failed verify can block a write.
//!
//! Matchers run in a fixed order:
//! 1. credential assignments (`password = "..."`, `api_key: '...'`)
//! 2. bearer / basic authorization values
//! 3. vendor API keys with well-known prefixes
//! 4. email addresses
//! 5. URLs
//! 6. long hexadecimal tokens (32+ chars)
//!
//! Assignment matching must precede URL and hash matching so a credential
//! whose value looks like a URL is still redacted as a credential.
//!
//! ## Guarantees
//! - `sanitize` never fails: non-string leaves pass through unchanged
//! - `verify` fails closed: a matcher that did not compile counts as a hit
//! - Idempotent: placeholders emitted here are never matched again
//!
//! ## NOT Responsible For
//! - Deciding which source files are learned from (`is_sensitive_path` only
//!   advises upstream collaborators)

use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

/// Placeholder substituted for credential values.
pub const SENTINEL: &str = "[REDACTED]";

/// Leaves longer than this many characters are always classified.
pub const SHORT_TEXT_THRESHOLD: usize = 20;

/// Keys whose string leaves hold code and are classified regardless of length.
const CODE_BEARING_KEYS: &[&str] = &[
    "examples",
    "code_examples",
    "code_samples",
    "samples",
    "snippets",
    "code",
    "before_code",
    "after_code",
];

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

macro_rules! matcher_regex {
    ($name:ident, $regex_str:expr) => {
        static $name: Lazy<Option<Regex>> = Lazy::new(|| Regex::new($regex_str).ok());
    };
}

// Groups: 1 identifier, 2 separator, 3 quoted literal including its quotes.
// A literal is double-quoted, single-quoted, or JSON-escaped double-quoted
// (verify scans serialized documents).  Backslash escapes never end a literal.
matcher_regex!(
    RE_CREDENTIAL_ASSIGN,
    r#"(?i)\b([a-z0-9_\-]*(?:password|passwd|pwd|secret|token|api[_\-]?key|access[_\-]?key|private[_\-]?key|credentials?))(\\?["']?\s*[:=]\s*)("(?:[^"\\\r\n]|\\.)*"|'(?:[^'\\\r\n]|\\.)*'|\\"(?:\\\\(?:\\.|[^\\"])|\\[^"\\]|[^"\\])*\\")"#
);
matcher_regex!(
    RE_AUTH_HEADER,
    r"(?i)\b(bearer|basic)(\s+)([A-Za-z0-9\-._~+/]+=*)"
);
matcher_regex!(
    RE_VENDOR_API_KEY,
    r"\b(?:sk-ant-[A-Za-z0-9_\-]{20,}|sk-(?:proj-)?[A-Za-z0-9]{20,}|gh[pousr]_[A-Za-z0-9]{36}|glpat-[A-Za-z0-9_\-]{20}|AKIA[0-9A-Z]{16}|AIza[0-9A-Za-z_\-]{35}|xox[abposr]-[A-Za-z0-9\-]{10,})"
);
matcher_regex!(
    RE_EMAIL,
    r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}"
);
matcher_regex!(
    RE_URL,
    r#"(?i)\b[a-z][a-z0-9+.\-]{1,15}://[^\s"'<>\\]+"#
);
matcher_regex!(RE_LONG_HEX, r"\b[0-9a-fA-F]{32,}\b");

static RE_CREDENTIAL_KEY: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[a-z0-9_\-]*(?:password|passwd|pwd|secret|token|api[_\-]?key|access[_\-]?key|private[_\-]?key|credentials?)$",
    )
    .ok()
});

static RE_PLACEHOLDER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\[[A-Z_]+\]$").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatcherKind {
    CredentialAssignment,
    AuthHeader,
    Replace(&'static str),
}

struct Matcher {
    name: &'static str,
    regex: &'static Lazy<Option<Regex>>,
    kind: MatcherKind,
}

static MATCHERS: [Matcher; 6] = [
    Matcher {
        name: "credential_assignment",
        regex: &RE_CREDENTIAL_ASSIGN,
        kind: MatcherKind::CredentialAssignment,
    },
    Matcher {
        name: "auth_header",
        regex: &RE_AUTH_HEADER,
        kind: MatcherKind::AuthHeader,
    },
    Matcher {
        name: "vendor_api_key",
        regex: &RE_VENDOR_API_KEY,
        kind: MatcherKind::Replace("[API_KEY]"),
    },
    Matcher {
        name: "email",
        regex: &RE_EMAIL,
        kind: MatcherKind::Replace("[EMAIL]"),
    },
    Matcher {
        name: "url",
        regex: &RE_URL,
        kind: MatcherKind::Replace("[URL]"),
    },
    Matcher {
        name: "long_hex",
        regex: &RE_LONG_HEX,
        kind: MatcherKind::Replace("[HASH]"),
    },
];

/// Opening/closing quote and inner value of a matched credential literal.
fn split_literal(lit: &str) -> (&str, &str) {
    let quote_len = if lit.starts_with("\\\"") { 2 } else { 1 };
    let quote = lit.get(..quote_len).unwrap_or("");
    let value = lit
        .get(quote_len..lit.len().saturating_sub(quote_len))
        .unwrap_or("");
    (quote, value)
}

fn literal_holds_secret(lit: &str) -> bool {
    let (_, value) = split_literal(lit);
    !value.is_empty() && !is_placeholder(value)
}

fn is_placeholder(s: &str) -> bool {
    match RE_PLACEHOLDER.as_ref() {
        Some(re) => re.is_match(s),
        None => s == SENTINEL,
    }
}

/// Auth values need a digit or base64 punctuation, so prose such as
/// "basic implementation" is left alone.
fn looks_like_auth_value(value: &str) -> bool {
    value.len() >= 8
        && value
            .chars()
            .any(|c| c.is_ascii_digit() || matches!(c, '+' | '/' | '='))
}

impl Matcher {
    /// Whether this capture is real sensitive content rather than something
    /// already redacted or a false positive.
    fn is_hit(&self, caps: &Captures<'_>) -> bool {
        match self.kind {
            MatcherKind::CredentialAssignment => {
                caps.get(3).map_or(false, |lit| literal_holds_secret(lit.as_str()))
            }
            MatcherKind::AuthHeader => caps.get(3).map_or(false, |v| looks_like_auth_value(v.as_str())),
            MatcherKind::Replace(_) => true,
        }
    }

    fn replacement(&self, caps: &Captures<'_>) -> String {
        if !self.is_hit(caps) {
            return caps[0].to_string();
        }
        match self.kind {
            MatcherKind::CredentialAssignment => {
                let (quote, _) = split_literal(&caps[3]);
                format!("{}{}{}{}{}", &caps[1], &caps[2], quote, SENTINEL, quote)
            }
            MatcherKind::AuthHeader => format!("{}{}{}", &caps[1], &caps[2], SENTINEL),
            MatcherKind::Replace(placeholder) => placeholder.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// One sensitive span found by a matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub matcher: &'static str,
    pub start: usize,
    pub end: usize,
}

// ---------------------------------------------------------------------------
// Anonymizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Anonymizer {
    short_text_threshold: usize,
}

impl Default for Anonymizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Anonymizer {
    pub fn new() -> Self {
        Self {
            short_text_threshold: SHORT_TEXT_THRESHOLD,
        }
    }

    /// Apply every matcher, in order, to `text`.
    pub fn classify(&self, text: &str) -> String {
        let mut out = text.to_string();
        for m in MATCHERS.iter() {
            if let Some(re) = m.regex.as_ref() {
                out = re.replace_all(&out, |caps: &Captures<'_>| m.replacement(caps)).into_owned();
            }
        }
        out
    }

    /// Every unredacted sensitive span in `text`, in matcher order.
    ///
    /// A matcher whose regex failed to compile reports a zero-width hit so
    /// callers fail closed.
    pub fn detect(&self, text: &str) -> Vec<Detection> {
        let mut found = Vec::new();
        for m in MATCHERS.iter() {
            let Some(re) = m.regex.as_ref() else {
                found.push(Detection { matcher: m.name, start: 0, end: 0 });
                continue;
            };
            for caps in re.captures_iter(text) {
                if m.is_hit(&caps) {
                    let whole = caps.get(0).map(|g| (g.start(), g.end())).unwrap_or((0, 0));
                    found.push(Detection {
                        matcher: m.name,
                        start: whole.0,
                        end: whole.1,
                    });
                }
            }
        }
        found
    }

    /// Recursively rewrite string leaves of `doc`.
    ///
    /// A leaf is classified when it is longer than the threshold, sits under a
    /// code-bearing key, or contains a credential assignment.  A leaf whose own
    /// key names a credential is replaced by [`SENTINEL`] outright.
    pub fn sanitize(&self, doc: &Value) -> Value {
        self.sanitize_value(doc, None, false)
    }

    fn sanitize_value(&self, value: &Value, key: Option<&str>, code_bearing: bool) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_leaf(s, key, code_bearing)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize_value(item, key, code_bearing))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    let nested_code = code_bearing || is_code_bearing_key(k);
                    out.insert(k.clone(), self.sanitize_value(v, Some(k), nested_code));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn sanitize_leaf(&self, s: &str, key: Option<&str>, code_bearing: bool) -> String {
        if key.map_or(false, is_credential_key) && !is_placeholder(s) {
            return SENTINEL.to_string();
        }
        if code_bearing || s.chars().count() > self.short_text_threshold {
            return self.classify(s);
        }
        if contains_credential_assignment(s) {
            return self.classify(s);
        }
        s.to_string()
    }

    /// Re-serialize `doc` and re-run every matcher.  `true` means safe to store.
    pub fn verify(&self, doc: &Value) -> bool {
        self.first_violation(doc).is_none()
    }

    /// Name of the first matcher still firing on `doc`, if any.
    pub fn first_violation(&self, doc: &Value) -> Option<&'static str> {
        let serialized = match serde_json::to_string(doc) {
            Ok(s) => s,
            Err(_) => return Some("serialization"),
        };
        self.detect(&serialized).first().map(|d| d.matcher)
    }

    /// Sanitize then verify; `Err` carries the name of the offending matcher.
    pub fn scrub(&self, doc: &Value) -> Result<Value, &'static str> {
        let clean = self.sanitize(doc);
        match self.first_violation(&clean) {
            None => Ok(clean),
            Some(matcher) => Err(matcher),
        }
    }
}

fn is_code_bearing_key(key: &str) -> bool {
    CODE_BEARING_KEYS.iter().any(|k| key.eq_ignore_ascii_case(k))
}

fn is_credential_key(key: &str) -> bool {
    RE_CREDENTIAL_KEY.as_ref().map_or(false, |re| re.is_match(key))
}

fn contains_credential_assignment(s: &str) -> bool {
    match RE_CREDENTIAL_ASSIGN.as_ref() {
        Some(re) => re
            .captures_iter(s)
            .any(|caps| caps.get(3).map_or(false, |lit| literal_holds_secret(lit.as_str()))),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Path heuristic
// ---------------------------------------------------------------------------

/// Whether a source file is likely to hold secrets and should not be learned
/// from.  Advisory only; storage is never blocked by this.
pub fn is_sensitive_path(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_ascii_lowercase(),
        None => return false,
    };
    name.starts_with(".env")
        || (name.contains("secrets") && (name.ends_with(".yaml") || name.ends_with(".yml")))
        || name.ends_with(".key")
        || name.ends_with(".pem")
        || name.contains("credentials")
}
