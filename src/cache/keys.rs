//! Cache key definitions.
//!
//! A [`CacheKey`] is either an opaque string or an ordered list of JSON
//! segments. Keys are canonicalized to a stable string which is the store's
//! actual map key; [`KeyPattern`] selects stored keys for invalidation.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Structured cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheKey {
    /// Opaque key, stored as-is.
    Text(String),
    /// Ordered segments: strings, numbers, nested objects or arrays.
    Segments(Vec<Value>),
}

impl CacheKey {
    /// Canonical string form used as the store's map key.
    pub fn canonical(&self) -> String {
        serialize(self)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<Value>> for CacheKey {
    fn from(segments: Vec<Value>) -> Self {
        Self::Segments(segments)
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(key: &CacheKey) -> Self {
        key.clone()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Build a segment key from JSON-convertible literals.
///
/// ```
/// use icebreak::cache_key;
///
/// let key = cache_key!["events", "list", 1];
/// assert_eq!(key.canonical(), r#"["events","list",1]"#);
/// ```
#[macro_export]
macro_rules! cache_key {
    ($($segment:tt)*) => {
        $crate::cache::CacheKey::Segments(
            match $crate::__private::serde_json::json!([$($segment)*]) {
                $crate::__private::serde_json::Value::Array(items) => items,
                _ => unreachable!(),
            }
        )
    };
}

/// Predicate over a decoded stored key.
pub type KeyPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Selects stored keys: one exact key, or every key a predicate accepts.
#[derive(Clone)]
pub enum KeyPattern {
    Key(CacheKey),
    Predicate(KeyPredicate),
}

impl KeyPattern {
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Matches segment keys whose leading segments equal `prefix`.
    ///
    /// `prefix(vec![json!("events")])` selects every `["events", ...]` key.
    pub fn prefix(prefix: Vec<Value>) -> Self {
        Self::predicate(move |decoded| match decoded {
            Value::Array(segments) => {
                segments.len() >= prefix.len()
                    && segments
                        .iter()
                        .zip(prefix.iter())
                        .all(|(segment, expected)| json_eq(segment, expected))
            }
            _ => false,
        })
    }

    pub fn as_key(&self) -> Option<&CacheKey> {
        match self {
            Self::Key(key) => Some(key),
            Self::Predicate(_) => None,
        }
    }
}

impl fmt::Debug for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<CacheKey> for KeyPattern {
    fn from(key: CacheKey) -> Self {
        Self::Key(key)
    }
}

impl From<&CacheKey> for KeyPattern {
    fn from(key: &CacheKey) -> Self {
        Self::Key(key.clone())
    }
}

impl From<&str> for KeyPattern {
    fn from(key: &str) -> Self {
        Self::Key(CacheKey::from(key))
    }
}

impl From<String> for KeyPattern {
    fn from(key: String) -> Self {
        Self::Key(CacheKey::from(key))
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Canonicalize a key.
///
/// Text passes through unchanged. Segment keys are written as JSON with the
/// members of every object sorted by key, so structurally equal keys produce
/// identical strings regardless of insertion order.
pub fn serialize(key: &CacheKey) -> String {
    match key {
        CacheKey::Text(text) => text.clone(),
        CacheKey::Segments(segments) => {
            let mut out = String::new();
            out.push('[');
            for (index, segment) in segments.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(segment, &mut out);
            }
            out.push(']');
            out
        }
    }
}

/// Decode a canonical key back to its structured form.
///
/// Best effort: anything that is not valid JSON comes back as a JSON string.
pub fn decode(stored: &str) -> Value {
    serde_json::from_str(stored).unwrap_or_else(|_| Value::String(stored.to_string()))
}

/// Test a stored canonical key against a pattern.
pub fn matches(stored: &str, pattern: &KeyPattern) -> bool {
    match pattern {
        KeyPattern::Key(key) => serialize(key) == stored,
        KeyPattern::Predicate(predicate) => predicate(&decode(stored)),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> = map.iter().collect();
            members.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (name, member)) in members.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(name.clone()), out);
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // Scalars have a single JSON rendering; serde_json handles escaping.
    out.push_str(&value.to_string());
}

/// Structural equality where integer and float encodings of the same number agree.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}
