use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static SENSITIVE_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(password|token|secret|card|cvv|pin|ssn|full.?name|email|phone)")
        .expect("SENSITIVE_KEY_REGEX should compile")
});

/// Returns true when a metadata key names a sensitive field. Matching is
/// substring-based and case-insensitive, so `cardNumber`, `user_email` and
/// `FULL NAME` are all caught.
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY_REGEX.is_match(key)
}

/// Strips sensitive keys from a metadata mapping, recursing into nested
/// objects and arrays. Values under innocuous keys are kept as-is; name-based
/// matching cannot catch sensitive data stored under unrelated names, which
/// is a documented limitation of the audit stream.
pub fn redact_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .filter(|(key, _)| !is_sensitive_key(key))
        .map(|(key, value)| (key.clone(), redact_value(value)))
        .collect()
}

fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(redact_metadata(map)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}
