use serde_json::Value;
use std::collections::BTreeMap;

/// Serializes a JSON value into its canonical text form:
/// - object keys in lexicographic ascending order, at every depth
/// - array element order preserved
/// - no insignificant whitespace
///
/// The ordering is applied explicitly, so the output does not depend on how
/// the host application built the value (or on serde_json's map backing).
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (key, nested) in map {
                sorted.insert(key, to_canonical_json(nested));
            }
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(key, nested)| format!("{}:{}", Value::String(key.clone()), nested))
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}
