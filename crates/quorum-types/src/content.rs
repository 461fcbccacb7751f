// Proposal content is a recursive tagged value with six constructors: null,
// bool, number, string, list, string-keyed map. serde_json::Value is exactly
// that shape; validation here is a pure structural predicate over it.

use serde_json::Value;

/// Nesting deeper than this is rejected rather than recursed into.
pub const MAX_CONTENT_DEPTH: usize = 64;

/// Structural validity check for proposal content.
///
/// Accepts any tree of null/bool/number/string/list/map whose nesting stays
/// within [`MAX_CONTENT_DEPTH`] and whose numbers are finite.
pub fn is_valid_content(value: &Value) -> bool {
    check_depth(value, 0)
}

fn check_depth(value: &Value, depth: usize) -> bool {
    if depth > MAX_CONTENT_DEPTH {
        return false;
    }
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => true,
        Value::Number(n) => n.as_f64().map(f64::is_finite).unwrap_or(true),
        Value::Array(items) => items.iter().all(|v| check_depth(v, depth + 1)),
        Value::Object(map) => map.values().all(|v| check_depth(v, depth + 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_and_composite_content_is_valid() {
        assert!(is_valid_content(&json!(null)));
        assert!(is_valid_content(&json!(true)));
        assert!(is_valid_content(&json!(42.5)));
        assert!(is_valid_content(&json!("plan")));
        assert!(is_valid_content(&json!([1, "two", {"three": 3}])));
        assert!(is_valid_content(
            &json!({"steps": ["a", "b"], "pros": [], "cons": null})
        ));
    }

    #[test]
    fn excessive_nesting_is_rejected() {
        let mut value = json!("leaf");
        for _ in 0..=MAX_CONTENT_DEPTH {
            value = json!([value]);
        }
        assert!(!is_valid_content(&value));
    }
}
