//! Field cleanup applied before checksum serialization.
//!
//! Cleanup is shallow: only the top-level field map is touched, nested
//! values are hashed as they are.
//!
//! | rule | effect |
//! |------|--------|
//! | `null` value | field dropped |
//! | empty or false `retired`, `parent_concept_urls`, `child_concept_urls`, `descriptions`, `extras`, `names` | field dropped |
//! | truthy `is_active` | field dropped |
//! | number or bool with equal integer and float value | stored as integer |
//! | `extras` keys starting with `__` | key dropped |

use serde_json::{Map, Number, Value};

/// Fields dropped when empty or false.
pub const DROP_WHEN_FALSY: &[&str] = &[
    "retired",
    "parent_concept_urls",
    "child_concept_urls",
    "descriptions",
    "extras",
    "names",
];

/// Prefix of private extras keys excluded from checksums.
pub const PRIVATE_EXTRAS_PREFIX: &str = "__";

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn integral(value: Value) -> Value {
    match value {
        Value::Bool(b) => Value::Number(Number::from(i64::from(b))),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Value::Number(Number::from(f as i64))
            }
            _ => Value::Number(n),
        },
        other => other,
    }
}

/// Apply the checksum cleanup rules to a field map.
///
/// Non-object values are returned unchanged.
pub fn cleanup(fields: Value) -> Value {
    let Value::Object(map) = fields else {
        return fields;
    };

    let mut result = Map::new();
    for (key, value) in map {
        if value.is_null() {
            continue;
        }
        if DROP_WHEN_FALSY.contains(&key.as_str()) && is_falsy(&value) {
            continue;
        }
        if key == "is_active" && !is_falsy(&value) {
            continue;
        }
        let mut value = integral(value);
        if key == "extras" {
            if let Value::Object(extras) = value {
                value = Value::Object(
                    extras
                        .into_iter()
                        .filter(|(k, _)| !k.starts_with(PRIVATE_EXTRAS_PREFIX))
                        .collect(),
                );
            }
        }
        result.insert(key, value);
    }
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_drops_nulls_and_falsy_collections() {
        let cleaned = cleanup(json!({
            "concept_class": "Diagnosis",
            "external_id": null,
            "retired": false,
            "names": [],
            "extras": {},
            "datatype": "",
        }));
        assert_eq!(cleaned, json!({"concept_class": "Diagnosis", "datatype": ""}));
    }

    #[test]
    fn test_numbers_and_bools_become_integers() {
        let cleaned = cleanup(json!({"retired": true, "sort_weight": 2.0, "ratio": 1.5}));
        assert_eq!(cleaned, json!({"retired": 1, "sort_weight": 2, "ratio": 1.5}));
    }

    #[test]
    fn test_active_flag_only_kept_when_false() {
        assert_eq!(cleanup(json!({"is_active": true})), json!({}));
        assert_eq!(cleanup(json!({"is_active": false})), json!({"is_active": 0}));
    }

    #[test]
    fn test_private_extras_removed() {
        let cleaned = cleanup(json!({"extras": {"__cascade": 1, "code": "x"}}));
        assert_eq!(cleaned, json!({"extras": {"code": "x"}}));
    }

    #[test]
    fn test_nested_values_untouched() {
        let cleaned = cleanup(json!({"names": [{"name": "x", "external_id": null}]}));
        assert_eq!(cleaned, json!({"names": [{"name": "x", "external_id": null}]}));
    }
}
