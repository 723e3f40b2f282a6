//! Field-by-field merge of configuration tiers.
//!
//! Tiers are parsed into `serde_json::Value` and folded together; the merged
//! value is then deserialized into [`Config`](super::Config), so every field
//! missing from all tiers falls back to its serde default.

use serde_json::Value;

/// Merge `overlay` onto `base`.
///
/// Objects merge key by key. Arrays and scalars in `overlay` replace the base
/// value. A null in `overlay` means "not specified" and keeps the base value.
///
/// ```
/// use serde_json::json;
/// use agent_runner::config::deep_merge;
///
/// let defaults = json!({"runner": {"cancel_timeout_ms": 10000, "kill_timeout_ms": 5000}});
/// let project = json!({"runner": {"cancel_timeout_ms": 2000}});
/// assert_eq!(
///     deep_merge(defaults, project),
///     json!({"runner": {"cancel_timeout_ms": 2000, "kill_timeout_ms": 5000}})
/// );
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Fold tiers lowest-priority first.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_sections_merge_per_field() {
        let defaults = json!({
            "recovery": {"max_retries": 3, "backoff": {"strategy": "fixed", "fixed_delay_ms": 60000}},
            "events": {"observer_capacity": 1024}
        });
        let user = json!({"recovery": {"backoff": {"strategy": "exponential"}}});

        assert_eq!(
            deep_merge(defaults, user),
            json!({
                "recovery": {"max_retries": 3, "backoff": {"strategy": "exponential", "fixed_delay_ms": 60000}},
                "events": {"observer_capacity": 1024}
            })
        );
    }

    #[test]
    fn test_arrays_are_replaced() {
        let base = json!({"agent": {"args": ["--print", "--verbose"]}});
        let overlay = json!({"agent": {"args": ["-p"]}});
        assert_eq!(deep_merge(base, overlay), json!({"agent": {"args": ["-p"]}}));
    }

    #[test]
    fn test_null_keeps_lower_tier() {
        let base = json!({"server": {"db_path": "a.db"}});
        let overlay = json!({"server": {"db_path": null}});
        assert_eq!(deep_merge(base, overlay), json!({"server": {"db_path": "a.db"}}));
    }

    #[test]
    fn test_later_tiers_win() {
        let merged = deep_merge_all([
            json!({"runner": {"poll_interval_ms": 1000}}),
            json!({"runner": {"poll_interval_ms": 500}}),
            json!({"runner": {"poll_interval_ms": 250, "kill_timeout_ms": 10}}),
        ]);
        assert_eq!(
            merged,
            json!({"runner": {"poll_interval_ms": 250, "kill_timeout_ms": 10}})
        );
    }

    #[test]
    fn test_type_change_replaces() {
        assert_eq!(deep_merge(json!({"v": 1}), json!({"v": {"x": true}})), json!({"v": {"x": true}}));
        assert_eq!(deep_merge(json!({"v": {"x": true}}), json!({"v": 1})), json!({"v": 1}));
    }
}
