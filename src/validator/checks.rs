//! Per-condition value checks. The registry is intentionally small; a
//! condition without an entry passes unchecked.

use serde_json::Value;

fn int_range(value: &Value, min: i64, max: i64) -> bool {
    value.as_i64().is_some_and(|v| v >= min && v <= max)
}

fn non_negative_number(value: &Value) -> bool {
    value.as_f64().is_some_and(|v| v >= 0.0)
}

/// `Some(outcome)` when a check is registered for the condition, `None`
/// otherwise.
pub fn check_value(condition: &str, value: &Value) -> Option<bool> {
    match condition {
        "tcp-ttl" | "udp-ttl" => Some(int_range(value, 0, 255)),
        "tcp-rtt" | "udp-rtt" | "tcp-rtt-max" | "udp-rtt-max" | "tcp-rtt-min" | "udp-rtt-min" => {
            Some(non_negative_number(value))
        }
        _ => None,
    }
}
