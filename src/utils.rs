//! Identifier generation and JSON snapshot helpers

use bech32::Bech32m;
use serde_json::{Map, Value};
use uuid7::uuid7;

use crate::types::{TimeStamp, WorkOrderSubtype, WorkOrderType};

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Opaque correlation id threaded through one logical operation
pub fn new_trace_id() -> String {
    hex::encode(uuid7().as_bytes())
}

/// `{TYPE}-{SUBTYPE}-{yyyymmdd}{sequence}`; the sequence comes from the store's
/// monotonic id generator so numbers never repeat within one database.
pub fn task_number(
    kind: WorkOrderType,
    subtype: WorkOrderSubtype,
    date: &TimeStamp<chrono::Utc>,
    sequence: u64,
) -> String {
    format!(
        "{}-{}-{}{:06}",
        kind.as_str(),
        subtype.as_str(),
        date.to_datetime_utc().format("%Y%m%d"),
        sequence
    )
}

/// Merge `patch` into `target` key by key. Nested objects merge recursively,
/// every other value replaces what was there.
pub fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                let nested = value.is_object() && existing.get(&key).is_some_and(Value::is_object);
                if nested {
                    if let Some(slot) = existing.get_mut(&key) {
                        merge_json(slot, value);
                    }
                } else {
                    existing.insert(key, value);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Parse a stored JSON snapshot. Anything that is not an object is kept
/// under `value` so later merges never discard it.
pub fn parse_snapshot(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(Value::Null) | Err(_) if raw.trim().is_empty() => Value::Object(Map::new()),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            Value::Object(map)
        }
        Err(_) => {
            let mut map = Map::new();
            map.insert("value".into(), Value::String(raw.to_string()));
            Value::Object(map)
        }
    }
}

/// Read a string-ish field out of a JSON object, accepting numbers as well.
pub fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
