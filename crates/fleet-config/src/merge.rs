//! Value-type-directed merge rules
//!
//! - mapping + mapping: merged key by key, recursively
//! - sequence + sequence: concatenated, earlier first, no de-duplication
//! - anything else: the later value replaces the earlier one
//!
//! A `null` on the later side is an empty declaration and keeps the
//! earlier value.

use serde_json::Value;

/// Merge `later` into `acc` in place
pub fn merge_into(acc: &mut Value, later: Value) {
    match (acc, later) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(overlay)) => base.extend(overlay),
        (slot, later) => *slot = later,
    }
}

/// Merge a sequence of contributions, lowest precedence first
///
/// Returns `None` when nothing contributed.
pub fn merge_all<I>(contributions: I) -> Option<Value>
where
    I: IntoIterator<Item = Value>,
{
    let mut acc: Option<Value> = None;
    for value in contributions {
        match acc.as_mut() {
            Some(existing) => merge_into(existing, value),
            None if !value.is_null() => acc = Some(value),
            None => {}
        }
    }
    acc
}
