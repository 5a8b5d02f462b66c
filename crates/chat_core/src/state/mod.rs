//! Variable state carried by conversation turns.

pub mod codec;

pub use codec::{apply, diff, merge_update, verify, ChangeOp, StateChange};

/// Flat variable name to value mapping in effect at a turn.
///
/// Key order follows insertion order.
pub type VariableState = serde_json::Map<String, serde_json::Value>;

/// Interpret a JSON value as a variable state, if it is an object.
pub fn state_from_value(value: serde_json::Value) -> Option<VariableState> {
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}
