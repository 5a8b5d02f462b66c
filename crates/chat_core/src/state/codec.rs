//! Variable-state codec
//!
//! Computes ordered change lists between two variable states and replays them.
//! All functions are pure: inputs are borrowed and never mutated.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::VariableState;

/// The kind of mutation a [`StateChange`] performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Set,
    Delete,
}

/// One key-level change between two variable states.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChange {
    pub key: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub old_value: Option<Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub new_value: Option<Value>,
    pub op: ChangeOp,
}

// A present `null` must stay `Some(Value::Null)`; only an absent field is `None`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl StateChange {
    pub fn set(key: impl Into<String>, old_value: Option<Value>, new_value: Value) -> Self {
        Self {
            key: key.into(),
            old_value,
            new_value: Some(new_value),
            op: ChangeOp::Set,
        }
    }

    pub fn delete(key: impl Into<String>, old_value: Value) -> Self {
        Self {
            key: key.into(),
            old_value: Some(old_value),
            new_value: None,
            op: ChangeOp::Delete,
        }
    }
}

/// Compute the minimal ordered change list turning `old` into `new`.
///
/// Set operations come first, in `new`'s key order, followed by deletions in
/// `old`'s key order. Values are compared structurally.
pub fn diff(old: &VariableState, new: &VariableState) -> Vec<StateChange> {
    let mut changes = Vec::new();

    for (key, new_value) in new {
        match old.get(key) {
            Some(old_value) if old_value == new_value => {}
            old_value => changes.push(StateChange::set(
                key.clone(),
                old_value.cloned(),
                new_value.clone(),
            )),
        }
    }

    for (key, old_value) in old {
        if !new.contains_key(key) {
            changes.push(StateChange::delete(key.clone(), old_value.clone()));
        }
    }

    changes
}

/// Replay `changes` on top of `base`, returning the resulting state.
///
/// Recorded old values are not checked here; see [`verify`].
pub fn apply(base: &VariableState, changes: &[StateChange]) -> VariableState {
    let mut state = base.clone();
    for change in changes {
        match change.op {
            ChangeOp::Set => {
                let value = change.new_value.clone().unwrap_or(Value::Null);
                state.insert(change.key.clone(), value);
            }
            ChangeOp::Delete => {
                state.remove(&change.key);
            }
        }
    }
    state
}

/// Check that every change's recorded old value matches `base`.
///
/// Returns the offending key on mismatch.
pub fn verify(base: &VariableState, changes: &[StateChange]) -> Result<(), String> {
    let mut state = base.clone();
    for change in changes {
        if state.get(&change.key) != change.old_value.as_ref() {
            return Err(change.key.clone());
        }
        state = apply(&state, std::slice::from_ref(change));
    }
    Ok(())
}

/// Merge a partial update into `base`. A JSON `null` removes the key.
pub fn merge_update(base: &VariableState, update: &VariableState) -> VariableState {
    let mut state = base.clone();
    for (key, value) in update {
        if value.is_null() {
            state.remove(key);
        } else {
            state.insert(key.clone(), value.clone());
        }
    }
    state
}

/// Serialized size of a state in bytes.
pub fn state_byte_size(state: &VariableState) -> usize {
    serde_json::to_vec(state).map(|bytes| bytes.len()).unwrap_or(0)
}

/// Serialized size of a change list in bytes.
pub fn changes_byte_size(changes: &[StateChange]) -> usize {
    serde_json::to_vec(changes)
        .map(|bytes| bytes.len())
        .unwrap_or(0)
}
