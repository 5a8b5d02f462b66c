use chat_core::{StateChange, VariableState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TurnId = String;

/// Structured fields extracted from a model response.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ParsedFields {
    /// Suggested follow-up prompts offered to the user.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_prompts: Vec<String>,
    /// Control events emitted by the response.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

impl ParsedFields {
    pub fn is_empty(&self) -> bool {
        self.next_prompts.is_empty() && self.events.is_empty()
    }
}

/// Bookkeeping about how a turn's variable state is stored.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct StateMetadata {
    /// Serialized size of the stored snapshot or diff.
    pub byte_size: usize,
    /// Whether the turn changed any variable relative to its parent.
    pub has_changes: bool,
    pub is_snapshot: bool,
    #[serde(default)]
    pub change_count: usize,
}

/// A single exchange in the conversation tree.
///
/// Parent links are plain ids; the tree owns every turn.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Turn {
    pub id: TurnId,
    /// `None` only for the root turn.
    pub parent_id: Option<TurnId>,
    #[serde(default)]
    pub user_input: String,
    /// Text shown to the user.
    #[serde(default)]
    pub response: String,
    /// Unparsed model output.
    #[serde(default)]
    pub full_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<ParsedFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_snapshot: Option<VariableState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_diff: Option<Vec<StateChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_meta: Option<StateMetadata>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn root(id: impl Into<TurnId>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            user_input: String::new(),
            response: String::new(),
            full_response: String::new(),
            reasoning: None,
            parsed: None,
            state_snapshot: None,
            state_diff: None,
            state_meta: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// True when the turn stores a snapshot or a diff.
    pub fn has_state_record(&self) -> bool {
        self.state_snapshot.is_some() || self.state_diff.is_some()
    }

    pub fn is_snapshot(&self) -> bool {
        self.state_snapshot.is_some()
    }
}

/// Input for appending a turn to a tree.
#[derive(Clone, Debug, Default)]
pub struct NewTurn {
    pub user_input: String,
    pub response: String,
    pub full_response: String,
    pub reasoning: Option<String>,
    pub parsed: Option<ParsedFields>,
    /// Use this id instead of a generated one.
    pub explicit_id: Option<TurnId>,
    /// Variable state in effect after this turn; `None` inherits the parent's.
    pub variables: Option<VariableState>,
}

impl NewTurn {
    pub fn new(user_input: impl Into<String>, response: impl Into<String>) -> Self {
        let response = response.into();
        Self {
            user_input: user_input.into(),
            full_response: response.clone(),
            response,
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: VariableState) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_id(mut self, id: impl Into<TurnId>) -> Self {
        self.explicit_id = Some(id.into());
        self
    }
}

/// Partial update for an existing turn. `None` leaves a field untouched.
#[derive(Clone, Debug, Default)]
pub struct TurnUpdate {
    pub user_input: Option<String>,
    pub response: Option<String>,
    pub full_response: Option<String>,
    pub reasoning: Option<String>,
    pub parsed: Option<ParsedFields>,
    /// Re-record the turn's variable state against its parent.
    pub variables: Option<VariableState>,
}
