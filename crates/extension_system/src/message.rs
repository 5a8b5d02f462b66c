use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message handed through the hook chain.
///
/// On the way in `content` is the user's text; on the way out it is the
/// parsed response text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    /// Free-form data hooks may read or attach.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl HookMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn in_tree(mut self, tree_id: impl Into<String>, turn_id: Option<String>) -> Self {
        self.tree_id = Some(tree_id.into());
        self.turn_id = turn_id;
        self
    }
}
