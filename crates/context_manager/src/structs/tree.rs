use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::structs::turn::{Turn, TurnId};

/// Tree-shaped history of one conversation.
///
/// `turns` is kept in creation order. The root turn's id equals the tree id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationTree {
    pub id: String,
    /// Conversation identity owning this tree.
    pub owner_id: String,
    pub turns: Vec<Turn>,
    /// Default parent for the next turn.
    pub current_turn_id: TurnId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationTree {
    pub fn new(owner_id: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            turns: vec![Turn::root(id.clone())],
            current_turn_id: id.clone(),
            id,
            owner_id: owner_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn root_id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, turn_id: &str) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.id == turn_id)
    }

    pub fn get_mut(&mut self, turn_id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|turn| turn.id == turn_id)
    }

    pub fn contains(&self, turn_id: &str) -> bool {
        self.get(turn_id).is_some()
    }

    pub fn children_of(&self, turn_id: &str) -> Vec<&Turn> {
        self.turns
            .iter()
            .filter(|turn| turn.parent_id.as_deref() == Some(turn_id))
            .collect()
    }

    /// Turns from the root down to `turn_id`, inclusive.
    ///
    /// Returns `None` when the turn is unknown, a parent link dangles, or the
    /// links loop.
    pub fn path_to(&self, turn_id: &str) -> Option<Vec<Turn>> {
        let mut path = Vec::new();
        let mut cursor = self.get(turn_id)?;

        loop {
            path.push(cursor.clone());
            if path.len() > self.turns.len() {
                tracing::warn!(tree_id = %self.id, turn_id = %turn_id, "ConversationTree: parent links form a cycle");
                return None;
            }
            match cursor.parent_id.as_deref() {
                None => break,
                Some(parent_id) => match self.get(parent_id) {
                    Some(parent) => cursor = parent,
                    None => {
                        tracing::warn!(
                            tree_id = %self.id,
                            turn_id = %cursor.id,
                            parent_id = %parent_id,
                            "ConversationTree: dangling parent link"
                        );
                        return None;
                    }
                },
            }
        }

        path.reverse();
        Some(path)
    }

    /// Ids of `turn_id` and all of its transitive descendants.
    pub fn subtree_ids(&self, turn_id: &str) -> HashSet<TurnId> {
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for turn in &self.turns {
            if let Some(parent_id) = turn.parent_id.as_deref() {
                children.entry(parent_id).or_default().push(turn.id.as_str());
            }
        }

        let mut subtree = HashSet::new();
        let mut queue = VecDeque::from([turn_id]);
        while let Some(id) = queue.pop_front() {
            if !subtree.insert(id.to_string()) {
                continue;
            }
            if let Some(kids) = children.get(id) {
                queue.extend(kids.iter().copied());
            }
        }
        subtree
    }

    /// Overwrite the state fields of stored turns with those in `turns`.
    pub fn write_back_state(&mut self, turns: &[Turn]) {
        for updated in turns {
            if let Some(turn) = self.get_mut(&updated.id) {
                turn.state_snapshot = updated.state_snapshot.clone();
                turn.state_diff = updated.state_diff.clone();
                turn.state_meta = updated.state_meta.clone();
            }
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
