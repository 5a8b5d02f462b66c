//! Conversation tree store
//!
//! Persists every tree in one storage collection and filters by tree id in
//! memory. The store does not serialize concurrent writers: callers must hold
//! a per-tree lock around mutations.

use std::sync::Arc;

use chat_core::{SnapshotPolicy, VariableState};
use serde_json::Value;
use storage_manager::RecordStorage;
use uuid::Uuid;

use crate::branch_state::{diff_depth, BranchStateManager, StorageStatistics, ValidationReport};
use crate::error::Result;
use crate::structs::tree::ConversationTree;
use crate::structs::turn::{NewTurn, Turn, TurnId, TurnUpdate};

/// Storage collection holding all trees.
pub const TREES_COLLECTION: &str = "conversation_trees";

/// Outcome of moving the current-turn pointer.
#[derive(Debug, Clone)]
pub struct BranchSwitch {
    pub tree: ConversationTree,
    /// Resolved variable state at the new current turn.
    pub state: VariableState,
    /// Whether the path needed a repair before restoring.
    pub repaired: bool,
}

pub struct ConversationTreeStore {
    storage: Arc<dyn RecordStorage>,
    state_manager: BranchStateManager,
}

impl ConversationTreeStore {
    pub fn new(storage: Arc<dyn RecordStorage>, policy: SnapshotPolicy) -> Self {
        Self {
            storage,
            state_manager: BranchStateManager::new(policy),
        }
    }

    pub fn state_manager(&self) -> &BranchStateManager {
        &self.state_manager
    }

    async fn load_trees(&self) -> Result<Vec<ConversationTree>> {
        self.storage
            .read(TREES_COLLECTION)
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Into::into))
            .collect()
    }

    async fn save_trees(&self, trees: &[ConversationTree]) -> Result<()> {
        let records = trees
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<Value>, _>>()?;
        self.storage.write(TREES_COLLECTION, records).await?;
        Ok(())
    }

    async fn read_tree<R>(
        &self,
        tree_id: &str,
        f: impl FnOnce(&ConversationTree) -> Option<R>,
    ) -> Result<Option<R>> {
        let trees = self.load_trees().await?;
        Ok(trees.iter().find(|tree| tree.id == tree_id).and_then(f))
    }

    /// Run `f` against one tree and persist all trees if it returns `Some`.
    async fn mutate_tree<R>(
        &self,
        tree_id: &str,
        f: impl FnOnce(&mut ConversationTree, &BranchStateManager) -> Option<R>,
    ) -> Result<Option<R>> {
        let mut trees = self.load_trees().await?;
        let Some(tree) = trees.iter_mut().find(|tree| tree.id == tree_id) else {
            tracing::debug!(tree_id = %tree_id, "TreeStore: tree not found");
            return Ok(None);
        };

        let outcome = f(tree, &self.state_manager);
        if outcome.is_some() {
            tree.touch();
            self.save_trees(&trees).await?;
        }
        Ok(outcome)
    }

    /// Create the tree for `owner_id`, or return the existing one.
    pub async fn create_tree(&self, owner_id: &str) -> Result<ConversationTree> {
        let mut trees = self.load_trees().await?;
        if let Some(existing) = trees.iter().find(|tree| tree.owner_id == owner_id) {
            tracing::info!(owner_id = %owner_id, tree_id = %existing.id, "TreeStore: tree already exists for owner");
            return Ok(existing.clone());
        }

        let tree = ConversationTree::new(owner_id);
        tracing::info!(owner_id = %owner_id, tree_id = %tree.id, "TreeStore: created tree");
        trees.push(tree.clone());
        self.save_trees(&trees).await?;
        Ok(tree)
    }

    pub async fn get_tree(&self, tree_id: &str) -> Result<Option<ConversationTree>> {
        self.read_tree(tree_id, |tree| Some(tree.clone())).await
    }

    pub async fn get_tree_by_owner(&self, owner_id: &str) -> Result<Option<ConversationTree>> {
        let trees = self.load_trees().await?;
        Ok(trees.into_iter().find(|tree| tree.owner_id == owner_id))
    }

    /// Remove a tree and all of its turns.
    pub async fn delete_tree(&self, tree_id: &str) -> Result<bool> {
        let mut trees = self.load_trees().await?;
        let before = trees.len();
        trees.retain(|tree| tree.id != tree_id);
        if trees.len() == before {
            return Ok(false);
        }
        self.save_trees(&trees).await?;
        tracing::info!(tree_id = %tree_id, "TreeStore: deleted tree");
        Ok(true)
    }

    /// Append a turn under `parent_turn_id` and make it current.
    ///
    /// Returns `None` when the tree or parent is missing, the parent's path is
    /// broken, or the explicit id is already taken.
    pub async fn add_turn(
        &self,
        tree_id: &str,
        parent_turn_id: &str,
        new_turn: NewTurn,
    ) -> Result<Option<TurnId>> {
        self.mutate_tree(tree_id, |tree, manager| {
            let path = tree.path_to(parent_turn_id)?;
            let turn_id = new_turn
                .explicit_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            if tree.contains(&turn_id) {
                tracing::warn!(tree_id = %tree.id, turn_id = %turn_id, "TreeStore: turn id already in use");
                return None;
            }

            let parent_resolved = manager.restore_variable_state(parent_turn_id, &path);
            let live_state = new_turn
                .variables
                .clone()
                .unwrap_or_else(|| parent_resolved.clone());
            let policy = manager.policy();
            let force_snapshot = policy.signals_initialization(&new_turn.user_input)
                || policy.signals_initialization(&new_turn.full_response);
            let record = manager.create_variable_record(
                &turn_id,
                path.last(),
                &parent_resolved,
                &live_state,
                force_snapshot,
                diff_depth(&path),
            );

            let mut turn = Turn::root(turn_id.clone());
            turn.parent_id = Some(parent_turn_id.to_string());
            turn.user_input = new_turn.user_input;
            turn.response = new_turn.response;
            turn.full_response = new_turn.full_response;
            turn.reasoning = new_turn.reasoning;
            turn.parsed = new_turn.parsed.filter(|parsed| !parsed.is_empty());
            record.write_to(&mut turn);

            tracing::info!(
                tree_id = %tree.id,
                turn_id = %turn_id,
                parent_id = %parent_turn_id,
                snapshot = turn.is_snapshot(),
                "TreeStore: added turn"
            );
            tree.turns.push(turn);
            tree.current_turn_id = turn_id.clone();
            Some(turn_id)
        })
        .await
    }

    /// Patch a turn in place.
    ///
    /// New `variables` are re-recorded against the parent, and every
    /// descendant is re-recorded so its resolved state stays what it was.
    pub async fn update_turn(
        &self,
        tree_id: &str,
        turn_id: &str,
        update: TurnUpdate,
    ) -> Result<Option<ConversationTree>> {
        self.mutate_tree(tree_id, |tree, manager| {
            let path = tree.path_to(turn_id)?;
            let record = match (&update.variables, path.len()) {
                (Some(variables), len) if len >= 2 => {
                    let parent_path = &path[..len - 1];
                    let parent = &parent_path[len - 2];
                    let parent_resolved = manager.restore_variable_state(&parent.id, parent_path);
                    Some(manager.create_variable_record(
                        turn_id,
                        Some(parent),
                        &parent_resolved,
                        variables,
                        false,
                        diff_depth(parent_path),
                    ))
                }
                (Some(_), _) => {
                    tracing::warn!(tree_id = %tree.id, "TreeStore: root turn carries no variable state");
                    None
                }
                (None, _) => None,
            };
            let descendants = if record.is_some() {
                descendant_states(tree, manager, turn_id)
            } else {
                Vec::new()
            };

            let turn = tree.get_mut(turn_id)?;
            if let Some(user_input) = update.user_input {
                turn.user_input = user_input;
            }
            if let Some(response) = update.response {
                turn.response = response;
            }
            if let Some(full_response) = update.full_response {
                turn.full_response = full_response;
            }
            if let Some(reasoning) = update.reasoning {
                turn.reasoning = Some(reasoning);
            }
            if let Some(parsed) = update.parsed {
                turn.parsed = Some(parsed);
            }
            if let Some(record) = record {
                record.write_to(turn);
            }

            if !descendants.is_empty() {
                tracing::debug!(
                    tree_id = %tree.id,
                    turn_id = %turn_id,
                    rewritten = descendants.len(),
                    "TreeStore: re-recording descendants of edited turn"
                );
            }
            for (descendant_id, state, was_snapshot) in descendants {
                rerecord(tree, manager, &descendant_id, &state, was_snapshot);
            }
            Some(tree.clone())
        })
        .await
    }

    /// Move the current pointer to `turn_id`, validating and if needed
    /// repairing the state chain first.
    pub async fn switch_branch(&self, tree_id: &str, turn_id: &str) -> Result<Option<BranchSwitch>> {
        self.mutate_tree(tree_id, |tree, manager| {
            let mut path = tree.path_to(turn_id)?;
            let report = manager.validate_variable_state(&path);

            let mut repaired = false;
            if !report.is_valid {
                tracing::warn!(
                    tree_id = %tree.id,
                    turn_id = %turn_id,
                    broken_at = ?report.broken_at,
                    issue = ?report.issue,
                    "TreeStore: state chain invalid, attempting repair"
                );
                repaired = manager.repair_variable_state_chain(&mut path, None);
                tree.write_back_state(&path);
                if !repaired {
                    tracing::warn!(tree_id = %tree.id, turn_id = %turn_id, "TreeStore: repair incomplete, restoring best effort");
                }
            }

            let state = manager.restore_variable_state(turn_id, &path);
            tree.current_turn_id = turn_id.to_string();
            Some(BranchSwitch {
                tree: tree.clone(),
                state,
                repaired,
            })
        })
        .await
    }

    /// Delete `turn_id` and its whole subtree. The root cannot be deleted.
    pub async fn delete_turn(&self, tree_id: &str, turn_id: &str) -> Result<Option<ConversationTree>> {
        self.mutate_tree(tree_id, |tree, _| {
            if turn_id == tree.root_id() {
                tracing::warn!(tree_id = %tree.id, "TreeStore: refusing to delete the root turn");
                return None;
            }
            let parent_id = tree.get(turn_id)?.parent_id.clone()?;

            let removed = tree.subtree_ids(turn_id);
            tree.turns.retain(|turn| !removed.contains(&turn.id));
            if removed.contains(&tree.current_turn_id) {
                tree.current_turn_id = parent_id;
            }

            tracing::info!(
                tree_id = %tree.id,
                turn_id = %turn_id,
                removed = removed.len(),
                current = %tree.current_turn_id,
                "TreeStore: deleted subtree"
            );
            Some(tree.clone())
        })
        .await
    }

    /// Drop every turn except the root.
    pub async fn clear_history(&self, tree_id: &str) -> Result<Option<ConversationTree>> {
        self.mutate_tree(tree_id, |tree, _| {
            let root_id = tree.id.clone();
            tree.turns.retain(|turn| turn.id == root_id);
            tree.current_turn_id = root_id;
            Some(tree.clone())
        })
        .await
    }

    /// Turns from the root to `turn_id`, inclusive.
    pub async fn get_path_to_turn(&self, tree_id: &str, turn_id: &str) -> Result<Option<Vec<Turn>>> {
        self.read_tree(tree_id, |tree| tree.path_to(turn_id)).await
    }

    pub async fn get_child_turns(&self, tree_id: &str, turn_id: &str) -> Result<Vec<Turn>> {
        let children = self
            .read_tree(tree_id, |tree| {
                Some(tree.children_of(turn_id).into_iter().cloned().collect())
            })
            .await?;
        Ok(children.unwrap_or_default())
    }

    pub async fn node_exists(&self, tree_id: &str, turn_id: &str) -> Result<bool> {
        let exists = self
            .read_tree(tree_id, |tree| Some(tree.contains(turn_id)))
            .await?;
        Ok(exists.unwrap_or(false))
    }

    /// Most recently created turn (the root for an empty history).
    pub async fn get_last_turn_id(&self, tree_id: &str) -> Result<Option<TurnId>> {
        self.read_tree(tree_id, |tree| tree.turns.last().map(|turn| turn.id.clone()))
            .await
    }

    /// Response of the first turn under the root, which frames the conversation.
    pub async fn get_system_message(&self, tree_id: &str) -> Result<Option<String>> {
        self.read_tree(tree_id, |tree| {
            tree.children_of(tree.root_id())
                .first()
                .map(|turn| turn.response.clone())
        })
        .await
    }

    pub async fn resolve_state(&self, tree_id: &str, turn_id: &str) -> Result<Option<VariableState>> {
        let manager = &self.state_manager;
        self.read_tree(tree_id, |tree| {
            let path = tree.path_to(turn_id)?;
            Some(manager.restore_variable_state(turn_id, &path))
        })
        .await
    }

    pub async fn validate_turn(&self, tree_id: &str, turn_id: &str) -> Result<Option<ValidationReport>> {
        let manager = &self.state_manager;
        self.read_tree(tree_id, |tree| {
            let path = tree.path_to(turn_id)?;
            Some(manager.validate_variable_state(&path))
        })
        .await
    }

    pub async fn storage_statistics(
        &self,
        tree_id: &str,
        turn_id: &str,
    ) -> Result<Option<StorageStatistics>> {
        let manager = &self.state_manager;
        self.read_tree(tree_id, |tree| {
            let path = tree.path_to(turn_id)?;
            Some(manager.get_storage_statistics(&path))
        })
        .await
    }
}

/// Resolved state of every turn below `turn_id`, parents before children.
fn descendant_states(
    tree: &ConversationTree,
    manager: &BranchStateManager,
    turn_id: &str,
) -> Vec<(TurnId, VariableState, bool)> {
    let below = tree.subtree_ids(turn_id);
    tree.turns
        .iter()
        .filter(|turn| turn.id != turn_id && below.contains(&turn.id))
        .filter_map(|turn| {
            let path = tree.path_to(&turn.id)?;
            let state = manager.restore_variable_state(&turn.id, &path);
            Some((turn.id.clone(), state, turn.is_snapshot()))
        })
        .collect()
}

/// Store `state` for `turn_id` again, relative to its current parent.
fn rerecord(
    tree: &mut ConversationTree,
    manager: &BranchStateManager,
    turn_id: &str,
    state: &VariableState,
    force_snapshot: bool,
) {
    let Some(path) = tree.path_to(turn_id) else {
        return;
    };
    let Some((_, parent_path)) = path.split_last() else {
        return;
    };
    let Some(parent) = parent_path.last() else {
        return;
    };
    let parent_resolved = manager.restore_variable_state(&parent.id, parent_path);
    let record = manager.create_variable_record(
        turn_id,
        Some(parent),
        &parent_resolved,
        state,
        force_snapshot,
        diff_depth(parent_path),
    );
    if let Some(turn) = tree.get_mut(turn_id) {
        record.write_to(turn);
    }
}
