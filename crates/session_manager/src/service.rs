//! Conversation service
//!
//! Runs one user message through the pipeline and appends the result to the
//! tree:
//!
//! ```text
//! lock tree → resolve parent state → seed context → pipeline
//!           → live state = (initvar or parent state) + <vars> updates
//!           → append turn (snapshot when the response re-initializes state)
//! ```
//!
//! Mutations of one tree are serialized by a per-tree async mutex. Reads do
//! not take the lock.

use std::sync::Arc;

use chat_core::state::merge_update;
use chat_core::{Config, VariableState};
use context_manager::{
    BranchSwitch, ConversationTree, ConversationTreeStore, NewTurn, ParsedFields,
    StorageStatistics, Turn, ValidationReport,
};
use dashmap::DashMap;
use extension_system::{HookDispatcher, HookFailure};
use pipeline_system::stages::{KnowledgeSource, ModelClient};
use pipeline_system::{
    default_pipeline, fields, CancellationToken, ExecutionState, FieldMap, Pipeline, PipelineDeps,
    PipelineRun, StageError,
};
use serde_json::{json, Value};
use storage_manager::RecordStorage;
use tokio::sync::Mutex;

use crate::error::{Result, ServiceError};
use crate::structs::TurnOutcome;

pub struct ConversationService {
    store: Arc<ConversationTreeStore>,
    pipeline: Arc<Pipeline>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationService {
    pub fn new(store: Arc<ConversationTreeStore>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            store,
            pipeline,
            locks: DashMap::new(),
        }
    }

    /// Wire the default pipeline and a tree store from configuration.
    pub fn from_config(
        config: &Config,
        storage: Arc<dyn RecordStorage>,
        dispatcher: Arc<HookDispatcher>,
        knowledge: Arc<dyn KnowledgeSource>,
        model: Arc<dyn ModelClient>,
    ) -> Result<Self> {
        let pipeline = default_pipeline(PipelineDeps {
            dispatcher,
            knowledge,
            model,
            model_config: config.model.clone(),
            settings: config.pipeline.clone(),
        })?;
        let store = ConversationTreeStore::new(storage, config.snapshot_policy.clone());
        Ok(Self::new(Arc::new(store), Arc::new(pipeline)))
    }

    pub fn store(&self) -> &Arc<ConversationTreeStore> {
        &self.store
    }

    fn tree_lock(&self, tree_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(tree_id.to_string()).or_default().clone()
    }

    /// Open the conversation for `owner_id`, creating its tree on first use.
    ///
    /// A system message is stored as the first turn under the root, and only
    /// when the tree has no turns yet.
    pub async fn open_conversation(
        &self,
        owner_id: &str,
        system_message: Option<&str>,
    ) -> Result<ConversationTree> {
        let tree = self.store.create_tree(owner_id).await?;
        let Some(system_message) = system_message else {
            return Ok(tree);
        };

        let tree_id = tree.id.clone();
        let lock = self.tree_lock(&tree_id);
        let _guard = lock.lock().await;
        if !self.store.get_child_turns(&tree_id, &tree_id).await?.is_empty() {
            return Ok(tree);
        }
        self.store
            .add_turn(&tree_id, &tree_id, NewTurn::new("", system_message))
            .await?;
        tracing::info!(tree_id = %tree_id, "ConversationService: stored system message");
        Ok(self.store.get_tree(&tree_id).await?.unwrap_or(tree))
    }

    /// Send `text` as a reply to `parent_turn_id`, or to the current turn when
    /// no parent is given.
    ///
    /// Returns `Ok(None)` when the tree or parent turn does not exist. Nothing
    /// is persisted unless the whole pipeline completes.
    pub async fn send_message(
        &self,
        tree_id: &str,
        parent_turn_id: Option<&str>,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnOutcome>> {
        let lock = self.tree_lock(tree_id);
        let _guard = lock.lock().await;

        let Some(tree) = self.store.get_tree(tree_id).await? else {
            return Ok(None);
        };
        let parent_id = parent_turn_id
            .unwrap_or(tree.current_turn_id.as_str())
            .to_string();
        let Some(path) = tree.path_to(&parent_id) else {
            tracing::debug!(tree_id = %tree_id, parent_id = %parent_id, "ConversationService: parent turn not found");
            return Ok(None);
        };
        let parent_state = self
            .store
            .state_manager()
            .restore_variable_state(&parent_id, &path);
        // A first turn without user input holds the system message.
        let framing = tree
            .children_of(tree.root_id())
            .first()
            .filter(|turn| turn.user_input.is_empty())
            .map(|turn| (*turn).clone());

        let seed = seed_context(tree_id, &parent_id, text, framing.as_ref(), &parent_state, &path);
        let run = self.pipeline.execute(seed, cancel).await;
        let run = finished(run)?;
        let context = &run.context;

        let response = string_field(context, fields::FINAL_RESPONSE)?;
        let full_response = string_field(context, fields::RAW_RESPONSE)?;
        let reasoning = context
            .get(fields::REASONING)
            .and_then(Value::as_str)
            .map(str::to_string);
        let next_prompts = strings_field(context, fields::NEXT_PROMPTS);
        let events = strings_field(context, fields::EVENTS);
        let updates = object_field(context, fields::VARIABLE_UPDATES).unwrap_or_default();
        let base = object_field(context, fields::INIT_VARIABLES).unwrap_or(parent_state);
        let variables = merge_update(&base, &updates);
        let hook_failures: Vec<HookFailure> = context
            .get(fields::HOOK_FAILURES)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|_| ServiceError::InvalidOutput {
                field: fields::HOOK_FAILURES.to_string(),
            })?
            .unwrap_or_default();

        let new_turn = NewTurn {
            user_input: text.to_string(),
            response: response.clone(),
            full_response,
            reasoning: reasoning.clone(),
            parsed: Some(ParsedFields {
                next_prompts: next_prompts.clone(),
                events: events.clone(),
            }),
            explicit_id: None,
            variables: Some(variables.clone()),
        };
        let Some(turn_id) = self.store.add_turn(tree_id, &parent_id, new_turn).await? else {
            return Ok(None);
        };

        tracing::info!(
            tree_id = %tree_id,
            turn_id = %turn_id,
            parent_id = %parent_id,
            stages = run.stats.stages_run,
            duration_ms = run.stats.total_duration_ms,
            "ConversationService: turn appended"
        );
        Ok(Some(TurnOutcome {
            turn_id,
            parent_turn_id: parent_id,
            response,
            reasoning,
            next_prompts,
            events,
            variables,
            hook_failures,
            stats: run.stats,
        }))
    }

    pub async fn switch_branch(&self, tree_id: &str, turn_id: &str) -> Result<Option<BranchSwitch>> {
        let lock = self.tree_lock(tree_id);
        let _guard = lock.lock().await;
        Ok(self.store.switch_branch(tree_id, turn_id).await?)
    }

    pub async fn delete_turn(&self, tree_id: &str, turn_id: &str) -> Result<Option<ConversationTree>> {
        let lock = self.tree_lock(tree_id);
        let _guard = lock.lock().await;
        Ok(self.store.delete_turn(tree_id, turn_id).await?)
    }

    pub async fn clear_history(&self, tree_id: &str) -> Result<Option<ConversationTree>> {
        let lock = self.tree_lock(tree_id);
        let _guard = lock.lock().await;
        Ok(self.store.clear_history(tree_id).await?)
    }

    /// Drop the tree and its lock entry.
    pub async fn delete_conversation(&self, tree_id: &str) -> Result<bool> {
        let lock = self.tree_lock(tree_id);
        let deleted = {
            let _guard = lock.lock().await;
            self.store.delete_tree(tree_id).await?
        };
        self.locks.remove(tree_id);
        Ok(deleted)
    }

    /// Turns on the active branch, root first.
    pub async fn active_path(&self, tree_id: &str) -> Result<Option<Vec<Turn>>> {
        let Some(tree) = self.store.get_tree(tree_id).await? else {
            return Ok(None);
        };
        Ok(tree.path_to(&tree.current_turn_id))
    }

    pub async fn state_at(&self, tree_id: &str, turn_id: &str) -> Result<Option<VariableState>> {
        Ok(self.store.resolve_state(tree_id, turn_id).await?)
    }

    pub async fn validate(&self, tree_id: &str, turn_id: &str) -> Result<Option<ValidationReport>> {
        Ok(self.store.validate_turn(tree_id, turn_id).await?)
    }

    pub async fn statistics(&self, tree_id: &str, turn_id: &str) -> Result<Option<StorageStatistics>> {
        Ok(self.store.storage_statistics(tree_id, turn_id).await?)
    }
}

fn seed_context(
    tree_id: &str,
    parent_id: &str,
    text: &str,
    framing: Option<&Turn>,
    parent_state: &VariableState,
    path: &[Turn],
) -> FieldMap {
    let framing_id = framing.map(|turn| turn.id.as_str());
    let history: Vec<Value> = path
        .iter()
        .filter(|turn| !turn.is_root() && Some(turn.id.as_str()) != framing_id)
        .map(|turn| json!({"user": turn.user_input, "assistant": turn.response}))
        .collect();

    let mut seed = FieldMap::new();
    seed.insert(fields::TREE_ID.to_string(), json!(tree_id));
    seed.insert(fields::PARENT_TURN_ID.to_string(), json!(parent_id));
    seed.insert(fields::USER_INPUT.to_string(), json!(text));
    if let Some(framing) = framing {
        seed.insert(fields::SYSTEM_MESSAGE.to_string(), json!(framing.response));
    }
    seed.insert(fields::VARIABLES.to_string(), Value::Object(parent_state.clone()));
    seed.insert(fields::HISTORY.to_string(), Value::Array(history));
    seed
}

fn finished(mut run: PipelineRun) -> Result<PipelineRun> {
    match run.state.clone() {
        ExecutionState::Completed => Ok(run),
        ExecutionState::Failed(stage) => Err(ServiceError::Stage {
            source: run
                .error
                .take()
                .unwrap_or_else(|| StageError::failed("no error recorded")),
            stage,
        }),
        ExecutionState::Cancelled(stage) => {
            tracing::info!(stage = %stage, "ConversationService: run cancelled, nothing persisted");
            Err(ServiceError::Cancelled { stage })
        }
        ExecutionState::Pending | ExecutionState::Running(_) => Err(ServiceError::Stage {
            stage: String::new(),
            source: StageError::failed("pipeline stopped without a final state"),
        }),
    }
}

fn string_field(context: &FieldMap, field: &str) -> Result<String> {
    context
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::InvalidOutput {
            field: field.to_string(),
        })
}

fn strings_field(context: &FieldMap, field: &str) -> Vec<String> {
    context
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn object_field(context: &FieldMap, field: &str) -> Option<VariableState> {
    context.get(field).and_then(Value::as_object).cloned()
}
