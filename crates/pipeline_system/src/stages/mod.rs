//! Built-in stages for turning a user message into a finalized response
//!
//! ```text
//! message_hooks → context_assembly → knowledge_injection → model_invocation
//!               → response_parsing → response_hooks
//! ```

pub mod context_assembly;
pub mod hooks;
pub mod knowledge;
pub mod model;
pub mod openai;
pub mod response_parsing;

use std::sync::Arc;

use chat_core::{ModelConfig, PipelineSettings};
use extension_system::HookDispatcher;

use crate::engine::{Pipeline, PipelineBuilder};
use crate::error::PipelineError;

pub use context_assembly::ContextAssemblyStage;
pub use hooks::{MessageHooksStage, ResponseHooksStage};
pub use knowledge::{KeywordKnowledgeBase, KnowledgeEntry, KnowledgeInjectionStage, KnowledgeSource};
pub use model::{ModelClient, ModelInvocationStage, ModelResponse, TokenUsage};
pub use openai::OpenAiChatClient;
pub use response_parsing::{parse_response, ParsedResponse, ResponseParsingStage};

/// Context field names shared by the built-in stages.
pub mod fields {
    pub const TREE_ID: &str = "tree_id";
    pub const PARENT_TURN_ID: &str = "parent_turn_id";
    pub const USER_INPUT: &str = "user_input";
    pub const SYSTEM_MESSAGE: &str = "system_message";
    /// Resolved variable state at the parent turn.
    pub const VARIABLES: &str = "variables";
    /// Earlier exchanges on the active branch, oldest first.
    pub const HISTORY: &str = "history";
    pub const SYSTEM_PROMPT: &str = "system_prompt";
    pub const USER_PROMPT: &str = "user_prompt";
    pub const KNOWLEDGE: &str = "knowledge";
    pub const RAW_RESPONSE: &str = "raw_response";
    pub const TOKEN_USAGE: &str = "token_usage";
    pub const RESPONSE: &str = "response";
    pub const REASONING: &str = "reasoning";
    pub const NEXT_PROMPTS: &str = "next_prompts";
    pub const EVENTS: &str = "events";
    pub const VARIABLE_UPDATES: &str = "variable_updates";
    pub const INIT_VARIABLES: &str = "init_variables";
    pub const FINAL_RESPONSE: &str = "final_response";
    /// `on_message` failures, carried to the response hooks.
    pub const MESSAGE_HOOK_FAILURES: &str = "message_hook_failures";
    /// Every hook and tool failure of the run.
    pub const HOOK_FAILURES: &str = "hook_failures";
}

/// Stage ids of the default chain.
pub mod ids {
    pub const MESSAGE_HOOKS: &str = "message_hooks";
    pub const CONTEXT_ASSEMBLY: &str = "context_assembly";
    pub const KNOWLEDGE_INJECTION: &str = "knowledge_injection";
    pub const MODEL_INVOCATION: &str = "model_invocation";
    pub const RESPONSE_PARSING: &str = "response_parsing";
    pub const RESPONSE_HOOKS: &str = "response_hooks";
}

/// Collaborators the default chain is built from.
#[derive(Clone)]
pub struct PipelineDeps {
    pub dispatcher: Arc<HookDispatcher>,
    pub knowledge: Arc<dyn KnowledgeSource>,
    pub model: Arc<dyn ModelClient>,
    pub model_config: ModelConfig,
    pub settings: PipelineSettings,
}

/// The standard six-stage chain.
pub fn default_pipeline(deps: PipelineDeps) -> Result<Pipeline, PipelineError> {
    PipelineBuilder::new()
        .stage(Arc::new(MessageHooksStage::new(deps.dispatcher.clone())))
        .stage(Arc::new(ContextAssemblyStage::new(deps.settings.max_history_turns)))
        .stage(Arc::new(KnowledgeInjectionStage::new(
            deps.knowledge,
            deps.settings.knowledge_limit,
        )))
        .stage(Arc::new(ModelInvocationStage::new(deps.model, deps.model_config)))
        .stage(Arc::new(ResponseParsingStage::new()))
        .stage(Arc::new(ResponseHooksStage::new(deps.dispatcher)))
        .entry(ids::MESSAGE_HOOKS)
        .build()
}
