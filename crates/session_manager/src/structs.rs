use chat_core::VariableState;
use context_manager::TurnId;
use extension_system::HookFailure;
use pipeline_system::ProcessingStats;
use serde::Serialize;

/// Result of one message exchange appended to a tree.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    pub parent_turn_id: TurnId,
    /// Text shown to the user, after response hooks and tool calls.
    pub response: String,
    pub reasoning: Option<String>,
    pub next_prompts: Vec<String>,
    pub events: Vec<String>,
    /// Live variable state recorded on the new turn.
    pub variables: VariableState,
    pub hook_failures: Vec<HookFailure>,
    pub stats: ProcessingStats,
}
