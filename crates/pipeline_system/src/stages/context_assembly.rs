use async_trait::async_trait;
use serde_json::Value;

use super::{fields, ids};
use crate::error::StageError;
use crate::stage::{FieldMap, FieldMapExt, Stage, StageDescriptor};

const DEFAULT_SYSTEM_PROMPT: &str = "You are the narrator of an interactive conversation.";

/// Builds the model prompts from the system framing, the resolved variables
/// and recent history on the active branch.
pub struct ContextAssemblyStage {
    descriptor: StageDescriptor,
    max_history_turns: usize,
}

impl ContextAssemblyStage {
    pub fn new(max_history_turns: usize) -> Self {
        Self {
            descriptor: StageDescriptor::new(ids::CONTEXT_ASSEMBLY)
                .inputs([fields::USER_INPUT])
                .optional_inputs([fields::SYSTEM_MESSAGE, fields::VARIABLES, fields::HISTORY])
                .outputs([fields::SYSTEM_PROMPT, fields::USER_PROMPT])
                .then(ids::KNOWLEDGE_INJECTION),
            max_history_turns,
        }
    }
}

fn system_prompt(input: &FieldMap) -> String {
    let mut prompt = input
        .opt_str(fields::SYSTEM_MESSAGE)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .to_string();

    if let Some(variables) = input
        .get(fields::VARIABLES)
        .and_then(Value::as_object)
        .filter(|variables| !variables.is_empty())
    {
        prompt.push_str("\n\nCurrent variables:\n");
        prompt.push_str(&Value::Object(variables.clone()).to_string());
    }
    prompt
}

fn user_prompt(input: &FieldMap, user_input: &str, max_history_turns: usize) -> String {
    let history = input
        .get(fields::HISTORY)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let recent = &history[history.len().saturating_sub(max_history_turns)..];
    if recent.is_empty() {
        return user_input.to_string();
    }

    let mut prompt = String::from("Conversation so far:\n");
    for exchange in recent {
        if let Some(user) = exchange.get("user").and_then(Value::as_str) {
            if !user.is_empty() {
                prompt.push_str(&format!("User: {user}\n"));
            }
        }
        if let Some(assistant) = exchange.get("assistant").and_then(Value::as_str) {
            prompt.push_str(&format!("Assistant: {assistant}\n"));
        }
    }
    prompt.push_str(&format!("\nUser: {user_input}"));
    prompt
}

#[async_trait]
impl Stage for ContextAssemblyStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn transform(&self, input: FieldMap) -> Result<FieldMap, StageError> {
        let user_input = input.require_str(fields::USER_INPUT)?;

        let mut output = FieldMap::new();
        output.insert(
            fields::SYSTEM_PROMPT.to_string(),
            Value::String(system_prompt(&input)),
        );
        output.insert(
            fields::USER_PROMPT.to_string(),
            Value::String(user_prompt(&input, user_input, self.max_history_turns)),
        );
        Ok(output)
    }
}
