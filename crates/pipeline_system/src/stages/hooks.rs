//! Extension hook stages
//!
//! Hook failures never fail these stages; the dispatcher isolates them and
//! they are reported through `hook_failures`.

use std::sync::Arc;

use async_trait::async_trait;
use extension_system::{HookDispatcher, HookFailure, HookMessage, ToolExecutionContext};
use serde_json::Value;

use super::{fields, ids};
use crate::error::StageError;
use crate::stage::{FieldMap, FieldMapExt, Stage, StageDescriptor};

fn hook_message(input: &FieldMap, content: &str) -> HookMessage {
    let mut message = HookMessage::new(content);
    if let Some(tree_id) = input.opt_str(fields::TREE_ID) {
        message = message.in_tree(
            tree_id,
            input.opt_str(fields::PARENT_TURN_ID).map(str::to_string),
        );
    }
    message
}

fn failures_value(failures: &[HookFailure]) -> Result<Value, StageError> {
    serde_json::to_value(failures).map_err(|error| StageError::failed(error.to_string()))
}

/// Runs `on_message` hooks over the user input.
pub struct MessageHooksStage {
    descriptor: StageDescriptor,
    dispatcher: Arc<HookDispatcher>,
}

impl MessageHooksStage {
    pub fn new(dispatcher: Arc<HookDispatcher>) -> Self {
        Self {
            descriptor: StageDescriptor::new(ids::MESSAGE_HOOKS)
                .inputs([fields::USER_INPUT])
                .optional_inputs([fields::TREE_ID, fields::PARENT_TURN_ID])
                .outputs([fields::USER_INPUT, fields::MESSAGE_HOOK_FAILURES])
                .then(ids::CONTEXT_ASSEMBLY),
            dispatcher,
        }
    }
}

#[async_trait]
impl Stage for MessageHooksStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn transform(&self, input: FieldMap) -> Result<FieldMap, StageError> {
        let content = input.require_str(fields::USER_INPUT)?;
        let outcome = self
            .dispatcher
            .dispatch_message(hook_message(&input, content))
            .await;

        let mut output = FieldMap::new();
        output.insert(
            fields::USER_INPUT.to_string(),
            Value::String(outcome.message.content),
        );
        output.insert(
            fields::MESSAGE_HOOK_FAILURES.to_string(),
            failures_value(&outcome.failures)?,
        );
        Ok(output)
    }
}

/// Runs `on_response` hooks and the inline tool-call pass over the parsed
/// response.
pub struct ResponseHooksStage {
    descriptor: StageDescriptor,
    dispatcher: Arc<HookDispatcher>,
}

impl ResponseHooksStage {
    pub fn new(dispatcher: Arc<HookDispatcher>) -> Self {
        Self {
            descriptor: StageDescriptor::new(ids::RESPONSE_HOOKS)
                .inputs([fields::RESPONSE])
                .optional_inputs([
                    fields::TREE_ID,
                    fields::PARENT_TURN_ID,
                    fields::VARIABLES,
                    fields::MESSAGE_HOOK_FAILURES,
                ])
                .outputs([fields::FINAL_RESPONSE, fields::HOOK_FAILURES]),
            dispatcher,
        }
    }
}

#[async_trait]
impl Stage for ResponseHooksStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn transform(&self, input: FieldMap) -> Result<FieldMap, StageError> {
        let content = input.require_str(fields::RESPONSE)?;
        let context = ToolExecutionContext {
            tree_id: input.opt_str(fields::TREE_ID).map(str::to_string),
            turn_id: input.opt_str(fields::PARENT_TURN_ID).map(str::to_string),
            variables: input
                .get(fields::VARIABLES)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        };

        let earlier: Vec<HookFailure> = input
            .get(fields::MESSAGE_HOOK_FAILURES)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|error| StageError::failed(error.to_string()))?
            .unwrap_or_default();

        let outcome = self
            .dispatcher
            .process_response_after(hook_message(&input, content), &context, earlier)
            .await;

        let failures = failures_value(&outcome.failures)?;
        let mut output = FieldMap::new();
        output.insert(
            fields::FINAL_RESPONSE.to_string(),
            Value::String(outcome.message.content),
        );
        output.insert(fields::HOOK_FAILURES.to_string(), failures);
        Ok(output)
    }
}
