//! Hook dispatch and the inline tool-call pass
//!
//! Hooks run one at a time in registration order. A hook that fails or
//! panics is logged and skipped: the next hook receives the message as it was
//! before the failing hook ran.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::host::ExtensionHost;
use crate::manifest::Capability;
use crate::message::HookMessage;
use crate::tools::{detect_tool_calls, ToolExecutionContext, ToolParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    OnMessage,
    OnResponse,
    ToolCall,
}

impl HookPoint {
    fn as_str(self) -> &'static str {
        match self {
            HookPoint::OnMessage => "on_message",
            HookPoint::OnResponse => "on_response",
            HookPoint::ToolCall => "tool_call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookFailure {
    /// Extension id, or the tool name for tool failures.
    pub source: String,
    pub point: HookPoint,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookOutcome {
    pub message: HookMessage,
    pub failures: Vec<HookFailure>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolPassOutcome {
    pub text: String,
    /// Tools that ran and had their output substituted, in document order.
    pub executed: Vec<String>,
    /// Detected calls naming no registered tool.
    pub skipped: Vec<String>,
    pub failures: Vec<HookFailure>,
}

pub struct HookDispatcher {
    host: Arc<ExtensionHost>,
    annotate_errors: bool,
}

impl HookDispatcher {
    pub fn new(host: Arc<ExtensionHost>) -> Self {
        Self {
            host,
            annotate_errors: false,
        }
    }

    /// Append a short error note to the response text when a hook or tool fails.
    pub fn with_annotations(mut self, annotate_errors: bool) -> Self {
        self.annotate_errors = annotate_errors;
        self
    }

    pub fn host(&self) -> &Arc<ExtensionHost> {
        &self.host
    }

    pub async fn dispatch_message(&self, message: HookMessage) -> HookOutcome {
        self.dispatch(HookPoint::OnMessage, message).await
    }

    pub async fn dispatch_response(&self, message: HookMessage) -> HookOutcome {
        self.dispatch(HookPoint::OnResponse, message).await
    }

    async fn dispatch(&self, point: HookPoint, message: HookMessage) -> HookOutcome {
        let capability = match point {
            HookPoint::OnMessage => Capability::Messages,
            _ => Capability::Responses,
        };

        let mut current = message;
        let mut failures = Vec::new();
        for active in self.host.active_for(capability).await {
            let hook = async {
                match point {
                    HookPoint::OnMessage => {
                        active.extension.on_message(current.clone(), &active.api).await
                    }
                    _ => active.extension.on_response(current.clone(), &active.api).await,
                }
            };
            let result = match guarded(hook).await {
                Ok(result) => result.map_err(|error| format!("{error:#}")),
                Err(panic) => Err(panic),
            };
            match result {
                Ok(updated) => current = updated,
                Err(error) => {
                    warn!("Extension '{}' failed in {}: {}", active.id, point.as_str(), error);
                    failures.push(HookFailure {
                        source: active.id.clone(),
                        point,
                        error,
                    });
                }
            }
        }

        HookOutcome {
            message: current,
            failures,
        }
    }

    /// Execute inline tool calls in `text` and substitute their results.
    ///
    /// Unknown tools are left in place with a warning. A failing tool keeps
    /// its original call text.
    pub async fn run_tool_calls(&self, text: &str, context: &ToolExecutionContext) -> ToolPassOutcome {
        let calls = detect_tool_calls(text);
        if calls.is_empty() {
            return ToolPassOutcome {
                text: text.to_string(),
                ..Default::default()
            };
        }

        let registry = self.host.tools();
        let mut outcome = ToolPassOutcome::default();
        let mut cursor = 0;
        for call in calls {
            outcome.text.push_str(&text[cursor..call.span.start]);
            cursor = call.span.end;
            let original = &text[call.span.clone()];

            let Some(tool) = registry.get(&call.tool_name) else {
                warn!("Skipping call to unknown tool '{}'", call.tool_name);
                outcome.skipped.push(call.tool_name);
                outcome.text.push_str(original);
                continue;
            };

            debug!("Executing tool '{}' ({:?})", call.tool_name, call.syntax);
            let result = match guarded(tool.execute(context, ToolParams::new(call.raw_params))).await {
                Ok(result) => result.map_err(|error| error.to_string()),
                Err(panic) => Err(panic),
            };
            match result {
                Ok(result) => {
                    outcome.text.push_str(&result);
                    outcome.executed.push(call.tool_name);
                }
                Err(error) => {
                    warn!("Tool '{}' failed: {}", call.tool_name, error);
                    outcome.text.push_str(original);
                    outcome.failures.push(HookFailure {
                        source: call.tool_name,
                        point: HookPoint::ToolCall,
                        error,
                    });
                }
            }
        }
        outcome.text.push_str(&text[cursor..]);
        outcome
    }

    /// Response hooks, then the tool pass, then the optional annotation.
    pub async fn process_response(
        &self,
        message: HookMessage,
        context: &ToolExecutionContext,
    ) -> HookOutcome {
        self.process_response_after(message, context, Vec::new()).await
    }

    /// Like [`Self::process_response`], with failures from earlier hooks of
    /// the same run listed first and included in the annotation.
    pub async fn process_response_after(
        &self,
        message: HookMessage,
        context: &ToolExecutionContext,
        earlier: Vec<HookFailure>,
    ) -> HookOutcome {
        let response = self.dispatch_response(message).await;
        let mut message = response.message;
        let mut failures = earlier;
        failures.extend(response.failures);

        let tools = self.run_tool_calls(&message.content, context).await;
        message.content = tools.text;
        failures.extend(tools.failures);

        if self.annotate_errors && !failures.is_empty() {
            message.content.push_str(&annotation(&failures));
        }
        HookOutcome { message, failures }
    }
}

/// Await extension code, turning a panic into an error message.
async fn guarded<F: Future>(future: F) -> Result<F::Output, String> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| format!("panicked: {}", panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn annotation(failures: &[HookFailure]) -> String {
    let notes: Vec<String> = failures
        .iter()
        .map(|failure| format!("{} ({}): {}", failure.source, failure.point.as_str(), failure.error))
        .collect();
    format!("\n\n[extension error] {}", notes.join("; "))
}
