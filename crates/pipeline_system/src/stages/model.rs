use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chat_core::ModelConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{fields, ids};
use crate::error::{ModelError, StageError};
use crate::stage::{FieldMap, FieldMapExt, Stage, StageDescriptor};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// A chat model backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        config: &ModelConfig,
    ) -> Result<ModelResponse, ModelError>;
}

/// Calls the model with the assembled prompts. The configured timeout applies
/// to this stage only.
pub struct ModelInvocationStage {
    descriptor: StageDescriptor,
    client: Arc<dyn ModelClient>,
    config: ModelConfig,
}

impl ModelInvocationStage {
    pub fn new(client: Arc<dyn ModelClient>, config: ModelConfig) -> Self {
        Self {
            descriptor: StageDescriptor::new(ids::MODEL_INVOCATION)
                .inputs([fields::SYSTEM_PROMPT, fields::USER_PROMPT])
                .outputs([fields::RAW_RESPONSE, fields::TOKEN_USAGE])
                .then(ids::RESPONSE_PARSING),
            client,
            config,
        }
    }
}

#[async_trait]
impl Stage for ModelInvocationStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn transform(&self, input: FieldMap) -> Result<FieldMap, StageError> {
        let system = input.require_str(fields::SYSTEM_PROMPT)?;
        let user = input.require_str(fields::USER_PROMPT)?;

        tracing::info!(model = %self.config.model, stream = self.config.stream, "ModelInvocation: calling model");
        let call = self.client.complete(system, user, &self.config);
        let response = match self.config.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), call)
                .await
                .map_err(|_| StageError::Timeout(secs))??,
            None => call.await?,
        };

        if let Some(usage) = &response.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "ModelInvocation: token usage"
            );
        }

        let usage = match response.usage {
            Some(usage) => serde_json::to_value(usage)
                .map_err(|error| StageError::failed(error.to_string()))?,
            None => Value::Null,
        };
        let mut output = FieldMap::new();
        output.insert(fields::RAW_RESPONSE.to_string(), Value::String(response.text));
        output.insert(fields::TOKEN_USAGE.to_string(), usage);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl ModelClient for Slow {
        async fn complete(&self, _: &str, _: &str, _: &ModelConfig) -> Result<ModelResponse, ModelError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ModelResponse::text("late"))
        }
    }

    struct Echo;

    #[async_trait]
    impl ModelClient for Echo {
        async fn complete(&self, system: &str, user: &str, _: &ModelConfig) -> Result<ModelResponse, ModelError> {
            Ok(ModelResponse {
                text: format!("{system}|{user}"),
                usage: Some(TokenUsage {
                    prompt_tokens: 3,
                    completion_tokens: 1,
                    total_tokens: 4,
                }),
            })
        }
    }

    fn prompts() -> FieldMap {
        let mut input = FieldMap::new();
        input.insert("system_prompt".into(), "sys".into());
        input.insert("user_prompt".into(), "hi".into());
        input
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_slow_models() {
        let config = ModelConfig {
            timeout_secs: Some(1),
            ..ModelConfig::default()
        };
        let stage = ModelInvocationStage::new(Arc::new(Slow), config);
        let error = stage.transform(prompts()).await.unwrap_err();
        assert!(matches!(error, StageError::Timeout(1)));
    }

    #[tokio::test]
    async fn records_text_and_usage() {
        let stage = ModelInvocationStage::new(Arc::new(Echo), ModelConfig::default());
        let output = stage.transform(prompts()).await.unwrap();
        assert_eq!(output["raw_response"], "sys|hi");
        assert_eq!(output["token_usage"]["total_tokens"], 4);
    }
}
