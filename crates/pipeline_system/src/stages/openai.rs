//! OpenAI-compatible chat completions client
//!
//! Sends a system and a user message to `{api_base}/chat/completions`. With
//! `stream = true` the response is read as server-sent events and the deltas
//! are concatenated.

use async_trait::async_trait;
use chat_core::ModelConfig;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::model::{ModelClient, ModelResponse, TokenUsage};
use crate::error::ModelError;

pub struct OpenAiChatClient {
    client: Client,
}

impl Default for OpenAiChatClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiChatClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

pub(crate) fn build_body(system: &str, user: &str, config: &ModelConfig) -> Value {
    let mut body = json!({
        "model": config.model,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ],
        "stream": config.stream,
    });
    if let Some(temperature) = config.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = config.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if config.stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    body
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    if value.is_null() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

fn parse_completion(body: &Value) -> Result<ModelResponse, ModelError> {
    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ModelError::InvalidResponse("missing choices[0].message.content".to_string()))?;
    Ok(ModelResponse {
        text: text.to_string(),
        usage: parse_usage(&body["usage"]),
    })
}

#[async_trait]
impl ModelClient for OpenAiChatClient {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        config: &ModelConfig,
    ) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", config.api_base.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&build_body(system, user, config));
        if let Some(api_key) = &config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await?;
            return Err(ModelError::Api { status, body });
        }

        if !config.stream {
            let body: Value = response.json().await?;
            return parse_completion(&body);
        }

        let mut text = String::new();
        let mut usage = None;
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|error| ModelError::Stream(error.to_string()))?;
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }
            let chunk: Value = serde_json::from_str(data)
                .map_err(|error| ModelError::Stream(format!("invalid chunk: {error}")))?;
            if let Some(delta) = chunk["choices"][0]["delta"]["content"].as_str() {
                text.push_str(delta);
            }
            if let Some(chunk_usage) = parse_usage(&chunk["usage"]) {
                usage = Some(chunk_usage);
            }
        }

        Ok(ModelResponse { text, usage })
    }
}
