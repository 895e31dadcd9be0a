//! Text-generation collaborator.
//!
//! Speaks the OpenAI chat-completions wire format (served here via
//! OpenRouter) with function calling. The pipeline treats it as an opaque
//! request/response step that either replies or asks for a capability.

use crate::events::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Error type for text-generation calls
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("malformed completion: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;

/// A capability advertised to the generator, OpenAI function schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// What one generation step produced.
#[derive(Debug, Clone)]
pub enum GenerateOutcome {
    /// A final natural-language reply.
    Reply(String),
    /// The generator wants a capability invoked before it can reply.
    ToolCall {
        id: String,
        name: String,
        args: Value,
        /// Raw tool_calls array, echoed back into the context.
        raw: Value,
    },
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage], tools: &[ToolSpec])
        -> Result<GenerateOutcome>;
}

/// Chat-completions client against OpenRouter.
pub struct OpenRouterGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Value>,
}

impl OpenRouterGenerator {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: "https://openrouter.ai/api/v1".to_string(),
        }
    }
}

#[async_trait]
impl TextGenerator for OpenRouterGenerator {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<GenerateOutcome> {
        let tools = if tools.is_empty() {
            None
        } else {
            Some(
                tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            )
        };

        let request = CompletionRequest { model: &self.model, messages, tools };
        debug!(model = %self.model, messages = messages.len(), "requesting completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "https://github.com/wirelive/wirelive")
            .header("X-Title", "wirelive voice agent")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} - {}", status, body)));
        }

        let completion: CompletionResponse = response.json().await?;
        let message = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed("no choices".into()))?
            .message;

        if let Some(raw) = message.tool_calls {
            let first = raw
                .get(0)
                .ok_or_else(|| LlmError::Malformed("empty tool_calls".into()))?;
            let id = first
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let function = first
                .get("function")
                .ok_or_else(|| LlmError::Malformed("tool call without function".into()))?;
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| LlmError::Malformed("tool call without name".into()))?
                .to_string();
            // Arguments arrive as a JSON-encoded string.
            let args = function
                .get("arguments")
                .and_then(Value::as_str)
                .map(|s| serde_json::from_str(s).unwrap_or(Value::Null))
                .unwrap_or(Value::Null);
            return Ok(GenerateOutcome::ToolCall { id, name, args, raw });
        }

        match message.content {
            Some(text) if !text.trim().is_empty() => Ok(GenerateOutcome::Reply(text)),
            _ => Err(LlmError::Malformed("completion with no content".into())),
        }
    }
}

/// Deterministic generator for mock mode and tests: echoes the last user
/// message back as the reply.
pub struct MockGenerator;

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<GenerateOutcome> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::events::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("nothing");
        Ok(GenerateOutcome::Reply(format!("You said: {}", last_user)))
    }
}
