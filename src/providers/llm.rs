//! Streaming LLM provider
//!
//! The dispatcher consumes an ordered stream of [`LlmEvent`]s; this module is
//! the only place that knows the OpenAI-compatible wire format (SSE deltas,
//! tool-call chunks, argument strings that are sometimes raw objects).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One chat message on the provider wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }
}

/// Completed tool-call record as stored in the transcript and replayed to the
/// provider on follow-up turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    pub r#type: String,
    pub function: FunctionPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionPayload {
    pub name: String,
    /// Arguments as a JSON-encoded string (OpenAI convention).
    pub arguments: String,
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tagged item of the reply stream.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// A chunk of assistant text.
    Content(String),
    /// A chunk of a structured tool call. Fields arrive incrementally.
    ToolCall(ToolCallDelta),
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Capability contract consumed by the dispatcher, the intent classifier and
/// the memory summarizer.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Stream a reply for the transcript. Events arrive in generation order;
    /// the channel closes at end-of-reply.
    async fn chat_stream(
        &self,
        session_id: &str,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<LlmEvent>>;

    /// One-shot non-streaming completion (intent classification, memory
    /// summarization).
    async fn chat_once(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

// ─── OpenAI-compatible adapter ───────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiLlmConfig {
    /// Base URL of the API, e.g. "https://api.openai.com/v1"
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model_name: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_llm_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "qwen2.5".to_string()
}

pub struct OpenAiLlm {
    client: Client,
    config: OpenAiLlmConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionChunk>,
}

#[derive(Debug, Deserialize)]
struct FunctionChunk {
    #[serde(default)]
    name: Option<String>,
    /// Some backends send arguments as a raw object instead of a string.
    #[serde(default, deserialize_with = "deserialize_arguments")]
    arguments: Option<String>,
}

fn deserialize_arguments<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl OpenAiLlm {
    pub fn new(block: serde_yaml::Value) -> Result<Self> {
        let config: OpenAiLlmConfig = if block.is_null() {
            serde_yaml::from_str("{}").expect("default LLM config")
        } else {
            serde_yaml::from_value(block).context("invalid OpenAILLM config")?
        };
        Ok(Self { client: Client::new(), config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Llm for OpenAiLlm {
    async fn chat_stream(
        &self,
        session_id: &str,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        let request = ChatRequest {
            model: &self.config.model_name,
            messages: &messages,
            max_tokens: self.config.max_tokens,
            stream: Some(true),
            tools: tools.as_deref(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("failed to send streaming request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, body);
        }

        let (tx, rx) = mpsc::channel(64);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("LLM stream read error ({}): {}", session_id, e);
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by a blank line.
                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);

                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data == "[DONE]" {
                            return;
                        }
                        let Ok(resp) = serde_json::from_str::<StreamResponse>(data) else {
                            debug!("unparseable stream delta: {}", data);
                            continue;
                        };
                        let Some(choice) = resp.choices.into_iter().next() else { continue };
                        if let Some(calls) = choice.delta.tool_calls {
                            for call in calls {
                                let delta = ToolCallDelta {
                                    id: call.id,
                                    name: call.function.as_ref().and_then(|f| f.name.clone()),
                                    arguments: call.function.and_then(|f| f.arguments),
                                };
                                if tx.send(LlmEvent::ToolCall(delta)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty()
                                && tx.send(LlmEvent::Content(content)).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn chat_once(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let messages =
            vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)];
        let request = ChatRequest {
            model: &self.config.model_name,
            messages: &messages,
            max_tokens: self.config.max_tokens,
            stream: None,
            tools: None,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("failed to send request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, body);
        }

        // Navigate the raw value instead of strict structs: providers disagree
        // on optional fields.
        let raw: serde_json::Value =
            response.json().await.context("failed to parse LLM response")?;
        let content = raw
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_arguments_accept_object_form() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"id":"c1","function":{"name":"set_volume","arguments":{"value":50}}}]}}]}"#;
        let resp: StreamResponse = serde_json::from_str(data).unwrap();
        let call = resp.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(call[0].function.as_ref().unwrap().arguments.as_deref(), Some(r#"{"value":50}"#));
    }

    #[test]
    fn chat_message_serializes_without_empty_fields() {
        let msg = ChatMessage::user("你好");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }
}
