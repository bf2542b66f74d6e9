use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stepgraph_core::config::ModelConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::ChatModel;
use stepgraph_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiChatModel {
    http: Client,
    config: ModelConfig,
}

impl OpenAiChatModel {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

// Request types
#[derive(Serialize)]
pub(crate) struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
}

impl ChatRequest {
    /// Build a request body. `model` is omitted for deployment-addressed
    /// endpoints (Azure).
    pub(crate) fn new(
        config: &ModelConfig,
        model: Option<String>,
        messages: Vec<ChatMessage>,
        tools: &[ToolSchema],
    ) -> Self {
        Self {
            model,
            messages: convert_messages(messages),
            max_tokens: config.max_tokens,
            temperature: if config.temperature > 0.0 {
                Some(config.temperature)
            } else {
                None
            },
            tools: convert_tools(tools),
        }
    }
}

#[derive(Serialize, Debug)]
pub(crate) struct OaiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiToolCall {
    #[serde(default)]
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: OaiFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Serialize)]
pub(crate) struct OaiTool {
    r#type: String,
    function: OaiToolDef,
}

#[derive(Serialize)]
pub(crate) struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaiToolCall>>,
}

pub(crate) fn convert_tools(tools: &[ToolSchema]) -> Vec<OaiTool> {
    tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function".to_string(),
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

pub(crate) fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    let mut oai_msgs = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System | Role::User => {
                oai_msgs.push(OaiMessage {
                    role: if msg.role == Role::System { "system" } else { "user" }.to_string(),
                    content: Some(msg.text()),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            Role::Assistant => {
                let calls = msg.tool_calls();
                let text = msg.text();
                if calls.is_empty() {
                    oai_msgs.push(OaiMessage {
                        role: "assistant".to_string(),
                        content: Some(text),
                        tool_calls: None,
                        tool_call_id: None,
                    });
                } else {
                    let calls = calls
                        .into_iter()
                        .map(|c| OaiToolCall {
                            id: c.id,
                            r#type: function_type(),
                            function: OaiFunction {
                                name: c.name,
                                arguments: c.arguments.to_string(),
                            },
                        })
                        .collect();
                    oai_msgs.push(OaiMessage {
                        role: "assistant".to_string(),
                        content: if text.is_empty() { None } else { Some(text) },
                        tool_calls: Some(calls),
                        tool_call_id: None,
                    });
                }
            }
            Role::Tool => {
                if let Some((id, content, _)) = msg.tool_result() {
                    oai_msgs.push(OaiMessage {
                        role: "tool".to_string(),
                        content: Some(content.to_string()),
                        tool_calls: None,
                        tool_call_id: Some(id.to_string()),
                    });
                }
            }
        }
    }

    oai_msgs
}

pub(crate) fn parse_response(response: ChatResponse) -> Result<ChatMessage> {
    let response_id = response.id;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| StepGraphError::ModelResponse("response has no choices".into()))?;

    if choice.finish_reason.as_deref() == Some("length") {
        warn!("Model hit max tokens");
    }

    let calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let arguments = if tc.function.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments))
            };
            ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments,
            }
        })
        .collect();

    let text = choice.message.content.unwrap_or_default();
    let message = if calls.is_empty() {
        ChatMessage::assistant_text(text)
    } else {
        ChatMessage::assistant_tool_calls(text, calls)
    };

    Ok(match response_id {
        Some(id) => message.with_id(id),
        None => message,
    })
}

/// Send a prepared request and parse the completion.
pub(crate) async fn send_chat(req: RequestBuilder, body: &ChatRequest) -> Result<ChatMessage> {
    let response = req
        .header("content-type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| StepGraphError::ModelRequest(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        return Err(StepGraphError::ModelRequest(format!("HTTP {}: {}", status, body)));
    }

    let parsed: ChatResponse = response
        .json()
        .await
        .map_err(|e| StepGraphError::ModelResponse(e.to_string()))?;
    parse_response(parsed)
}

impl ChatModel for OpenAiChatModel {
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolSchema],
    ) -> BoxFuture<'_, Result<ChatMessage>> {
        let body = ChatRequest::new(
            &self.config,
            Some(self.config.model_id.clone()),
            messages,
            tools,
        );

        Box::pin(async move {
            let base_url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            debug!(model = %self.config.model_id, url = %base_url, "Requesting completion");

            let mut req = self.http.post(base_url);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            send_chat(req, &body).await
        })
    }
}
