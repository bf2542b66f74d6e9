use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::RunState;

/// Unique run identifier (also used as the checkpoint key).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// A chat message in the conversation history.
///
/// `id` is the identity used by append-by-id fields: writing a message whose
/// id already exists in history replaces the earlier entry in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn with_role(role: Role, text: String) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: vec![ContentBlock::Text { text }],
            timestamp: Some(Utc::now()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text.into())
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text.into())
    }

    /// An assistant message proposing the given tool calls.
    pub fn assistant_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        let mut content = Vec::with_capacity(calls.len() + 1);
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
        content.extend(calls.into_iter().map(|c| ContentBlock::ToolUse {
            id: c.id,
            name: c.name,
            input: c.arguments,
        }));
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool calls proposed by this message, in proposal order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    /// Tool result block carried by this message, if it is a tool message.
    pub fn tool_result(&self) -> Option<(&str, &str, bool)> {
        self.content.iter().find_map(|b| match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => Some((tool_use_id.as_str(), content.as_str(), *is_error)),
            _ => None,
        })
    }
}

/// A tool call proposed by a model response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(serde_json::Value),
    Error(String),
}

/// Result of one tool call. Always recorded, even on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(id: impl Into<String>, name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            outcome: ToolOutcome::Success(value),
        }
    }

    pub fn error(id: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            outcome: ToolOutcome::Error(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// Text fed back to the model for this result.
    ///
    /// String payloads are passed through; other payloads are JSON-encoded.
    /// Errors are wrapped as `{"error": "..."}`.
    pub fn content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success(serde_json::Value::String(s)) => s.clone(),
            ToolOutcome::Success(other) => other.to_string(),
            ToolOutcome::Error(message) => serde_json::json!({ "error": message }).to_string(),
        }
    }

    /// Convert into a history message. The message id is derived from the
    /// call id so re-running a call overwrites its earlier result.
    pub fn into_message(self) -> ChatMessage {
        let content = self.content();
        let is_error = self.is_error();
        ChatMessage {
            id: format!("tool-result-{}", self.id),
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: self.id,
                name: self.name,
                content,
                is_error,
            }],
            timestamp: Some(Utc::now()),
        }
    }
}

/// Tool schema sent to the model with each completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Where a run stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Suspended at a human-input node; resumable.
    Interrupted { node: String, prompt: String },
    /// Reached a terminal edge.
    Completed,
    /// Cancelled by the caller before `node` finished.
    Cancelled { node: String },
    /// Terminated by a run-level error.
    Failed { error: String },
}

/// Serialized run snapshot persisted between calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub run_id: RunId,
    /// Catalog name of the graph the run belongs to.
    pub graph: String,
    pub state: RunState,
    pub status: RunStatus,
    /// Steps consumed so far; resumed runs continue counting from here.
    pub steps: usize,
    pub updated_at: DateTime<Utc>,
}

/// Event broadcast to all subscribers while runs progress.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// Run started at the given entry node.
    RunStarted { run_id: RunId, graph: String },
    /// A node finished and its update was merged.
    NodeCompleted {
        run_id: RunId,
        node: String,
        step: usize,
        state: RunState,
    },
    /// Tool execution started.
    ToolStart {
        run_id: RunId,
        name: String,
        input: serde_json::Value,
    },
    /// Tool execution completed.
    ToolEnd { run_id: RunId, result: ToolResult },
    /// A fan-out node dispatched its children.
    FanOutDispatched {
        run_id: RunId,
        node: String,
        children: usize,
    },
    /// Run suspended waiting for human input.
    RunInterrupted {
        run_id: RunId,
        node: String,
        prompt: String,
    },
    /// Run reached a terminal node.
    RunCompleted { run_id: RunId, steps: usize },
    /// Run was cancelled; partial state was retained.
    RunCancelled { run_id: RunId, node: String },
    /// Run failed.
    RunFailed { run_id: RunId, error: String },
}

impl GraphEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::ToolStart { run_id, .. }
            | Self::ToolEnd { run_id, .. }
            | Self::FanOutDispatched { run_id, .. }
            | Self::RunInterrupted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunCancelled { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }

    /// Whether no further events will follow for this run (until resumed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunInterrupted { .. }
                | Self::RunCompleted { .. }
                | Self::RunCancelled { .. }
                | Self::RunFailed { .. }
        )
    }
}
