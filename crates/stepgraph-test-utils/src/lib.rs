//! Shared mocks and fixtures for StepGraph tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::traits::{ChatModel, Tool};
use stepgraph_core::types::{ChatMessage, ToolCall, ToolSchema};

/// A model that replays a fixed script of responses.
///
/// Every request is recorded so tests can inspect what the model saw.
/// When the script runs out, it answers with a plain "done" message.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<ChatMessage>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    tool_names: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ChatMessage>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Default::default()
        }
    }

    /// Queue a failing completion.
    pub fn push_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(StepGraphError::ModelRequest(message.to_string())));
    }

    pub fn push(&self, message: ChatMessage) {
        self.responses.lock().unwrap().push_back(Ok(message));
    }

    /// Number of completions requested so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Messages sent with the n-th request.
    pub fn request(&self, n: usize) -> Vec<ChatMessage> {
        self.requests.lock().unwrap()[n].clone()
    }

    /// Tool names offered with the n-th request.
    pub fn offered_tools(&self, n: usize) -> Vec<String> {
        self.tool_names.lock().unwrap()[n].clone()
    }
}

impl ChatModel for ScriptedModel {
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolSchema],
    ) -> BoxFuture<'_, Result<ChatMessage>> {
        self.requests.lock().unwrap().push(messages);
        self.tool_names
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        let next = self.responses.lock().unwrap().pop_front();
        Box::pin(async move { next.unwrap_or_else(|| Ok(ChatMessage::assistant_text("done"))) })
    }
}

/// A model that proposes a tool call on every turn.
pub struct LoopingModel {
    tool: String,
    calls: AtomicUsize,
}

impl LoopingModel {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChatModel for LoopingModel {
    fn complete(
        &self,
        _messages: Vec<ChatMessage>,
        _tools: &[ToolSchema],
    ) -> BoxFuture<'_, Result<ChatMessage>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let msg = ChatMessage::assistant_tool_calls(
            "",
            vec![ToolCall::new(format!("call-{n}"), self.tool.clone(), json!({}))],
        );
        Box::pin(async move { Ok(msg) })
    }
}

/// A model that answers every request with the text of the last message,
/// prefixed by `prefix`.
pub struct EchoModel {
    prefix: String,
}

impl EchoModel {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl ChatModel for EchoModel {
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _tools: &[ToolSchema],
    ) -> BoxFuture<'_, Result<ChatMessage>> {
        let last = messages.last().map(|m| m.text()).unwrap_or_default();
        let reply = format!("{}{}", self.prefix, last);
        Box::pin(async move { Ok(ChatMessage::assistant_text(reply)) })
    }
}

/// Synchronous tool returning a fixed payload and counting invocations.
pub struct StaticTool {
    name: String,
    payload: Value,
    pub invocations: Arc<AtomicUsize>,
}

impl StaticTool {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed payload"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn invoke(&self, _args: Value) -> Result<Value> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(self.payload.clone())
    }
}

/// Synchronous tool that always fails.
pub struct FailingTool {
    name: String,
}

impl FailingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn invoke(&self, _args: Value) -> Result<Value> {
        Err(StepGraphError::ToolInvocation {
            tool: self.name.clone(),
            message: "backend unavailable".into(),
        })
    }
}

/// Asynchronous tool that sleeps before echoing its arguments.
pub struct SleepyTool {
    name: String,
    delay: Duration,
    timeout_secs: u64,
}

impl SleepyTool {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            timeout_secs: 30,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Tool for SleepyTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sleeps, then echoes its arguments"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn is_async(&self) -> bool {
        true
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn invoke_async(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(args)
        })
    }
}

/// Minimal valid config TOML.
pub const MINIMAL_CONFIG: &str = r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test"
"#;

/// Write `content` to a temp file and return its handle.
pub fn temp_config(content: &str) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write config");
    tmp
}

/// Parse a TOML fixture, panicking on invalid input.
pub fn toml_fixture(content: &str) -> toml::Value {
    toml::from_str(content).expect("valid toml fixture")
}
