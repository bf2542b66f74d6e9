//! Ready-made agent graphs registered under fixed catalog names.
//!
//! Every template reads the conversation from [`MESSAGES`]; start a run
//! with [`question_input`].

pub mod chat_with_tools;
pub mod parallel_processor;
pub mod parallel_rag;
pub mod task_decomposer;
pub mod tool_agent;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stepgraph_core::config::{AgentsConfig, ExecutorConfig};
use stepgraph_core::error::Result;
use stepgraph_core::state::{RunState, StateUpdate};
use stepgraph_core::traits::ChatModel;
use stepgraph_core::types::{ChatMessage, Role};
use stepgraph_tools::ToolRegistry;

use crate::catalog::GraphCatalog;

/// Conversation history field shared by all templates.
pub const MESSAGES: &str = "messages";

/// Initial update for a run: the question as the first user message.
pub fn question_input(question: &str) -> Result<StateUpdate> {
    StateUpdate::new().messages(MESSAGES, &[ChatMessage::user(question)])
}

/// Text of the most recent user message.
pub(crate) fn latest_user_text(state: &RunState) -> Result<String> {
    Ok(state
        .messages(MESSAGES)?
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.text())
        .unwrap_or_default())
}

/// One entry of a fan-out results list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: Value,
    /// 0 on success, 1 when the task's tool call failed.
    pub result_code: i32,
    pub message: String,
}

/// Compile every built-in template into a catalog.
pub fn builtin_catalog(
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    executor: &ExecutorConfig,
    agents: &AgentsConfig,
) -> Result<GraphCatalog> {
    let mut catalog = GraphCatalog::new();
    catalog.register(
        chat_with_tools::NAME,
        "Model and tool nodes looping until the model stops calling tools",
        Arc::new(chat_with_tools::build(Arc::clone(&model), tools.clone(), executor, agents)?),
    );
    catalog.register(
        tool_agent::NAME,
        "Single bounded tool loop node",
        Arc::new(tool_agent::build(Arc::clone(&model), tools.clone(), executor, agents)?),
    );
    catalog.register(
        parallel_rag::NAME,
        "Tool calls fanned out in parallel, answered per tool, then summarized",
        Arc::new(parallel_rag::build(Arc::clone(&model), tools, agents)?),
    );
    catalog.register(
        parallel_processor::NAME,
        "Goal split into tasks processed in parallel, then summarized",
        Arc::new(parallel_processor::build(Arc::clone(&model), agents)?),
    );
    catalog.register(
        task_decomposer::NAME,
        "Planning chat with a human review loop",
        Arc::new(task_decomposer::build(model, agents)?),
    );
    Ok(catalog)
}
