//! Retrieval fan-out: the model proposes one tool call per lookup, each
//! lookup runs as its own child (tool call plus a model answer grounded on
//! the observation), and the answers are joined into one reply.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use stepgraph_core::config::AgentsConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::state::{RunState, StateSchema, StateUpdate};
use stepgraph_core::traits::ChatModel;
use stepgraph_core::types::*;
use stepgraph_tools::ToolRegistry;

use super::{latest_user_text, TaskResult, MESSAGES};
use crate::graph::{
    node_fn, ChildInvocation, CompiledGraph, FanOut, GraphDefinition, NodeContext, NodeHandler,
};
use crate::tool_loop::{complete_turn, execute_tool_calls};

pub const NAME: &str = "parallel_rag";

const QUERY: &str = "query";
const TASKS: &str = "tasks";
const TASK: &str = "task";
const TASK_RESULTS: &str = "task_results";
const SUMMARY: &str = "summary";

pub(crate) const NO_RESULTS: &str = "I wasn't able to find any relevant information for your query.";

pub fn build(
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    agents: &AgentsConfig,
) -> Result<CompiledGraph> {
    let schema = StateSchema::new()
        .append_by_id(MESSAGES)
        .replace(QUERY)
        .replace(TASKS)
        .replace(TASK)
        .accumulate(TASK_RESULTS)
        .replace(SUMMARY);

    let dispatch = FanOut::new(|state: &RunState| {
        let tasks: Vec<ToolCall> = state.get_as(TASKS)?.unwrap_or_default();
        Ok(tasks
            .into_iter()
            .map(|task| ChildInvocation::new("run_task", json!({ "task": task })))
            .collect())
    })
    .target("run_task")
    .join("summarize_results")
    .inputs(&[QUERY])
    .outputs(&[TASK_RESULTS])
    .failures(TASK_RESULTS);

    GraphDefinition::new(NAME, schema)
        .add_node(
            "decompose_tasks",
            DecomposeTasks {
                model: Arc::clone(&model),
                tools: tools.schemas(),
                preamble: agents.system_prompt.clone(),
            },
        )
        .add_fan_out("dispatch", dispatch)
        .add_node("run_task", RunTask { model, tools })
        .add_node("summarize_results", node_fn(summarize_results))
        .add_edge("decompose_tasks", "dispatch")
        .set_entry("decompose_tasks")
        .compile()
}

/// Asks the model which lookups to make. The proposed tool calls become the
/// task list; the latest user message becomes the query.
struct DecomposeTasks {
    model: Arc<dyn ChatModel>,
    tools: Vec<ToolSchema>,
    preamble: Option<String>,
}

impl NodeHandler for DecomposeTasks {
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let history = state.messages(MESSAGES)?;
            if history.is_empty() {
                return Err(StepGraphError::NodeFailed {
                    node: ctx.node.clone(),
                    message: "no messages in state".into(),
                });
            }
            let query = latest_user_text(state)?;
            let reply = complete_turn(
                self.model.as_ref(),
                &history,
                &self.tools,
                self.preamble.as_deref(),
                ctx,
            )
            .await?;
            let tasks = reply.tool_calls();
            info!(node = %ctx.node, tasks = tasks.len(), "Decomposed query");

            StateUpdate::new()
                .set(QUERY, Value::String(query))
                .set_serialized(TASKS, &tasks)?
                .messages(MESSAGES, &[reply])
        })
    }
}

/// One lookup: run the task's tool call, then answer the query from the
/// observation alone.
struct RunTask {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
}

impl NodeHandler for RunTask {
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let task: ToolCall = state.get_as(TASK)?.ok_or_else(|| StepGraphError::NodeFailed {
                node: ctx.node.clone(),
                message: "no task in state".into(),
            })?;
            let query = state.get_str(QUERY).unwrap_or_default();

            let observation = execute_tool_calls(&self.tools, std::slice::from_ref(&task), false, ctx)
                .await?
                .pop()
                .map(|r| (r.content(), r.is_error()));
            let (observation, failed) = observation.unwrap_or_default();

            let answer = complete_turn(
                self.model.as_ref(),
                &[ChatMessage::user(query), ChatMessage::user(observation)],
                &[],
                None,
                ctx,
            )
            .await?;

            let result = TaskResult {
                task: serde_json::to_value(&task)?,
                result_code: i32::from(failed),
                message: answer.text(),
            };
            StateUpdate::new().set_serialized(TASK_RESULTS, &result)
        })
    }
}

async fn summarize_results(state: RunState, ctx: NodeContext) -> Result<StateUpdate> {
    let parts: Vec<String> = state.items(TASK_RESULTS).iter().map(render_entry).collect();
    let summary = if parts.is_empty() {
        NO_RESULTS.to_string()
    } else {
        parts.join("\n\n")
    };
    info!(node = %ctx.node, entries = parts.len(), "Summarized results");

    StateUpdate::new()
        .set(SUMMARY, Value::String(summary.clone()))
        .messages(MESSAGES, &[ChatMessage::assistant_text(summary)])
}

/// `**tool**: message` for answers; failed children keep their error text.
fn render_entry(entry: &Value) -> String {
    if let Ok(result) = serde_json::from_value::<TaskResult>(entry.clone()) {
        let tool = result.task["name"].as_str().unwrap_or("task");
        return format!("**{}**: {}", tool, result.message);
    }
    let tool = entry["input"][TASK]["name"]
        .as_str()
        .or_else(|| entry["node"].as_str())
        .unwrap_or("task");
    let error = entry["error"].as_str().unwrap_or("unknown error");
    format!("**{}**: failed: {}", tool, error)
}
