//! Goal decomposition: the model splits a goal into independent tasks,
//! each task is processed by its own child, and the outcomes are listed.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use stepgraph_core::config::AgentsConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::state::{RunState, StateSchema, StateUpdate};
use stepgraph_core::traits::ChatModel;
use stepgraph_core::types::ChatMessage;

use super::{latest_user_text, TaskResult, MESSAGES};
use crate::graph::{
    node_fn, ChildInvocation, CompiledGraph, FanOut, GraphDefinition, NodeContext, NodeHandler,
};
use crate::tool_loop::complete_turn;

pub const NAME: &str = "parallel_processor";

const GOAL: &str = "goal";
const TASKS: &str = "tasks";
const TASK: &str = "task";
const TASK_RESULTS: &str = "task_results";
const SUMMARY: &str = "summary";

/// One unit of work produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: usize,
    pub description: String,
}

pub fn build(model: Arc<dyn ChatModel>, agents: &AgentsConfig) -> Result<CompiledGraph> {
    let schema = StateSchema::new()
        .append_by_id(MESSAGES)
        .replace(GOAL)
        .replace(TASKS)
        .replace(TASK)
        .accumulate(TASK_RESULTS)
        .replace(SUMMARY);

    let dispatch = FanOut::new(|state: &RunState| {
        let tasks: Vec<Task> = state.get_as(TASKS)?.unwrap_or_default();
        Ok(tasks
            .into_iter()
            .map(|task| ChildInvocation::new("process_task", json!({ "task": task })))
            .collect())
    })
    .target("process_task")
    .join("summarize_results")
    .inputs(&[GOAL])
    .outputs(&[TASK_RESULTS])
    .failures(TASK_RESULTS);

    GraphDefinition::new(NAME, schema)
        .add_node(
            "decompose_tasks",
            Planner {
                model: Arc::clone(&model),
                preamble: agents.system_prompt.clone(),
            },
        )
        .add_fan_out("dispatch", dispatch)
        .add_node("process_task", Worker { model })
        .add_node("summarize_results", node_fn(summarize_results))
        .add_edge("decompose_tasks", "dispatch")
        .set_entry("decompose_tasks")
        .compile()
}

struct Planner {
    model: Arc<dyn ChatModel>,
    preamble: Option<String>,
}

impl NodeHandler for Planner {
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let goal = match state.get_str(GOAL) {
                Some(goal) => goal.to_string(),
                None => latest_user_text(state)?,
            };
            let prompt = format!(
                "Decompose the following goal into independent tasks. \
                 Reply with a JSON array of short task descriptions and nothing else.\n\nGoal: {}",
                goal
            );
            let reply = complete_turn(
                self.model.as_ref(),
                &[ChatMessage::user(prompt)],
                &[],
                self.preamble.as_deref(),
                ctx,
            )
            .await?;

            let tasks = parse_tasks(&reply.text()).unwrap_or_else(|| {
                warn!(node = %ctx.node, "Planner reply is not a task list; treating the goal as one task");
                vec![Task {
                    id: 1,
                    description: goal.clone(),
                }]
            });
            info!(node = %ctx.node, tasks = tasks.len(), "Planned tasks");

            StateUpdate::new()
                .set(GOAL, Value::String(goal))
                .set_serialized(TASKS, &tasks)
        })
    }
}

/// Accepts `["a", "b"]` or `[{"description": "a"}, ...]`, optionally
/// wrapped in a markdown code fence.
fn parse_tasks(reply: &str) -> Option<Vec<Task>> {
    let body = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let items: Vec<Value> = serde_json::from_str(body).ok()?;
    let descriptions: Vec<String> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s),
            Value::Object(map) => map
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string),
            _ => None,
        })
        .filter(|d| !d.trim().is_empty())
        .collect();
    if descriptions.is_empty() {
        return None;
    }
    Some(
        descriptions
            .into_iter()
            .enumerate()
            .map(|(i, description)| Task {
                id: i + 1,
                description,
            })
            .collect(),
    )
}

struct Worker {
    model: Arc<dyn ChatModel>,
}

impl NodeHandler for Worker {
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let task: Task = state.get_as(TASK)?.ok_or_else(|| StepGraphError::NodeFailed {
                node: ctx.node.clone(),
                message: "no task in state".into(),
            })?;
            let goal = state.get_str(GOAL).unwrap_or_default();
            let prompt = format!(
                "Overall goal: {}\n\nComplete this task and report the outcome briefly: {}",
                goal, task.description
            );
            let reply = complete_turn(self.model.as_ref(), &[ChatMessage::user(prompt)], &[], None, ctx)
                .await?;

            let result = TaskResult {
                task: serde_json::to_value(&task)?,
                result_code: 0,
                message: reply.text(),
            };
            StateUpdate::new().set_serialized(TASK_RESULTS, &result)
        })
    }
}

async fn summarize_results(state: RunState, ctx: NodeContext) -> Result<StateUpdate> {
    let mut lines: Vec<(u64, String)> = state
        .items(TASK_RESULTS)
        .iter()
        .map(|entry| match serde_json::from_value::<TaskResult>(entry.clone()) {
            Ok(result) => (
                result.task["id"].as_u64().unwrap_or(0),
                format!(
                    "- {}: {}",
                    result.task["description"].as_str().unwrap_or("task"),
                    result.message
                ),
            ),
            Err(_) => (
                entry["input"][TASK]["id"].as_u64().unwrap_or(0),
                format!(
                    "- {}: failed: {}",
                    entry["input"][TASK]["description"].as_str().unwrap_or("task"),
                    entry["error"].as_str().unwrap_or("unknown error")
                ),
            ),
        })
        .collect();
    // Children finish in any order; list them in plan order.
    lines.sort_by_key(|(id, _)| *id);
    let summary = lines
        .into_iter()
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n");
    info!(node = %ctx.node, "Summarized task results");

    StateUpdate::new()
        .set(SUMMARY, Value::String(summary.clone()))
        .messages(MESSAGES, &[ChatMessage::assistant_text(summary)])
}
