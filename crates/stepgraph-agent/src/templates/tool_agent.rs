use std::sync::Arc;

use stepgraph_core::config::{AgentsConfig, ExecutorConfig};
use stepgraph_core::error::Result;
use stepgraph_core::state::StateSchema;
use stepgraph_core::traits::ChatModel;
use stepgraph_tools::ToolRegistry;

use super::MESSAGES;
use crate::graph::{CompiledGraph, GraphDefinition};
use crate::tool_loop::ToolLoopRunner;

pub const NAME: &str = "tool_agent";

/// The whole tool loop as one node, bounded by `max_tool_iterations`.
pub fn build(
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    executor: &ExecutorConfig,
    agents: &AgentsConfig,
) -> Result<CompiledGraph> {
    let runner = ToolLoopRunner::new(model, tools, MESSAGES)
        .with_preamble(agents.system_prompt.clone())
        .with_max_iterations(executor.max_tool_iterations)
        .with_parallel_tools(executor.parallel_tools);

    GraphDefinition::new(NAME, StateSchema::new().append_by_id(MESSAGES))
        .add_tool_loop("agent", runner)
        .set_entry("agent")
        .compile()
}
