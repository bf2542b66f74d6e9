use std::sync::Arc;

use stepgraph_core::config::{AgentsConfig, ExecutorConfig};
use stepgraph_core::error::Result;
use stepgraph_core::state::StateSchema;
use stepgraph_core::traits::ChatModel;
use stepgraph_tools::ToolRegistry;

use super::MESSAGES;
use crate::graph::{CompiledGraph, GraphDefinition, END};
use crate::tool_loop::{tools_condition, ModelNode, ToolNode, ToolsRoute};

pub const NAME: &str = "chat_with_tools";

/// `model` proposes, `tools` executes, and control returns to `model` until
/// it answers without tool calls. Every turn is a separate step, so the
/// executor's step budget bounds the loop.
pub fn build(
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    executor: &ExecutorConfig,
    agents: &AgentsConfig,
) -> Result<CompiledGraph> {
    let model_node = ModelNode::new(model, MESSAGES)
        .with_tools(&tools)
        .with_preamble(agents.system_prompt.clone());
    let tool_node = ToolNode::new(tools, MESSAGES).with_parallel_tools(executor.parallel_tools);

    GraphDefinition::new(NAME, StateSchema::new().append_by_id(MESSAGES))
        .add_node("model", model_node)
        .add_node("tools", tool_node)
        .add_conditional_edge(
            "model",
            tools_condition(MESSAGES),
            [(ToolsRoute::Tools, "tools"), (ToolsRoute::End, END)],
        )
        .add_edge("tools", "model")
        .set_entry("model")
        .compile()
}
