use std::sync::Arc;

use stepgraph_core::config::AgentsConfig;
use stepgraph_core::error::Result;
use stepgraph_core::state::StateSchema;
use stepgraph_core::traits::ChatModel;

use super::MESSAGES;
use crate::graph::{CompiledGraph, GraphDefinition, Interrupt};
use crate::tool_loop::ModelNode;

pub const NAME: &str = "task_decomposer";

const PLANNER_PROMPT: &str = "Break the user's request into a numbered list of concrete tasks. \
When the user gives feedback, revise the list.";

/// `chat` drafts a plan, `review` suspends for feedback. Feedback loops back
/// to `chat`; the terminal token ends the run.
pub fn build(model: Arc<dyn ChatModel>, agents: &AgentsConfig) -> Result<CompiledGraph> {
    let preamble = agents
        .system_prompt
        .clone()
        .unwrap_or_else(|| PLANNER_PROMPT.to_string());
    let token = agents.review_terminal_token.trim().to_string();
    let review = Interrupt::new(
        format!("Reply with feedback on the plan, or type '{}' to stop.", token),
        MESSAGES,
    )
    .terminal_token(token)
    .on_continue("chat");

    GraphDefinition::new(NAME, StateSchema::new().append_by_id(MESSAGES))
        .add_node("chat", ModelNode::new(model, MESSAGES).with_preamble(Some(preamble)))
        .add_interrupt("review", review)
        .add_edge("chat", "review")
        .set_entry("chat")
        .compile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_core::config::ExecutorConfig;
    use stepgraph_core::types::*;
    use stepgraph_test_utils::EchoModel;
    use tokio_util::sync::CancellationToken;

    use crate::executor::{Executor, RunOutcome};
    use crate::templates::question_input;

    #[tokio::test]
    async fn review_loop_ends_on_custom_token() {
        let agents = AgentsConfig {
            review_terminal_token: "Ship It".into(),
            ..Default::default()
        };
        let graph = Arc::new(build(Arc::new(EchoModel::new("plan: ")), &agents).unwrap());
        let executor = Executor::new(&ExecutorConfig::default());
        let state = graph.initial_state(question_input("move house").unwrap()).unwrap();

        let outcome = executor.run(Arc::clone(&graph), state).await.unwrap();
        let (node, prompt) = match &outcome {
            RunOutcome::Interrupted { node, prompt, .. } => (node.clone(), prompt.clone()),
            other => panic!("expected interrupt, got {other:?}"),
        };
        assert_eq!(node, "review");
        assert!(prompt.contains("type 'Ship It' to stop"));

        let run_id = RunId::new();
        let outcome = executor
            .resume(
                Arc::clone(&graph),
                run_id.clone(),
                outcome.state().clone(),
                outcome.steps(),
                &node,
                "add packing",
                CancellationToken::new(),
            )
            .unwrap()
            .run_to_end()
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Interrupted { .. }));
        let history = outcome.state().messages(MESSAGES).unwrap();
        assert_eq!(history.last().unwrap().text(), "plan: add packing");

        let outcome = executor
            .resume(graph, run_id, outcome.state().clone(), outcome.steps(), &node, "ship   it", CancellationToken::new())
            .unwrap()
            .run_to_end()
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Completed);
    }
}
