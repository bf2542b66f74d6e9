use std::sync::Arc;

use futures::stream::{self, BoxStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepgraph_core::config::ExecutorConfig;
use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::event::EventBus;
use stepgraph_core::state::{RunState, StateUpdate};
use stepgraph_core::types::*;

use crate::fanout::FanOutCoordinator;
use crate::graph::compiled::{CompiledGraph, Next, Transition};
use crate::graph::node::NodeKind;
use crate::graph::NodeContext;

/// How a run stopped without failing.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A terminal edge was reached.
    Completed { state: RunState, steps: usize },
    /// The run is suspended at an interrupt node waiting for a reply.
    Interrupted {
        state: RunState,
        steps: usize,
        node: String,
        prompt: String,
    },
    /// The run was cancelled while `node` was pending. `state` keeps every
    /// update merged so far, including completed fan-out children.
    Cancelled {
        state: RunState,
        steps: usize,
        node: String,
    },
}

impl RunOutcome {
    pub fn state(&self) -> &RunState {
        match self {
            Self::Completed { state, .. }
            | Self::Interrupted { state, .. }
            | Self::Cancelled { state, .. } => state,
        }
    }

    pub fn into_state(self) -> RunState {
        match self {
            Self::Completed { state, .. }
            | Self::Interrupted { state, .. }
            | Self::Cancelled { state, .. } => state,
        }
    }

    pub fn steps(&self) -> usize {
        match self {
            Self::Completed { steps, .. }
            | Self::Interrupted { steps, .. }
            | Self::Cancelled { steps, .. } => *steps,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Completed,
            Self::Interrupted { node, prompt, .. } => RunStatus::Interrupted {
                node: node.clone(),
                prompt: prompt.clone(),
            },
            Self::Cancelled { node, .. } => RunStatus::Cancelled { node: node.clone() },
        }
    }
}

/// One node's completion as seen by a stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub node: String,
    pub step: usize,
    pub state: RunState,
}

/// An item of an execution stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Node(NodeSnapshot),
    Done(RunOutcome),
}

/// Walks compiled graphs. One node runs at a time; only fan-out nodes
/// run work concurrently.
#[derive(Clone)]
pub struct Executor {
    max_steps: usize,
    fan_out: FanOutCoordinator,
    events: Arc<EventBus>,
}

impl Executor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            max_steps: config.max_steps.max(1),
            fan_out: FanOutCoordinator::new(config.fanout_concurrency),
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run `graph` from its entry node to completion, interruption or
    /// cancellation.
    pub async fn run(&self, graph: Arc<CompiledGraph>, state: RunState) -> Result<RunOutcome> {
        self.start(graph, RunId::new(), state, CancellationToken::new())
            .run_to_end()
            .await
    }

    /// Prepare a fresh run without executing anything yet.
    pub fn start(
        &self,
        graph: Arc<CompiledGraph>,
        run_id: RunId,
        state: RunState,
        cancel: CancellationToken,
    ) -> Execution {
        let entry = graph.entry;
        Execution {
            graph,
            executor: self.clone(),
            run_id,
            state,
            cursor: Cursor::At(entry),
            steps: 0,
            cancel,
            reply: None,
            announced: false,
        }
    }

    /// Continue a run suspended at interrupt node `node`, supplying the
    /// caller's reply. Step counting continues from `steps`.
    pub fn resume(
        &self,
        graph: Arc<CompiledGraph>,
        run_id: RunId,
        state: RunState,
        steps: usize,
        node: &str,
        reply: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Execution> {
        let idx = graph.index_of(node)?;
        if !matches!(graph.node(idx).kind, NodeKind::Interrupt(_)) {
            return Err(StepGraphError::NotInterrupted(run_id.to_string()));
        }
        Ok(Execution {
            graph,
            executor: self.clone(),
            run_id,
            state,
            cursor: Cursor::At(idx),
            steps,
            cancel,
            reply: Some(reply.into()),
            announced: true,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    At(usize),
    End,
    Finished,
}

/// A run in progress. Drive it with [`Execution::step`], or consume it with
/// [`Execution::run_to_end`] or [`Execution::into_stream`].
pub struct Execution {
    graph: Arc<CompiledGraph>,
    executor: Executor,
    run_id: RunId,
    state: RunState,
    cursor: Cursor,
    steps: usize,
    cancel: CancellationToken,
    reply: Option<String>,
    announced: bool,
}

impl Execution {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Advance by one node. Returns `None` once the run has finished or
    /// failed.
    pub async fn step(&mut self) -> Option<Result<Progress>> {
        if self.cursor == Cursor::Finished {
            return None;
        }
        if !self.announced {
            self.announced = true;
            info!(run_id = %self.run_id, graph = %self.graph.name, "Run started");
            self.publish(GraphEvent::RunStarted {
                run_id: self.run_id.clone(),
                graph: self.graph.name.clone(),
            });
        }

        let result = self.advance().await;
        match &result {
            Ok(Progress::Done(outcome)) => {
                self.cursor = Cursor::Finished;
                self.announce_outcome(outcome);
            }
            Ok(Progress::Node(_)) => {}
            Err(e) => {
                self.cursor = Cursor::Finished;
                error!(run_id = %self.run_id, error = %e, "Run failed");
                self.publish(GraphEvent::RunFailed {
                    run_id: self.run_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        Some(result)
    }

    /// Step until the run finishes.
    pub async fn run_to_end(mut self) -> Result<RunOutcome> {
        loop {
            match self.step().await {
                Some(Ok(Progress::Done(outcome))) => return Ok(outcome),
                Some(Ok(Progress::Node(_))) => continue,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(StepGraphError::Routing {
                        node: String::new(),
                        message: "execution already finished".into(),
                    })
                }
            }
        }
    }

    /// Lazy sequence of node snapshots, ending with the outcome (or the
    /// error that ended the run).
    pub fn into_stream(self) -> BoxStream<'static, Result<Progress>> {
        Box::pin(stream::unfold(self, |mut exec| async move {
            exec.step().await.map(|item| (item, exec))
        }))
    }

    async fn advance(&mut self) -> Result<Progress> {
        let idx = match self.cursor {
            Cursor::At(idx) => idx,
            Cursor::End | Cursor::Finished => {
                return Ok(Progress::Done(RunOutcome::Completed {
                    state: self.state.clone(),
                    steps: self.steps,
                }))
            }
        };
        let graph = Arc::clone(&self.graph);
        let node = graph.node(idx);

        if self.cancel.is_cancelled() {
            return Ok(self.cancelled(&node.name));
        }

        // Reaching an interrupt without a reply suspends the run; it does
        // not consume a step.
        if let NodeKind::Interrupt(interrupt) = &node.kind {
            if self.reply.is_none() {
                return Ok(Progress::Done(RunOutcome::Interrupted {
                    state: self.state.clone(),
                    steps: self.steps,
                    node: node.name.clone(),
                    prompt: interrupt.prompt.clone(),
                }));
            }
        }

        if self.steps >= self.executor.max_steps {
            warn!(run_id = %self.run_id, node = %node.name, limit = self.executor.max_steps, "Step budget exhausted");
            return Err(StepGraphError::RecursionLimitExceeded {
                node: node.name.clone(),
                limit: self.executor.max_steps,
            });
        }

        let ctx = NodeContext {
            run_id: self.run_id.clone(),
            node: node.name.clone(),
            cancel: self.cancel.clone(),
            events: Arc::clone(&self.executor.events),
        };
        debug!(run_id = %self.run_id, node = %node.name, step = self.steps + 1, "Executing node");

        let next = match (&node.kind, &node.transition) {
            (NodeKind::FanOut(fan_out), Transition::FanOut { targets, join }) => {
                let result = self
                    .executor
                    .fan_out
                    .run(fan_out, targets, &self.state, &graph.schema, &ctx)
                    .await?;
                self.state.apply(&graph.schema, result.update)?;
                if result.cancelled {
                    return Ok(self.cancelled(&node.name));
                }
                Next::Node(*join)
            }
            (
                NodeKind::Interrupt(interrupt),
                Transition::Interrupt {
                    on_continue,
                    on_finish,
                },
            ) => {
                let reply = self.reply.take().unwrap_or_default();
                let finish = interrupt.is_terminal_reply(&reply);
                info!(run_id = %self.run_id, node = %node.name, finish, "Resuming with reply");
                let update =
                    StateUpdate::new().messages(&interrupt.history, &[ChatMessage::user(reply)])?;
                self.state.apply(&graph.schema, update)?;
                if finish {
                    *on_finish
                } else {
                    *on_continue
                }
            }
            (kind, transition) => {
                let handler = kind.handler().ok_or_else(|| StepGraphError::Routing {
                    node: node.name.clone(),
                    message: format!("{} node has no handler", kind.describe()),
                })?;
                let outcome = tokio::select! {
                    outcome = handler.call(&self.state, &ctx) => outcome,
                    _ = self.cancel.cancelled() => Err(StepGraphError::Cancelled),
                };
                let update = match outcome {
                    Ok(update) => update,
                    Err(StepGraphError::Cancelled) => return Ok(self.cancelled(&node.name)),
                    Err(e) => return Err(e),
                };
                self.state.apply(&graph.schema, update)?;
                match transition {
                    Transition::Static(next) => *next,
                    Transition::Conditional(route) => {
                        let (label, next) = route.select(&node.name, &self.state)?;
                        debug!(node = %node.name, label, to = %graph.next_name(next), "Routed");
                        next
                    }
                    _ => {
                        return Err(StepGraphError::Routing {
                            node: node.name.clone(),
                            message: "node kind and transition disagree".into(),
                        })
                    }
                }
            }
        };

        self.steps += 1;
        self.cursor = match next {
            Next::Node(i) => Cursor::At(i),
            Next::End => Cursor::End,
        };
        self.publish(GraphEvent::NodeCompleted {
            run_id: self.run_id.clone(),
            node: node.name.clone(),
            step: self.steps,
            state: self.state.clone(),
        });

        Ok(Progress::Node(NodeSnapshot {
            node: node.name.clone(),
            step: self.steps,
            state: self.state.clone(),
        }))
    }

    fn cancelled(&self, node: &str) -> Progress {
        Progress::Done(RunOutcome::Cancelled {
            state: self.state.clone(),
            steps: self.steps,
            node: node.to_string(),
        })
    }

    fn announce_outcome(&self, outcome: &RunOutcome) {
        let event = match outcome {
            RunOutcome::Completed { steps, .. } => {
                info!(run_id = %self.run_id, steps, "Run completed");
                GraphEvent::RunCompleted {
                    run_id: self.run_id.clone(),
                    steps: *steps,
                }
            }
            RunOutcome::Interrupted { node, prompt, .. } => {
                info!(run_id = %self.run_id, node = %node, "Run waiting for input");
                GraphEvent::RunInterrupted {
                    run_id: self.run_id.clone(),
                    node: node.clone(),
                    prompt: prompt.clone(),
                }
            }
            RunOutcome::Cancelled { node, .. } => {
                warn!(run_id = %self.run_id, node = %node, "Run cancelled");
                GraphEvent::RunCancelled {
                    run_id: self.run_id.clone(),
                    node: node.clone(),
                }
            }
        };
        self.publish(event);
    }

    fn publish(&self, event: GraphEvent) {
        self.executor.events.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;
    use stepgraph_core::state::StateSchema;

    use crate::graph::{node_fn, ChildInvocation, FanOut, GraphDefinition, Interrupt, RouteLabel, END};

    fn config(max_steps: usize) -> ExecutorConfig {
        ExecutorConfig {
            max_steps,
            ..Default::default()
        }
    }

    fn counter_schema() -> StateSchema {
        StateSchema::new().replace("count").append_by_id("messages").accumulate("results")
    }

    fn increment() -> impl crate::graph::NodeHandler {
        node_fn(|state: RunState, _ctx: NodeContext| async move {
            let count = state.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(StateUpdate::new().set("count", json!(count + 1)))
        })
    }

    #[tokio::test]
    async fn self_loop_hits_step_budget_exactly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let graph = GraphDefinition::new("spin", counter_schema())
            .add_node(
                "spin",
                node_fn(move |_: RunState, _ctx: NodeContext| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    async { Ok(StateUpdate::new()) }
                }),
            )
            .add_edge("spin", "spin")
            .set_entry("spin")
            .compile()
            .unwrap();

        let err = Executor::new(&config(5))
            .run(Arc::new(graph), RunState::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StepGraphError::RecursionLimitExceeded { ref node, limit: 5 } if node == "spin"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Size {
        Small,
        Big,
    }

    impl RouteLabel for Size {
        fn all() -> &'static [Self] {
            &[Self::Small, Self::Big]
        }

        fn as_str(&self) -> &'static str {
            match self {
                Self::Small => "small",
                Self::Big => "big",
            }
        }
    }

    #[tokio::test]
    async fn routes_on_post_update_state() {
        let graph = GraphDefinition::new("count", counter_schema())
            .add_node("inc", increment())
            .add_conditional_edge(
                "inc",
                |state: &RunState| {
                    if state.get("count").and_then(|v| v.as_i64()).unwrap_or(0) >= 3 {
                        Size::Big
                    } else {
                        Size::Small
                    }
                },
                [(Size::Small, "inc"), (Size::Big, END)],
            )
            .set_entry("inc")
            .compile()
            .unwrap();

        let outcome = Executor::new(&config(10))
            .run(Arc::new(graph), RunState::new())
            .await
            .unwrap();
        assert_eq!(outcome.steps(), 3);
        assert_eq!(outcome.state().get("count"), Some(&json!(3)));
        assert_eq!(outcome.status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn node_error_fails_the_run() {
        let graph = GraphDefinition::new("bad", counter_schema())
            .add_node(
                "boom",
                node_fn(|_: RunState, ctx: NodeContext| async move {
                    Err(StepGraphError::NodeFailed {
                        node: ctx.node,
                        message: "nope".into(),
                    })
                }),
            )
            .set_entry("boom")
            .compile()
            .unwrap();
        let executor = Executor::new(&config(10));
        let mut events = executor.events().subscribe();
        let err = executor.run(Arc::new(graph), RunState::new()).await.unwrap_err();
        assert!(matches!(err, StepGraphError::NodeFailed { .. }));

        assert!(matches!(events.recv().await.unwrap(), GraphEvent::RunStarted { .. }));
        assert!(matches!(events.recv().await.unwrap(), GraphEvent::RunFailed { .. }));
    }

    #[tokio::test]
    async fn unknown_field_write_fails_the_run() {
        let graph = GraphDefinition::new("bad", counter_schema())
            .add_node(
                "writer",
                node_fn(|_: RunState, _ctx: NodeContext| async {
                    Ok(StateUpdate::new().set("undeclared", json!(1)))
                }),
            )
            .set_entry("writer")
            .compile()
            .unwrap();
        let err = Executor::new(&config(10))
            .run(Arc::new(graph), RunState::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepGraphError::UnknownField(ref f) if f == "undeclared"));
    }

    fn review_graph() -> Arc<CompiledGraph> {
        let graph = GraphDefinition::new("review", counter_schema())
            .add_node(
                "chat",
                node_fn(|state: RunState, _ctx: NodeContext| async move {
                    let turns = state.items("messages").len();
                    StateUpdate::new().messages(
                        "messages",
                        &[ChatMessage::assistant_text(format!("plan v{}", turns))],
                    )
                }),
            )
            .add_interrupt(
                "review",
                Interrupt::new("type 'end' to stop", "messages").on_continue("chat"),
            )
            .add_edge("chat", "review")
            .set_entry("chat")
            .compile()
            .unwrap();
        Arc::new(graph)
    }

    #[tokio::test]
    async fn interrupt_suspends_and_resumes() {
        let executor = Executor::new(&config(30));
        let graph = review_graph();

        let outcome = executor.run(Arc::clone(&graph), RunState::new()).await.unwrap();
        let (state, steps, node, prompt) = match outcome {
            RunOutcome::Interrupted {
                state,
                steps,
                node,
                prompt,
            } => (state, steps, node, prompt),
            other => panic!("expected interrupt, got {other:?}"),
        };
        assert_eq!((steps, node.as_str(), prompt.as_str()), (1, "review", "type 'end' to stop"));

        // A non-terminal reply loops back to the model node.
        let outcome = executor
            .resume(Arc::clone(&graph), RunId::new(), state, steps, &node, "add tests", CancellationToken::new())
            .unwrap()
            .run_to_end()
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Interrupted { steps: 3, .. }));

        // The terminal token, in a different case, ends the run.
        let run_id = RunId::new();
        let outcome = executor
            .resume(graph, run_id, outcome.into_state(), 3, "review", "  END ", CancellationToken::new())
            .unwrap()
            .run_to_end()
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Completed);
        let history = outcome.state().messages("messages").unwrap();
        let texts: Vec<String> = history.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["plan v0", "add tests", "plan v2", "  END "]);
    }

    #[tokio::test]
    async fn resume_rejects_non_interrupt_nodes() {
        let executor = Executor::new(&config(30));
        let err = executor
            .resume(review_graph(), RunId::new(), RunState::new(), 0, "chat", "x", CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, StepGraphError::NotInterrupted(_)));
    }

    #[tokio::test]
    async fn fan_out_joins_before_continuing() {
        let graph = GraphDefinition::new("fan", counter_schema().replace("item"))
            .add_fan_out(
                "dispatch",
                FanOut::new(|_: &RunState| {
                    Ok((1..=3)
                        .map(|i| ChildInvocation::new("work", json!({"item": {"id": i}})))
                        .collect())
                })
                .target("work")
                .join("summarize")
                .outputs(&["results"]),
            )
            .add_node(
                "work",
                node_fn(|state: RunState, _ctx: NodeContext| async move {
                    Ok(StateUpdate::new().set("results", state.get("item").cloned().unwrap_or_default()))
                }),
            )
            .add_node(
                "summarize",
                node_fn(|state: RunState, _ctx: NodeContext| async move {
                    Ok(StateUpdate::new().set("count", json!(state.items("results").len())))
                }),
            )
            .set_entry("dispatch")
            .compile()
            .unwrap();

        let outcome = Executor::new(&config(30))
            .run(Arc::new(graph), RunState::new())
            .await
            .unwrap();
        assert_eq!(outcome.steps(), 2);
        assert_eq!(outcome.state().get("count"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn stream_yields_each_node_then_outcome() {
        let graph = GraphDefinition::new("two", counter_schema())
            .add_node("a", increment())
            .add_node("b", increment())
            .add_edge("a", "b")
            .set_entry("a")
            .compile()
            .unwrap();

        let items: Vec<Progress> = Executor::new(&config(30))
            .start(Arc::new(graph), RunId::new(), RunState::new(), CancellationToken::new())
            .into_stream()
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Progress::Node(s) if s.node == "a" && s.step == 1));
        assert!(matches!(&items[1], Progress::Node(s) if s.node == "b" && s.state.get("count") == Some(&json!(2))));
        assert!(matches!(&items[2], Progress::Done(RunOutcome::Completed { steps: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_partial_state() {
        let graph = GraphDefinition::new("slow", counter_schema())
            .add_node("inc", increment())
            .add_node(
                "wait",
                node_fn(|_: RunState, _ctx: NodeContext| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(StateUpdate::new())
                }),
            )
            .add_edge("inc", "wait")
            .set_entry("inc")
            .compile()
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = Executor::new(&config(30))
            .start(Arc::new(graph), RunId::new(), RunState::new(), cancel)
            .run_to_end()
            .await
            .unwrap();
        match outcome {
            RunOutcome::Cancelled { state, steps, node } => {
                assert_eq!(node, "wait");
                assert_eq!(steps, 1);
                assert_eq!(state.get("count"), Some(&json!(1)));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}
