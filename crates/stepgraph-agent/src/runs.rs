use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::state::{RunState, StateUpdate};
use stepgraph_core::traits::CheckpointStore;
use stepgraph_core::types::*;

use crate::catalog::GraphCatalog;
use crate::executor::{Execution, Executor, Progress};

/// Where a run stands after a `start_run` or `resume` call returns.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: RunId,
    /// Catalog name of the graph.
    pub graph: String,
    pub status: RunStatus,
    pub state: RunState,
    pub steps: usize,
}

impl RunHandle {
    /// Prompt of the interrupt the run is waiting on, if any.
    pub fn prompt(&self) -> Option<&str> {
        match &self.status {
            RunStatus::Interrupted { prompt, .. } => Some(prompt),
            _ => None,
        }
    }

    /// Text of the last assistant message in `history`.
    pub fn answer(&self, history: &str) -> Option<String> {
        let messages = self.state.messages(history).ok()?;
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.has_tool_calls())
            .map(|m| m.text())
    }
}

/// Caller-facing surface: starts runs from the catalog, resumes suspended
/// runs from checkpoints, and exposes per-run event streams.
///
/// Checkpoints are written when a run stops (completed, interrupted,
/// cancelled or failed); the executor itself never touches the store.
pub struct RunManager {
    catalog: GraphCatalog,
    executor: Executor,
    store: Arc<dyn CheckpointStore>,
    active: Mutex<HashMap<RunId, CancellationToken>>,
}

impl RunManager {
    pub fn new(catalog: GraphCatalog, executor: Executor, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            catalog,
            executor,
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &GraphCatalog {
        &self.catalog
    }

    /// Start a run of catalog graph `graph` with a fresh run id.
    pub async fn start_run(&self, graph: &str, input: StateUpdate) -> Result<RunHandle> {
        self.start_run_with_id(RunId::new(), graph, input).await
    }

    /// Start a run under a caller-chosen id, so a [`RunManager::stream`]
    /// subscription can be opened before the first node executes.
    pub async fn start_run_with_id(
        &self,
        run_id: RunId,
        graph: &str,
        input: StateUpdate,
    ) -> Result<RunHandle> {
        let compiled = self.catalog.get(graph)?;
        let state = compiled.initial_state(input)?;
        let cancel = self.register(&run_id)?;
        let execution = self.executor.start(compiled, run_id.clone(), state, cancel);
        let result = self.drive(graph, execution).await;
        self.unregister(&run_id);
        result
    }

    /// Supply the reply to a run suspended at an interrupt node and continue
    /// it from its checkpoint.
    ///
    /// Only one call may drive a run at a time; a second `resume` (or a
    /// `start_run_with_id` reusing the id) while the first is in flight
    /// fails with `RunActive`.
    pub async fn resume(&self, run_id: &RunId, reply: &str) -> Result<RunHandle> {
        // Claim the run before reading its checkpoint so no other caller can
        // continue from the same snapshot.
        let cancel = self.register(run_id)?;
        let result = self.resume_registered(run_id, reply, cancel).await;
        self.unregister(run_id);
        result
    }

    async fn resume_registered(
        &self,
        run_id: &RunId,
        reply: &str,
        cancel: CancellationToken,
    ) -> Result<RunHandle> {
        let checkpoint = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| StepGraphError::RunNotFound(run_id.to_string()))?;
        let node = match &checkpoint.status {
            RunStatus::Interrupted { node, .. } => node.clone(),
            _ => return Err(StepGraphError::NotInterrupted(run_id.to_string())),
        };

        let compiled = self.catalog.get(&checkpoint.graph)?;
        info!(run_id = %run_id, node = %node, "Resuming run");
        let execution = self.executor.resume(
            compiled,
            run_id.clone(),
            checkpoint.state,
            checkpoint.steps,
            &node,
            reply,
            cancel,
        )?;
        self.drive(&checkpoint.graph, execution).await
    }

    /// Events of one run, ending after its terminal event. Subscribe before
    /// starting or resuming the run to observe it from the beginning.
    pub fn stream(&self, run_id: &RunId) -> BoxStream<'static, GraphEvent> {
        let rx = self.executor.events().subscribe();
        let run_id = run_id.clone();
        Box::pin(stream::unfold(Some(rx), move |rx| {
            let run_id = run_id.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(event) if event.run_id() == &run_id => {
                            let next = if event.is_terminal() { None } else { Some(rx) };
                            return Some((event, next));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(run_id = %run_id, skipped, "Event stream lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        }))
    }

    /// Cancel an in-flight run. Returns false when the run is not active.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let active = match self.active.lock() {
            Ok(active) => active,
            Err(_) => return false,
        };
        match active.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Load the stored snapshot of a run.
    pub async fn checkpoint(&self, run_id: &RunId) -> Result<Checkpoint> {
        self.store
            .load(run_id)
            .await?
            .ok_or_else(|| StepGraphError::RunNotFound(run_id.to_string()))
    }

    async fn drive(&self, graph: &str, mut execution: Execution) -> Result<RunHandle> {
        loop {
            match execution.step().await {
                Some(Ok(Progress::Node(snapshot))) => {
                    debug!(run_id = %execution.run_id(), node = %snapshot.node, step = snapshot.step, "Node finished");
                }
                Some(Ok(Progress::Done(outcome))) => {
                    let handle = RunHandle {
                        run_id: execution.run_id().clone(),
                        graph: graph.to_string(),
                        status: outcome.status(),
                        steps: outcome.steps(),
                        state: outcome.into_state(),
                    };
                    self.persist(&handle).await?;
                    return Ok(handle);
                }
                Some(Err(e)) => {
                    let handle = RunHandle {
                        run_id: execution.run_id().clone(),
                        graph: graph.to_string(),
                        status: RunStatus::Failed {
                            error: e.to_string(),
                        },
                        state: execution.state().clone(),
                        steps: execution.steps(),
                    };
                    if let Err(save_err) = self.persist(&handle).await {
                        warn!(run_id = %handle.run_id, error = %save_err, "Failed to checkpoint failed run");
                    }
                    return Err(e);
                }
                None => return Err(StepGraphError::RunNotFound(execution.run_id().to_string())),
            }
        }
    }

    async fn persist(&self, handle: &RunHandle) -> Result<()> {
        self.store
            .save(&Checkpoint {
                run_id: handle.run_id.clone(),
                graph: handle.graph.clone(),
                state: handle.state.clone(),
                status: handle.status.clone(),
                steps: handle.steps,
                updated_at: Utc::now(),
            })
            .await
    }

    fn register(&self, run_id: &RunId) -> Result<CancellationToken> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| StepGraphError::Checkpoint(e.to_string()))?;
        if active.contains_key(run_id) {
            return Err(StepGraphError::RunActive(run_id.to_string()));
        }
        let token = CancellationToken::new();
        active.insert(run_id.clone(), token.clone());
        Ok(token)
    }

    fn unregister(&self, run_id: &RunId) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;
    use stepgraph_core::config::ExecutorConfig;
    use stepgraph_core::state::StateSchema;

    use crate::checkpoint::MemoryCheckpointStore;
    use crate::graph::{node_fn, GraphDefinition, Interrupt, NodeContext};

    fn catalog() -> GraphCatalog {
        let schema = StateSchema::new().append_by_id("messages").replace("question");
        let review = GraphDefinition::new("review", schema.clone())
            .add_node(
                "chat",
                node_fn(|state: RunState, _ctx: NodeContext| async move {
                    let question = state.get_str("question").unwrap_or_default().to_string();
                    StateUpdate::new()
                        .messages("messages", &[ChatMessage::assistant_text(format!("plan for {question}"))])
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
        let stuck = GraphDefinition::new("stuck", schema)
            .add_node(
                "wait",
                node_fn(|_: RunState, _ctx: NodeContext| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(StateUpdate::new())
                }),
            )
            .set_entry("wait")
            .compile()
            .unwrap();

        let slow_review = GraphDefinition::new("slow_review", StateSchema::new().append_by_id("messages"))
            .add_node(
                "chat",
                node_fn(|_: RunState, _ctx: NodeContext| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    StateUpdate::new().messages("messages", &[ChatMessage::assistant_text("plan")])
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

        let mut catalog = GraphCatalog::new();
        catalog.register("review", "chat with review", Arc::new(review));
        catalog.register("slow_review", "review with a slow chat node", Arc::new(slow_review));
        catalog.register("stuck", "never finishes", Arc::new(stuck));
        catalog
    }

    fn manager() -> RunManager {
        RunManager::new(
            catalog(),
            Executor::new(&ExecutorConfig::default()),
            Arc::new(MemoryCheckpointStore::new()),
        )
    }

    fn question(q: &str) -> StateUpdate {
        StateUpdate::new().set("question", json!(q))
    }

    #[tokio::test]
    async fn start_suspend_resume_finish() {
        let runs = manager();
        let handle = runs.start_run("review", question("lunch")).await.unwrap();
        assert_eq!(handle.prompt(), Some("type 'end' to stop"));
        assert_eq!(handle.answer("messages").as_deref(), Some("plan for lunch"));

        let stored = runs.checkpoint(&handle.run_id).await.unwrap();
        assert_eq!(stored.graph, "review");
        assert_eq!(stored.steps, 1);

        let handle = runs.resume(&handle.run_id, "more detail").await.unwrap();
        assert!(matches!(handle.status, RunStatus::Interrupted { .. }));
        assert_eq!(handle.steps, 3);

        let handle = runs.resume(&handle.run_id, "End").await.unwrap();
        assert_eq!(handle.status, RunStatus::Completed);
        assert_eq!(handle.state.items("messages").len(), 4);

        // A finished run cannot be resumed again.
        let err = runs.resume(&handle.run_id, "end").await.unwrap_err();
        assert!(matches!(err, StepGraphError::NotInterrupted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resumes_of_one_run_are_rejected() {
        let runs = manager();
        let started = runs.start_run("slow_review", StateUpdate::new()).await.unwrap();
        let run_id = started.run_id;

        let (a, b) = tokio::join!(runs.resume(&run_id, "reply A"), runs.resume(&run_id, "reply B"));
        let handle = a.unwrap();
        assert!(matches!(b, Err(StepGraphError::RunActive(_))));
        assert!(handle.prompt().is_some());

        let stored = runs.checkpoint(&run_id).await.unwrap();
        let replies: Vec<String> = stored
            .state
            .messages("messages")
            .unwrap()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text())
            .collect();
        assert_eq!(replies, vec!["reply A"]);

        // Once the first call returns the run can be resumed again.
        let handle = runs.resume(&run_id, "end").await.unwrap();
        assert_eq!(handle.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_runs_and_graphs() {
        let runs = manager();
        let err = runs.resume(&RunId::from_str("nope"), "hi").await.unwrap_err();
        assert!(matches!(err, StepGraphError::RunNotFound(_)));
        let err = runs.start_run("missing", StateUpdate::new()).await.unwrap_err();
        assert!(matches!(err, StepGraphError::GraphNotFound(_)));
        assert!(!runs.cancel(&RunId::from_str("nope")));
    }

    #[tokio::test]
    async fn stream_reports_nodes_until_terminal_event() {
        let runs = manager();
        let run_id = RunId::new();
        let events = runs.stream(&run_id);
        let handle = runs
            .start_run_with_id(run_id.clone(), "review", question("tea"))
            .await
            .unwrap();
        assert!(handle.prompt().is_some());

        let events: Vec<GraphEvent> = events.collect().await;
        assert!(matches!(events.first(), Some(GraphEvent::RunStarted { .. })));
        assert!(events.iter().any(
            |e| matches!(e, GraphEvent::NodeCompleted { node, step: 1, .. } if node == "chat")
        ));
        assert!(matches!(events.last(), Some(GraphEvent::RunInterrupted { node, .. }) if node == "review"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_an_active_run() {
        let runs = Arc::new(manager());
        let run_id = RunId::new();

        let canceller = Arc::clone(&runs);
        let target = run_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(canceller.cancel(&target));
        });

        let handle = runs
            .start_run_with_id(run_id.clone(), "stuck", StateUpdate::new())
            .await
            .unwrap();
        assert_eq!(handle.status, RunStatus::Cancelled { node: "wait".into() });
        let stored = runs.checkpoint(&run_id).await.unwrap();
        assert_eq!(stored.status, handle.status);
    }
}
