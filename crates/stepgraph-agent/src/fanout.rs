use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::state::{FieldPolicy, RunState, StateSchema, StateUpdate};
use stepgraph_core::types::GraphEvent;

use crate::graph::{ChildInvocation, FanOut, NodeContext, NodeHandler};

/// What a fan-out step contributed to the run.
#[derive(Debug, Default)]
pub struct FanOutResult {
    /// Merged child outputs, in completion order.
    pub update: StateUpdate,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The run was cancelled before every child finished; `update` holds
    /// the children that completed.
    pub cancelled: bool,
}

/// Runs the children of one fan-out step concurrently on a bounded pool
/// and joins their outputs.
#[derive(Debug, Clone)]
pub struct FanOutCoordinator {
    concurrency: usize,
}

struct Finished {
    index: usize,
    outcome: std::result::Result<Result<StateUpdate>, String>,
}

impl FanOutCoordinator {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Produce the children of `fan_out` from `state`, run them, and merge.
    ///
    /// A child that errors, panics, or writes outside the declared outputs
    /// becomes a failure entry in the failures field; its siblings are
    /// unaffected. Two children writing the same replace field is a
    /// `StateMergeConflict`.
    pub async fn run(
        &self,
        fan_out: &FanOut,
        targets: &HashMap<String, Arc<dyn NodeHandler>>,
        state: &RunState,
        schema: &StateSchema,
        ctx: &NodeContext,
    ) -> Result<FanOutResult> {
        let children = (fan_out.producer)(state)?;
        info!(node = %ctx.node, children = children.len(), "Dispatching fan-out");
        ctx.events.publish(GraphEvent::FanOutDispatched {
            run_id: ctx.run_id.clone(),
            node: ctx.node.clone(),
            children: children.len(),
        });

        let mut result = FanOutResult {
            dispatched: children.len(),
            ..Default::default()
        };
        if children.is_empty() {
            return Ok(result);
        }

        // Resolve every child before starting any, so a bad target fails
        // the step without leaving orphaned tasks.
        let mut jobs = Vec::with_capacity(children.len());
        for child in &children {
            let handler = targets.get(&child.target).cloned().ok_or_else(|| {
                StepGraphError::Routing {
                    node: ctx.node.clone(),
                    message: format!(
                        "child targets '{}', which is not a declared fan-out target",
                        child.target
                    ),
                }
            })?;
            let mut view = state.view(&fan_out.inputs);
            view.apply(schema, StateUpdate::from_object(child.payload.clone())?)?;
            jobs.push((handler, view));
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for (index, (handler, view)) in jobs.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let child_ctx = ctx.child(children[index].target.clone());
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = AssertUnwindSafe(handler.call(&view, &child_ctx))
                    .catch_unwind()
                    .await
                    .map_err(panic_message);
                Finished { index, outcome }
            });
        }

        let mut replace_writers: HashMap<String, usize> = HashMap::new();
        loop {
            let joined = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled(), if !result.cancelled => {
                    warn!(node = %ctx.node, pending = set.len(), "Fan-out cancelled, aborting children");
                    set.abort_all();
                    result.cancelled = true;
                    continue;
                }
                joined = set.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            let Finished { index, outcome } = match joined {
                Ok(finished) => finished,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    // Panics are caught inside the task; anything else is
                    // a runtime failure we cannot attribute to a child.
                    warn!(node = %ctx.node, error = %e, "Fan-out task failed");
                    result.failed += 1;
                    result.update.extend(StateUpdate::new().set(
                        &fan_out.failures,
                        json!({"status": "failed", "node": ctx.node, "error": e.to_string()}),
                    ));
                    continue;
                }
            };
            let child = &children[index];

            let error = match outcome {
                Ok(Ok(update)) => match check_scope(&child.target, &update, &fan_out.outputs) {
                    Ok(()) => {
                        count_replace_writes(&update, schema, &mut replace_writers);
                        debug!(node = %ctx.node, child = %child.target, index, "Fan-out child completed");
                        result.succeeded += 1;
                        result.update.extend(update);
                        continue;
                    }
                    Err(e) => e.to_string(),
                },
                Ok(Err(StepGraphError::Cancelled)) if ctx.cancel.is_cancelled() => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("child panicked: {}", panic),
            };

            warn!(node = %ctx.node, child = %child.target, index, error = %error, "Fan-out child failed");
            result.failed += 1;
            result
                .update
                .extend(StateUpdate::new().set(&fan_out.failures, failure_entry(child, &error)));
        }

        if let Some((field, writers)) = replace_writers.into_iter().find(|(_, n)| *n > 1) {
            return Err(StepGraphError::StateMergeConflict { field, writers });
        }

        info!(
            node = %ctx.node,
            succeeded = result.succeeded,
            failed = result.failed,
            cancelled = result.cancelled,
            "Fan-out joined"
        );
        Ok(result)
    }
}

fn check_scope(child: &str, update: &StateUpdate, outputs: &[String]) -> Result<()> {
    match update.fields().find(|f| !outputs.iter().any(|o| o == f)) {
        Some(field) => Err(StepGraphError::OutOfScope {
            node: child.to_string(),
            field: field.to_string(),
        }),
        None => Ok(()),
    }
}

fn count_replace_writes(
    update: &StateUpdate,
    schema: &StateSchema,
    writers: &mut HashMap<String, usize>,
) {
    let mut seen: Vec<&str> = Vec::new();
    for field in update.fields() {
        if schema.policy(field) == Some(FieldPolicy::Replace) && !seen.contains(&field) {
            seen.push(field);
            *writers.entry(field.to_string()).or_default() += 1;
        }
    }
}

fn failure_entry(child: &ChildInvocation, error: &str) -> Value {
    json!({
        "status": "failed",
        "node": child.target,
        "error": error,
        "input": child.payload,
    })
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
