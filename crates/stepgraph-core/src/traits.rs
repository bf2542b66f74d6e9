use futures::future::BoxFuture;

use crate::error::{Result, StepGraphError};
use crate::types::*;

/// Chat model endpoint: one call per model turn.
pub trait ChatModel: Send + Sync + 'static {
    /// Complete a conversation. The returned message may propose tool calls.
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolSchema],
    ) -> BoxFuture<'_, Result<ChatMessage>>;
}

/// Tool — one invocable capability exposed to the model.
///
/// Synchronous tools implement [`Tool::invoke`] and are run on the blocking
/// pool. Tools that await external I/O return `true` from
/// [`Tool::is_async`] and implement [`Tool::invoke_async`].
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Whether invocation must go through [`Tool::invoke_async`].
    fn is_async(&self) -> bool {
        false
    }

    /// Synchronous invocation.
    fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value> {
        let _ = args;
        Err(StepGraphError::ToolInvocation {
            tool: self.name().to_string(),
            message: "synchronous invocation not supported".into(),
        })
    }

    /// Asynchronous invocation. Defaults to the synchronous path.
    fn invoke_async(&self, args: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move { self.invoke(args) })
    }

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Schema sent to the model.
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Checkpoint store — run snapshot persistence keyed by run id.
///
/// Consulted by the run manager at run start and end; the executor itself
/// never touches it.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Load the latest snapshot for a run.
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Save (replace) the snapshot for a run.
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    /// Delete a run's snapshot. Returns whether one existed.
    fn delete(&self, run_id: &RunId) -> BoxFuture<'_, Result<bool>>;
}
