use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error};

use stepgraph_core::error::StepGraphError;
use stepgraph_core::traits::Tool;
use stepgraph_core::types::{ToolCall, ToolResult, ToolSchema};

/// Registry of tools available to one executor or run.
///
/// Built explicitly and passed in; there is no process-wide registry.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool instance.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Builder-style registration.
    pub fn with(mut self, tool: impl Tool) -> Self {
        self.register(tool);
        self
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool schemas for the completion request, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Invoke one tool call. Never fails: a missing tool, a tool error,
    /// a panic, or a timeout all become an error `ToolResult` for this call.
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            let err = StepGraphError::ToolNotFound(call.name.clone());
            error!(tool = %call.name, id = %call.id, "Tool not found");
            return ToolResult::error(&call.id, &call.name, err.to_string());
        };

        let timeout_secs = tool.timeout_secs();
        let timeout = Duration::from_secs(timeout_secs);
        let args = call.arguments.clone();

        let outcome = if tool.is_async() {
            let guarded = AssertUnwindSafe(tool.invoke_async(args)).catch_unwind();
            match tokio::time::timeout(timeout, guarded).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(StepGraphError::ToolInvocation {
                    tool: call.name.clone(),
                    message: format!("tool panicked: {}", panic_message(panic.as_ref())),
                }),
                Err(_) => Err(StepGraphError::ToolTimeout {
                    tool: call.name.clone(),
                    timeout_secs,
                }),
            }
        } else {
            let blocking = Arc::clone(&tool);
            let handle = tokio::task::spawn_blocking(move || blocking.invoke(args));
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(StepGraphError::ToolInvocation {
                    tool: call.name.clone(),
                    message: format!("tool panicked: {}", join_err),
                }),
                Err(_) => Err(StepGraphError::ToolTimeout {
                    tool: call.name.clone(),
                    timeout_secs,
                }),
            }
        };

        match outcome {
            Ok(value) => {
                debug!(tool = %call.name, id = %call.id, "Tool call succeeded");
                ToolResult::success(&call.id, &call.name, value)
            }
            Err(e) => {
                error!(tool = %call.name, id = %call.id, error = %e, "Tool execution failed");
                ToolResult::error(&call.id, &call.name, e.to_string())
            }
        }
    }

    /// Invoke a batch of sibling tool calls.
    ///
    /// With `parallel` the calls run concurrently; results then come back in
    /// proposal order but callers should key them by call id.
    pub async fn invoke_all(&self, calls: &[ToolCall], parallel: bool) -> Vec<ToolResult> {
        if parallel && calls.len() > 1 {
            futures::future::join_all(calls.iter().map(|c| self.invoke(c))).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.invoke(call).await);
            }
            results
        }
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::clock::CurrentTimeTool);
        registry.register(crate::builtin::web_fetch::WebFetchTool);
        registry
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use stepgraph_core::types::ToolOutcome;
    use stepgraph_test_utils::{FailingTool, SleepyTool, StaticTool};

    #[tokio::test]
    async fn invoke_sync_tool() {
        let tool = StaticTool::new("search", json!({"hits": 3}));
        let counter = Arc::clone(&tool.invocations);
        let registry = ToolRegistry::new().with(tool);

        let result = registry
            .invoke(&ToolCall::new("1", "search", json!({"q": "x"})))
            .await;
        assert_eq!(result.id, "1");
        assert_eq!(result.outcome, ToolOutcome::Success(json!({"hits": 3})));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_tool_becomes_error_result() {
        let registry = ToolRegistry::new();
        let result = registry
            .invoke(&ToolCall::new("2", "unknown_tool", json!({})))
            .await;
        assert!(result.is_error());
        assert_eq!(result.name, "unknown_tool");
        assert!(result.content().contains("Tool not found"));
    }

    #[tokio::test]
    async fn failing_tool_becomes_error_result() {
        let registry = ToolRegistry::new().with(FailingTool::new("db"));
        let result = registry.invoke(&ToolCall::new("3", "db", json!({}))).await;
        assert!(result.is_error());
        assert!(result.content().contains("backend unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn async_tool_timeout() {
        let registry = ToolRegistry::new()
            .with(SleepyTool::new("slow", Duration::from_secs(10)).with_timeout(1));
        let result = registry.invoke(&ToolCall::new("4", "slow", json!({}))).await;
        assert!(matches!(result.outcome, ToolOutcome::Error(ref m) if m.contains("timeout")));
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let registry = ToolRegistry::new()
            .with(StaticTool::new("search", json!("ok")))
            .with(FailingTool::new("db"))
            .with(SleepyTool::new("echo", Duration::from_millis(5)));
        let calls = vec![
            ToolCall::new("a", "search", json!({})),
            ToolCall::new("b", "db", json!({})),
            ToolCall::new("c", "echo", json!({"v": 1})),
            ToolCall::new("d", "nope", json!({})),
        ];
        let results = registry.invoke_all(&calls, true).await;
        assert_eq!(results.len(), 4);
        let by_id = |id: &str| results.iter().find(|r| r.id == id).unwrap();
        assert!(!by_id("a").is_error());
        assert!(by_id("b").is_error());
        assert_eq!(by_id("c").outcome, ToolOutcome::Success(json!({"v": 1})));
        assert!(by_id("d").is_error());
    }

    struct ExplodingTool;

    impl Tool for ExplodingTool {
        fn name(&self) -> &str {
            "explode"
        }

        fn description(&self) -> &str {
            "Panics while awaiting"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        fn is_async(&self) -> bool {
            true
        }

        fn invoke_async(
            &self,
            _args: serde_json::Value,
        ) -> futures::future::BoxFuture<'_, stepgraph_core::error::Result<serde_json::Value>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                panic!("async tool exploded")
            })
        }
    }

    #[tokio::test]
    async fn async_panic_stays_with_its_call() {
        let registry = ToolRegistry::new()
            .with(ExplodingTool)
            .with(StaticTool::new("search", json!("ok")));
        let calls = vec![
            ToolCall::new("a", "explode", json!({})),
            ToolCall::new("b", "search", json!({})),
        ];
        let results = registry.invoke_all(&calls, true).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_error());
        assert!(results[0].content().contains("async tool exploded"));
        assert_eq!(results[1].outcome, ToolOutcome::Success(json!("ok")));
    }

    #[test]
    fn schemas_sorted() {
        let registry = ToolRegistry::with_builtins();
        let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["current_time", "web_fetch"]);
    }
}
