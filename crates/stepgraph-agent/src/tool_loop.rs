//! The propose / execute / re-enter cycle.
//!
//! [`ToolLoopRunner`] runs the whole cycle inside one node. [`ModelNode`],
//! [`ToolNode`] and [`tools_condition`] split the same cycle across graph
//! nodes so each turn is a visible step.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::state::{RunState, StateUpdate};
use stepgraph_core::traits::ChatModel;
use stepgraph_core::types::*;
use stepgraph_tools::ToolRegistry;

use crate::graph::{NodeContext, NodeHandler, RouteLabel};

/// Prepend the preamble to a model request unless history already starts
/// with the same system message. History itself is never modified.
pub(crate) fn with_preamble(preamble: Option<&str>, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut request = Vec::with_capacity(history.len() + 1);
    if let Some(text) = preamble {
        let present = history
            .first()
            .is_some_and(|m| m.role == Role::System && m.text() == text);
        if !present {
            request.push(ChatMessage::system(text).with_id("preamble"));
        }
    }
    request.extend_from_slice(history);
    request
}

/// Replace the message with the same id, or append.
pub(crate) fn upsert_message(history: &mut Vec<ChatMessage>, message: ChatMessage) {
    match history.iter_mut().find(|m| m.id == message.id) {
        Some(slot) => *slot = message,
        None => history.push(message),
    }
}

/// One model turn, abandoned if the run is cancelled.
pub async fn complete_turn(
    model: &dyn ChatModel,
    history: &[ChatMessage],
    tools: &[ToolSchema],
    preamble: Option<&str>,
    ctx: &NodeContext,
) -> Result<ChatMessage> {
    let request = with_preamble(preamble, history);
    debug!(node = %ctx.node, messages = request.len(), tools = tools.len(), "Requesting completion");
    tokio::select! {
        reply = model.complete(request, tools) => reply,
        _ = ctx.cancel.cancelled() => Err(StepGraphError::Cancelled),
    }
}

/// Execute one batch of sibling tool calls. Individual failures come back
/// as error results; only cancellation fails the batch.
pub async fn execute_tool_calls(
    tools: &ToolRegistry,
    calls: &[ToolCall],
    parallel: bool,
    ctx: &NodeContext,
) -> Result<Vec<ToolResult>> {
    for call in calls {
        info!(node = %ctx.node, tool = %call.name, id = %call.id, "Executing tool");
        ctx.events.publish(GraphEvent::ToolStart {
            run_id: ctx.run_id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        });
    }

    let results = tokio::select! {
        results = tools.invoke_all(calls, parallel) => results,
        _ = ctx.cancel.cancelled() => return Err(StepGraphError::Cancelled),
    };

    for result in &results {
        if result.is_error() {
            warn!(node = %ctx.node, tool = %result.name, id = %result.id, "Tool call returned an error");
        }
        ctx.events.publish(GraphEvent::ToolEnd {
            run_id: ctx.run_id.clone(),
            result: result.clone(),
        });
    }
    Ok(results)
}

/// Bounded propose/execute/re-enter loop against one model and one registry.
///
/// Runs as a single node: it reads `history`, loops until the model answers
/// without tool calls, and returns every message it produced as one
/// append-by-id update. Exceeding `max_iterations` model turns fails with
/// `RecursionLimitExceeded`.
pub struct ToolLoopRunner {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    history: String,
    preamble: Option<String>,
    max_iterations: usize,
    parallel_tools: bool,
}

impl ToolLoopRunner {
    pub fn new(model: Arc<dyn ChatModel>, tools: ToolRegistry, history: impl Into<String>) -> Self {
        Self {
            model,
            tools,
            history: history.into(),
            preamble: None,
            max_iterations: 10,
            parallel_tools: true,
        }
    }

    pub fn with_preamble(mut self, preamble: Option<String>) -> Self {
        self.preamble = preamble;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_parallel_tools(mut self, parallel: bool) -> Self {
        self.parallel_tools = parallel;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run the loop from the history held in `state`.
    pub async fn run(&self, state: &RunState, ctx: &NodeContext) -> Result<StateUpdate> {
        let mut history = state.messages(&self.history)?;
        let mut produced: Vec<ChatMessage> = Vec::new();
        let schemas = self.tools.schemas();

        for iteration in 1..=self.max_iterations {
            let reply = complete_turn(
                self.model.as_ref(),
                &history,
                &schemas,
                self.preamble.as_deref(),
                ctx,
            )
            .await?;

            let calls = reply.tool_calls();
            upsert_message(&mut history, reply.clone());
            upsert_message(&mut produced, reply);

            if calls.is_empty() {
                debug!(node = %ctx.node, iteration, "Tool loop done");
                return StateUpdate::new().messages(&self.history, &produced);
            }

            let results = execute_tool_calls(&self.tools, &calls, self.parallel_tools, ctx).await?;
            for result in results {
                let message = result.into_message();
                upsert_message(&mut history, message.clone());
                upsert_message(&mut produced, message);
            }
        }

        warn!(node = %ctx.node, limit = self.max_iterations, "Tool loop iteration budget exhausted");
        Err(StepGraphError::RecursionLimitExceeded {
            node: ctx.node.clone(),
            limit: self.max_iterations,
        })
    }
}

impl NodeHandler for ToolLoopRunner {
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(self.run(state, ctx))
    }
}

/// A single model turn as a graph node. The reply is appended to history.
pub struct ModelNode {
    model: Arc<dyn ChatModel>,
    tools: Vec<ToolSchema>,
    history: String,
    preamble: Option<String>,
}

impl ModelNode {
    pub fn new(model: Arc<dyn ChatModel>, history: impl Into<String>) -> Self {
        Self {
            model,
            tools: Vec::new(),
            history: history.into(),
            preamble: None,
        }
    }

    /// Offer these tools to the model.
    pub fn with_tools(mut self, tools: &ToolRegistry) -> Self {
        self.tools = tools.schemas();
        self
    }

    pub fn with_preamble(mut self, preamble: Option<String>) -> Self {
        self.preamble = preamble;
        self
    }
}

impl NodeHandler for ModelNode {
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let history = state.messages(&self.history)?;
            let reply = complete_turn(
                self.model.as_ref(),
                &history,
                &self.tools,
                self.preamble.as_deref(),
                ctx,
            )
            .await?;
            StateUpdate::new().messages(&self.history, &[reply])
        })
    }
}

/// Executes the tool calls proposed by the last message in history.
pub struct ToolNode {
    tools: ToolRegistry,
    history: String,
    parallel: bool,
}

impl ToolNode {
    pub fn new(tools: ToolRegistry, history: impl Into<String>) -> Self {
        Self {
            tools,
            history: history.into(),
            parallel: true,
        }
    }

    pub fn with_parallel_tools(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

impl NodeHandler for ToolNode {
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let calls = state
                .last_message(&self.history)?
                .map(|m| m.tool_calls())
                .unwrap_or_default();
            if calls.is_empty() {
                return Ok(StateUpdate::new());
            }
            let results = execute_tool_calls(&self.tools, &calls, self.parallel, ctx).await?;
            let messages: Vec<ChatMessage> = results.into_iter().map(|r| r.into_message()).collect();
            StateUpdate::new().messages(&self.history, &messages)
        })
    }
}

/// Route labels for the graph-level tool loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolsRoute {
    Tools,
    End,
}

impl RouteLabel for ToolsRoute {
    fn all() -> &'static [Self] {
        &[Self::Tools, Self::End]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::End => "end",
        }
    }
}

/// Route to the tool node while the last message in `history` proposes
/// tool calls.
pub fn tools_condition(
    history: impl Into<String>,
) -> impl Fn(&RunState) -> ToolsRoute + Send + Sync + 'static {
    let history = history.into();
    move |state: &RunState| match state.last_message(&history) {
        Ok(Some(m)) if m.has_tool_calls() => ToolsRoute::Tools,
        _ => ToolsRoute::End,
    }
}
