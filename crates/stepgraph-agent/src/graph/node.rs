use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use stepgraph_core::error::Result;
use stepgraph_core::event::EventBus;
use stepgraph_core::state::{RunState, StateUpdate};
use stepgraph_core::types::RunId;

use super::END;
use crate::tool_loop::ToolLoopRunner;

/// Everything a running node can see besides its state slice.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    /// Name of the node being executed.
    pub node: String,
    pub cancel: CancellationToken,
    pub events: Arc<EventBus>,
}

impl NodeContext {
    pub fn new(run_id: RunId, node: impl Into<String>) -> Self {
        Self {
            run_id,
            node: node.into(),
            cancel: CancellationToken::new(),
            events: Arc::new(EventBus::default()),
        }
    }

    /// Context for a fan-out child. Cancelling the parent cancels the child.
    pub(crate) fn child(&self, node: impl Into<String>) -> Self {
        Self {
            run_id: self.run_id.clone(),
            node: node.into(),
            cancel: self.cancel.child_token(),
            events: Arc::clone(&self.events),
        }
    }
}

/// A plain transform node: reads state, returns a partial update.
pub trait NodeHandler: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>>;
}

/// Adapter turning an async closure into a [`NodeHandler`].
pub struct FnNode<F>(F);

/// Wrap an async closure as a node. The closure receives an owned copy of
/// the state it is allowed to see.
pub fn node_fn<F, Fut>(f: F) -> FnNode<F>
where
    F: Fn(RunState, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate>> + Send + 'static,
{
    FnNode(f)
}

impl<F, Fut> NodeHandler for FnNode<F>
where
    F: Fn(RunState, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate>> + Send + 'static,
{
    fn call<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin((self.0)(state.clone(), ctx.clone()))
    }
}

/// One child of a fan-out: the node to run and the payload merged into its
/// isolated state view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildInvocation {
    pub target: String,
    pub payload: Value,
}

impl ChildInvocation {
    pub fn new(target: impl Into<String>, payload: Value) -> Self {
        Self {
            target: target.into(),
            payload,
        }
    }
}

pub(crate) type ChildProducer =
    Arc<dyn Fn(&RunState) -> Result<Vec<ChildInvocation>> + Send + Sync>;

/// A fan-out step: a producer yielding child invocations, the nodes those
/// children may target, and the join node the walk continues at.
///
/// Children see only the `inputs` fields plus their payload, and may write
/// only the `outputs` fields. Failed children become entries in the
/// `failures` field, which must be an accumulate field.
pub struct FanOut {
    pub(crate) producer: ChildProducer,
    pub(crate) targets: Vec<String>,
    pub(crate) join: Option<String>,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) failures: String,
}

impl FanOut {
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(&RunState) -> Result<Vec<ChildInvocation>> + Send + Sync + 'static,
    {
        Self {
            producer: Arc::new(producer),
            targets: Vec::new(),
            join: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            failures: "results".to_string(),
        }
    }

    /// Declare a node children may be dispatched to.
    pub fn target(mut self, node: impl Into<String>) -> Self {
        self.targets.push(node.into());
        self
    }

    pub fn join(mut self, node: impl Into<String>) -> Self {
        self.join = Some(node.into());
        self
    }

    pub fn inputs(mut self, fields: &[&str]) -> Self {
        self.inputs = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn outputs(mut self, fields: &[&str]) -> Self {
        self.outputs = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn failures(mut self, field: impl Into<String>) -> Self {
        self.failures = field.into();
        self
    }
}

/// A suspend-for-input step. The run stops here and hands `prompt` to the
/// caller; resuming appends the reply to `history` as a user message and
/// routes to `on_finish` when the reply matches the terminal token, or to
/// `on_continue` otherwise.
#[derive(Debug, Clone)]
pub struct Interrupt {
    pub(crate) prompt: String,
    pub(crate) history: String,
    pub(crate) terminal_token: String,
    pub(crate) on_continue: Option<String>,
    pub(crate) on_finish: String,
}

impl Interrupt {
    pub fn new(prompt: impl Into<String>, history: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: history.into(),
            terminal_token: "end".to_string(),
            on_continue: None,
            on_finish: END.to_string(),
        }
    }

    pub fn terminal_token(mut self, token: impl Into<String>) -> Self {
        self.terminal_token = token.into();
        self
    }

    pub fn on_continue(mut self, node: impl Into<String>) -> Self {
        self.on_continue = Some(node.into());
        self
    }

    pub fn on_finish(mut self, node: impl Into<String>) -> Self {
        self.on_finish = node.into();
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Case- and whitespace-insensitive match against the terminal token.
    pub fn is_terminal_reply(&self, reply: &str) -> bool {
        normalize(reply) == normalize(&self.terminal_token)
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// The closed set of node kinds the executor knows how to run.
pub(crate) enum NodeKind {
    Transform(Arc<dyn NodeHandler>),
    ToolLoop(Arc<ToolLoopRunner>),
    FanOut(FanOut),
    Interrupt(Interrupt),
}

impl NodeKind {
    /// Handler for kinds that run as a single call.
    pub(crate) fn handler(&self) -> Option<Arc<dyn NodeHandler>> {
        match self {
            Self::Transform(h) => Some(Arc::clone(h)),
            Self::ToolLoop(runner) => Some(Arc::clone(runner) as Arc<dyn NodeHandler>),
            Self::FanOut(_) | Self::Interrupt(_) => None,
        }
    }

    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Self::Transform(_) => "transform",
            Self::ToolLoop(_) => "tool loop",
            Self::FanOut(_) => "fan-out",
            Self::Interrupt(_) => "interrupt",
        }
    }
}
