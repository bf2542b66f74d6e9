use std::collections::HashMap;
use std::sync::Arc;

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::state::{RunState, StateSchema};

use super::node::{NodeHandler, NodeKind};
use super::route::Route;
use super::END;

/// Successor of a node, resolved at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Node(usize),
    End,
}

/// How the walk leaves a node.
pub(crate) enum Transition {
    Static(Next),
    Conditional(Route),
    FanOut {
        targets: HashMap<String, Arc<dyn NodeHandler>>,
        join: usize,
    },
    Interrupt {
        on_continue: Next,
        on_finish: Next,
    },
}

pub(crate) struct CompiledNode {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) transition: Transition,
}

/// A validated, immutable graph. Build one with
/// [`GraphDefinition`](super::GraphDefinition) and share it across runs.
pub struct CompiledGraph {
    pub(crate) name: String,
    pub(crate) schema: StateSchema,
    pub(crate) nodes: Vec<CompiledNode>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) entry: usize,
    pub(crate) diagnostics: Vec<String>,
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn entry(&self) -> &str {
        &self.nodes[self.entry].name
    }

    /// Node names in declaration order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.index.contains_key(node)
    }

    /// Non-fatal findings from compilation, such as nodes with no path to
    /// a terminal.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// Build the initial state of a run from an input update.
    pub fn initial_state(&self, input: stepgraph_core::StateUpdate) -> Result<RunState> {
        let mut state = RunState::new();
        state.apply(&self.schema, input)?;
        Ok(state)
    }

    pub(crate) fn node(&self, idx: usize) -> &CompiledNode {
        &self.nodes[idx]
    }

    pub(crate) fn index_of(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| StepGraphError::Routing {
                node: name.to_string(),
                message: format!("graph '{}' has no such node", self.name),
            })
    }

    pub(crate) fn next_name(&self, next: Next) -> &str {
        match next {
            Next::Node(idx) => &self.nodes[idx].name,
            Next::End => END,
        }
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.name)
            .field("entry", &self.entry())
            .field("nodes", &self.node_names())
            .finish()
    }
}
