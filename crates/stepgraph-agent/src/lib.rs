//! Graph-based agent execution: compile a graph of nodes, walk it with a
//! step budget, fan work out to parallel children, loop a model over
//! tools, and suspend for human input between calls.

pub mod catalog;
pub mod checkpoint;
pub mod executor;
pub mod fanout;
pub mod graph;
pub mod runs;
pub mod templates;
pub mod tool_loop;

pub use catalog::{CatalogEntry, GraphCatalog};
pub use checkpoint::{MemoryCheckpointStore, SqliteCheckpointStore};
pub use executor::{Execution, Executor, NodeSnapshot, Progress, RunOutcome};
pub use fanout::{FanOutCoordinator, FanOutResult};
pub use graph::{
    node_fn, ChildInvocation, CompiledGraph, FanOut, GraphDefinition, Interrupt, NodeContext,
    NodeHandler, RouteLabel, END,
};
pub use runs::{RunHandle, RunManager};
pub use templates::{builtin_catalog, question_input};
pub use tool_loop::{tools_condition, ModelNode, ToolLoopRunner, ToolNode, ToolsRoute};
