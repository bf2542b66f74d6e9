//! Graph definition and compilation.
//!
//! A graph is a set of named nodes over one [`StateSchema`](stepgraph_core::StateSchema),
//! joined by static edges and conditional routes. [`GraphDefinition::compile`]
//! resolves every name once; the executor then walks indices only.

pub mod compiled;
pub mod definition;
pub mod mermaid;
pub mod node;
pub mod route;

pub use compiled::CompiledGraph;
pub use definition::GraphDefinition;
pub use node::{node_fn, ChildInvocation, FanOut, FnNode, Interrupt, NodeContext, NodeHandler};
pub use route::RouteLabel;

/// Terminal sentinel usable as any edge target.
pub const END: &str = "__end__";
