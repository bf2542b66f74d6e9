use std::collections::BTreeMap;
use std::sync::Arc;

use stepgraph_core::error::{Result, StepGraphError};

use crate::graph::CompiledGraph;

/// A named, compiled graph available to runs.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    pub graph: Arc<CompiledGraph>,
}

/// Registry of compiled graphs, looked up by name when a run starts or
/// resumes.
#[derive(Debug, Clone, Default)]
pub struct GraphCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl GraphCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph, replacing any previous graph of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        graph: Arc<CompiledGraph>,
    ) {
        let name = name.into();
        self.entries.insert(
            name.clone(),
            CatalogEntry {
                name,
                description: description.into(),
                graph,
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<Arc<CompiledGraph>> {
        self.entries
            .get(name)
            .map(|e| Arc::clone(&e.graph))
            .ok_or_else(|| StepGraphError::GraphNotFound(name.to_string()))
    }

    /// Entries sorted by name.
    pub fn list(&self) -> Vec<&CatalogEntry> {
        self.entries.values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepgraph_core::state::{StateSchema, StateUpdate};

    use crate::graph::{node_fn, GraphDefinition, NodeContext};
    use stepgraph_core::state::RunState;

    fn noop(name: &str) -> Arc<CompiledGraph> {
        let graph = GraphDefinition::new(name, StateSchema::new())
            .add_node(
                "only",
                node_fn(|_: RunState, _ctx: NodeContext| async { Ok(StateUpdate::new()) }),
            )
            .set_entry("only")
            .compile()
            .unwrap();
        Arc::new(graph)
    }

    #[test]
    fn lookup_and_listing() {
        let mut catalog = GraphCatalog::new();
        catalog.register("b", "second", noop("b"));
        catalog.register("a", "first", noop("a"));

        assert_eq!(catalog.get("a").unwrap().name(), "a");
        let names: Vec<_> = catalog.list().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(matches!(
            catalog.get("missing"),
            Err(StepGraphError::GraphNotFound(ref n)) if n == "missing"
        ));
    }
}
