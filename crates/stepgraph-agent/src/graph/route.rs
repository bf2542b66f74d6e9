use std::fmt::Debug;
use std::sync::Arc;

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::state::RunState;

use super::compiled::Next;

/// Closed set of labels a routing function can return.
///
/// `all()` must list every variant; the graph compiler checks that a
/// conditional edge maps each of them, so a route can never produce a
/// label without a target.
pub trait RouteLabel: Copy + Eq + Debug + Send + Sync + 'static {
    fn all() -> &'static [Self];
    fn as_str(&self) -> &'static str;
}

pub(crate) type ErasedRouter = Arc<dyn Fn(&RunState) -> &'static str + Send + Sync>;

/// A conditional edge as declared, before target resolution.
pub(crate) struct ConditionalEdge {
    pub(crate) router: ErasedRouter,
    pub(crate) labels: Vec<&'static str>,
    pub(crate) mapping: Vec<(&'static str, String)>,
}

impl ConditionalEdge {
    pub(crate) fn new<L, F>(router: F, mapping: Vec<(L, String)>) -> Self
    where
        L: RouteLabel,
        F: Fn(&RunState) -> L + Send + Sync + 'static,
    {
        Self {
            router: Arc::new(move |state| router(state).as_str()),
            labels: L::all().iter().map(|l| l.as_str()).collect(),
            mapping: mapping
                .into_iter()
                .map(|(label, target)| (label.as_str(), target))
                .collect(),
        }
    }

    /// Labels declared by the route type that have no target.
    pub(crate) fn unmapped(&self) -> Vec<&'static str> {
        self.labels
            .iter()
            .copied()
            .filter(|l| !self.mapping.iter().any(|(m, _)| m == l))
            .collect()
    }
}

/// A conditional edge with targets resolved to node indices.
pub(crate) struct Route {
    pub(crate) router: ErasedRouter,
    pub(crate) targets: Vec<(&'static str, Next)>,
}

impl Route {
    /// Pick the successor of `node` from the post-update state.
    pub(crate) fn select(&self, node: &str, state: &RunState) -> Result<(&'static str, Next)> {
        let label = (self.router)(state);
        self.targets
            .iter()
            .find(|(l, _)| *l == label)
            .copied()
            .ok_or_else(|| StepGraphError::Routing {
                node: node.to_string(),
                message: format!("route returned undeclared label '{}'", label),
            })
    }
}
