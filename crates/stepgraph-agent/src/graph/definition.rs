use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::state::{FieldPolicy, RunState, StateSchema};

use super::compiled::{CompiledGraph, CompiledNode, Next, Transition};
use super::node::{FanOut, Interrupt, NodeHandler, NodeKind};
use super::route::{ConditionalEdge, Route, RouteLabel};
use super::END;
use crate::tool_loop::ToolLoopRunner;

fn compile_error(message: impl Into<String>) -> StepGraphError {
    StepGraphError::GraphCompile(message.into())
}

/// Declarative graph under construction.
///
/// Nothing is checked until [`GraphDefinition::compile`], which resolves
/// every name to an index and rejects structural mistakes before any run
/// starts.
pub struct GraphDefinition {
    name: String,
    schema: StateSchema,
    nodes: Vec<(String, NodeKind)>,
    edges: Vec<(String, String)>,
    conditional: Vec<(String, ConditionalEdge)>,
    entry: Option<String>,
}

impl GraphDefinition {
    pub fn new(name: impl Into<String>, schema: StateSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            nodes: Vec::new(),
            edges: Vec::new(),
            conditional: Vec::new(),
            entry: None,
        }
    }

    /// Add a transform node.
    pub fn add_node(mut self, name: impl Into<String>, handler: impl NodeHandler) -> Self {
        self.nodes
            .push((name.into(), NodeKind::Transform(Arc::new(handler))));
        self
    }

    /// Add a node that runs a bounded tool loop.
    pub fn add_tool_loop(mut self, name: impl Into<String>, runner: ToolLoopRunner) -> Self {
        self.nodes
            .push((name.into(), NodeKind::ToolLoop(Arc::new(runner))));
        self
    }

    /// Add a fan-out node. Its successor is always its join node.
    pub fn add_fan_out(mut self, name: impl Into<String>, fan_out: FanOut) -> Self {
        self.nodes.push((name.into(), NodeKind::FanOut(fan_out)));
        self
    }

    /// Add a suspend-for-input node. Its successors come from the
    /// interrupt's continue and finish targets.
    pub fn add_interrupt(mut self, name: impl Into<String>, interrupt: Interrupt) -> Self {
        self.nodes.push((name.into(), NodeKind::Interrupt(interrupt)));
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Route out of `from` by a label computed from the post-update state.
    pub fn add_conditional_edge<L, F>(
        mut self,
        from: impl Into<String>,
        router: F,
        mapping: impl IntoIterator<Item = (L, &'static str)>,
    ) -> Self
    where
        L: RouteLabel,
        F: Fn(&RunState) -> L + Send + Sync + 'static,
    {
        let mapping = mapping
            .into_iter()
            .map(|(label, target)| (label, target.to_string()))
            .collect();
        self.conditional
            .push((from.into(), ConditionalEdge::new(router, mapping)));
        self
    }

    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Validate and freeze the graph.
    pub fn compile(self) -> Result<CompiledGraph> {
        let GraphDefinition {
            name,
            schema,
            nodes,
            edges,
            conditional,
            entry,
        } = self;

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, (node, _)) in nodes.iter().enumerate() {
            if node == END {
                return Err(compile_error(format!("'{}' is a reserved node name", END)));
            }
            if index.insert(node.clone(), i).is_some() {
                return Err(compile_error(format!("duplicate node name '{}'", node)));
            }
        }

        for (from, _) in &edges {
            if !index.contains_key(from) {
                return Err(compile_error(format!("edge from unknown node '{}'", from)));
            }
        }
        for (from, _) in &conditional {
            if !index.contains_key(from) {
                return Err(compile_error(format!(
                    "conditional edge from unknown node '{}'",
                    from
                )));
            }
        }

        let mut conditional: HashMap<String, ConditionalEdge> = {
            let mut by_node = HashMap::new();
            for (from, edge) in conditional {
                if by_node.insert(from.clone(), edge).is_some() {
                    return Err(compile_error(format!(
                        "node '{}' has more than one conditional edge",
                        from
                    )));
                }
            }
            by_node
        };

        // Resolve each node's transition.
        let mut transitions = Vec::with_capacity(nodes.len());
        for (node, kind) in &nodes {
            let statics: Vec<&str> = edges
                .iter()
                .filter(|(from, _)| from == node)
                .map(|(_, to)| to.as_str())
                .collect();
            let cond = conditional.remove(node);

            let transition = match kind {
                NodeKind::FanOut(fan_out) => {
                    if !statics.is_empty() || cond.is_some() {
                        return Err(compile_error(format!(
                            "fan-out node '{}' cannot have outgoing edges; it continues at its join node",
                            node
                        )));
                    }
                    compile_fan_out(node, fan_out, &nodes, &index, &schema)?
                }
                NodeKind::Interrupt(interrupt) => {
                    if !statics.is_empty() || cond.is_some() {
                        return Err(compile_error(format!(
                            "interrupt node '{}' cannot have outgoing edges; set its continue and finish targets",
                            node
                        )));
                    }
                    if schema.policy(&interrupt.history) != Some(FieldPolicy::AppendById) {
                        return Err(compile_error(format!(
                            "interrupt node '{}' needs an append-by-id history field, got '{}'",
                            node, interrupt.history
                        )));
                    }
                    let on_continue = interrupt.on_continue.as_deref().ok_or_else(|| {
                        compile_error(format!("interrupt node '{}' has no continue target", node))
                    })?;
                    Transition::Interrupt {
                        on_continue: resolve_target(&index, node, on_continue)?,
                        on_finish: resolve_target(&index, node, &interrupt.on_finish)?,
                    }
                }
                NodeKind::Transform(_) | NodeKind::ToolLoop(_) => match (statics.as_slice(), cond) {
                    ([], None) => Transition::Static(Next::End),
                    ([to], None) => Transition::Static(resolve_target(&index, node, to)?),
                    ([], Some(edge)) => {
                        let unmapped = edge.unmapped();
                        if !unmapped.is_empty() {
                            return Err(compile_error(format!(
                                "conditional edge from '{}' does not map label(s): {}",
                                node,
                                unmapped.join(", ")
                            )));
                        }
                        let mut targets = Vec::with_capacity(edge.mapping.len());
                        for (label, target) in &edge.mapping {
                            targets.push((*label, resolve_target(&index, node, target)?));
                        }
                        Transition::Conditional(Route {
                            router: edge.router,
                            targets,
                        })
                    }
                    (_, Some(_)) => {
                        return Err(compile_error(format!(
                            "node '{}' has both static and conditional edges",
                            node
                        )))
                    }
                    (_, None) => {
                        return Err(compile_error(format!(
                            "node '{}' has {} static edges; use a conditional edge to branch",
                            node,
                            statics.len()
                        )))
                    }
                },
            };
            transitions.push(transition);
        }

        let entry_name = entry.ok_or_else(|| compile_error("no entry node set"))?;
        let entry = *index
            .get(&entry_name)
            .ok_or_else(|| compile_error(format!("entry node '{}' is not declared", entry_name)))?;

        let compiled_nodes: Vec<CompiledNode> = nodes
            .into_iter()
            .zip(transitions)
            .map(|((name, kind), transition)| CompiledNode {
                name,
                kind,
                transition,
            })
            .collect();

        let diagnostics = diagnose(&compiled_nodes, entry);
        for d in &diagnostics {
            warn!(graph = %name, "{}", d);
        }

        Ok(CompiledGraph {
            name,
            schema,
            nodes: compiled_nodes,
            index,
            entry,
            diagnostics,
        })
    }
}

fn resolve_target(index: &HashMap<String, usize>, from: &str, target: &str) -> Result<Next> {
    if target == END {
        return Ok(Next::End);
    }
    index.get(target).map(|&i| Next::Node(i)).ok_or_else(|| {
        compile_error(format!(
            "edge from '{}' targets unknown node '{}'",
            from, target
        ))
    })
}

fn compile_fan_out(
    node: &str,
    fan_out: &FanOut,
    nodes: &[(String, NodeKind)],
    index: &HashMap<String, usize>,
    schema: &StateSchema,
) -> Result<Transition> {
    let join_name = fan_out
        .join
        .as_deref()
        .ok_or_else(|| compile_error(format!("fan-out node '{}' has no join node", node)))?;
    let join = *index.get(join_name).ok_or_else(|| {
        compile_error(format!(
            "fan-out node '{}' joins at unknown node '{}'",
            node, join_name
        ))
    })?;

    if fan_out.targets.is_empty() {
        return Err(compile_error(format!(
            "fan-out node '{}' declares no child targets",
            node
        )));
    }

    let mut targets = HashMap::with_capacity(fan_out.targets.len());
    for target in &fan_out.targets {
        let idx = *index.get(target).ok_or_else(|| {
            compile_error(format!(
                "fan-out node '{}' targets unknown node '{}'",
                node, target
            ))
        })?;
        let kind = &nodes[idx].1;
        let handler = kind.handler().ok_or_else(|| {
            compile_error(format!(
                "fan-out node '{}' cannot dispatch to {} node '{}'",
                node,
                kind.describe(),
                target
            ))
        })?;
        targets.insert(target.clone(), handler);
    }

    for field in fan_out.inputs.iter().chain(&fan_out.outputs) {
        if !schema.contains(field) {
            return Err(compile_error(format!(
                "fan-out node '{}' scopes unknown field '{}'",
                node, field
            )));
        }
    }
    if schema.policy(&fan_out.failures) != Some(FieldPolicy::Accumulate) {
        return Err(compile_error(format!(
            "fan-out node '{}' records failures in '{}', which is not an accumulate field",
            node, fan_out.failures
        )));
    }

    Ok(Transition::FanOut { targets, join })
}

fn successors(node: &CompiledNode) -> Vec<Next> {
    match &node.transition {
        Transition::Static(next) => vec![*next],
        Transition::Conditional(route) => route.targets.iter().map(|(_, n)| *n).collect(),
        Transition::FanOut { join, .. } => vec![Next::Node(*join)],
        Transition::Interrupt {
            on_continue,
            on_finish,
        } => vec![*on_continue, *on_finish],
    }
}

/// Nodes only ever run as fan-out children.
fn child_only(nodes: &[CompiledNode]) -> HashSet<usize> {
    let mut dispatched = HashSet::new();
    for node in nodes {
        if let NodeKind::FanOut(fan_out) = &node.kind {
            for target in &fan_out.targets {
                if let Some(i) = nodes.iter().position(|n| &n.name == target) {
                    dispatched.insert(i);
                }
            }
        }
    }
    dispatched
}

/// Reachability findings. Loops with no exit are legal (interactive graphs
/// bounded by the step budget), so these are reported, not rejected.
fn diagnose(nodes: &[CompiledNode], entry: usize) -> Vec<String> {
    let children = child_only(nodes);
    let mut findings = Vec::new();

    let mut reachable = vec![false; nodes.len()];
    let mut queue = VecDeque::from([entry]);
    reachable[entry] = true;
    while let Some(i) = queue.pop_front() {
        let mut next: Vec<usize> = successors(&nodes[i])
            .into_iter()
            .filter_map(|n| match n {
                Next::Node(j) => Some(j),
                Next::End => None,
            })
            .collect();
        if let NodeKind::FanOut(fan_out) = &nodes[i].kind {
            next.extend(
                fan_out
                    .targets
                    .iter()
                    .filter_map(|t| nodes.iter().position(|n| &n.name == t)),
            );
        }
        for j in next {
            if !reachable[j] {
                reachable[j] = true;
                queue.push_back(j);
            }
        }
    }

    // Fixed point: a node reaches a terminal if any successor is END or
    // a node that does.
    let mut terminates = vec![false; nodes.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for (i, node) in nodes.iter().enumerate() {
            if terminates[i] {
                continue;
            }
            let ok = successors(node).into_iter().any(|n| match n {
                Next::End => true,
                Next::Node(j) => terminates[j],
            });
            if ok {
                terminates[i] = true;
                changed = true;
            }
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        if !reachable[i] {
            findings.push(format!("node '{}' is unreachable from the entry", node.name));
        } else if !terminates[i] && !children.contains(&i) {
            findings.push(format!("node '{}' has no path to a terminal", node.name));
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{node_fn, ChildInvocation, NodeContext};
    use serde_json::json;
    use stepgraph_core::state::StateUpdate;

    fn noop() -> impl NodeHandler {
        node_fn(|_: RunState, _: NodeContext| async { Ok(StateUpdate::new()) })
    }

    fn schema() -> StateSchema {
        StateSchema::new()
            .append_by_id("messages")
            .replace("verdict")
            .accumulate("results")
            .replace("task")
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Verdict {
        Approve,
        Revise,
        Escalate,
    }

    impl RouteLabel for Verdict {
        fn all() -> &'static [Self] {
            &[Self::Approve, Self::Revise, Self::Escalate]
        }

        fn as_str(&self) -> &'static str {
            match self {
                Self::Approve => "approve",
                Self::Revise => "revise",
                Self::Escalate => "escalate",
            }
        }
    }

    fn verdict(state: &RunState) -> Verdict {
        match state.get_str("verdict") {
            Some("approve") => Verdict::Approve,
            Some("escalate") => Verdict::Escalate,
            _ => Verdict::Revise,
        }
    }

    #[test]
    fn compiles_linear_graph() {
        let graph = GraphDefinition::new("linear", schema())
            .add_node("a", noop())
            .add_node("b", noop())
            .add_edge("a", "b")
            .add_edge("b", END)
            .set_entry("a")
            .compile()
            .unwrap();
        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.node_names(), vec!["a", "b"]);
        assert!(graph.diagnostics().is_empty());
    }

    #[test]
    fn rejects_non_total_conditional_edge() {
        let err = GraphDefinition::new("review", schema())
            .add_node("draft", noop())
            .add_node("publish", noop())
            .add_conditional_edge(
                "draft",
                verdict,
                [(Verdict::Approve, "publish"), (Verdict::Revise, "draft")],
            )
            .set_entry("draft")
            .compile()
            .unwrap_err();
        match err {
            StepGraphError::GraphCompile(msg) => assert!(msg.contains("escalate"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn accepts_total_conditional_edge() {
        let graph = GraphDefinition::new("review", schema())
            .add_node("draft", noop())
            .add_node("publish", noop())
            .add_conditional_edge(
                "draft",
                verdict,
                [
                    (Verdict::Approve, "publish"),
                    (Verdict::Revise, "draft"),
                    (Verdict::Escalate, END),
                ],
            )
            .set_entry("draft")
            .compile();
        assert!(graph.is_ok());
    }

    #[test]
    fn rejects_unknown_target_and_duplicates() {
        let err = GraphDefinition::new("g", schema())
            .add_node("a", noop())
            .add_edge("a", "missing")
            .set_entry("a")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("unknown node 'missing'"));

        let err = GraphDefinition::new("g", schema())
            .add_node("a", noop())
            .add_node("a", noop())
            .set_entry("a")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate node name 'a'"));
    }

    #[test]
    fn rejects_missing_entry() {
        let err = GraphDefinition::new("g", schema())
            .add_node("a", noop())
            .compile()
            .unwrap_err();
        assert!(matches!(err, StepGraphError::GraphCompile(_)));

        let err = GraphDefinition::new("g", schema())
            .add_node("a", noop())
            .set_entry("b")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("entry node 'b'"));
    }

    #[test]
    fn rejects_branching_static_edges() {
        let err = GraphDefinition::new("g", schema())
            .add_node("a", noop())
            .add_node("b", noop())
            .add_edge("a", "b")
            .add_edge("a", END)
            .set_entry("a")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("2 static edges"));
    }

    #[test]
    fn self_loop_compiles_with_diagnostic() {
        let graph = GraphDefinition::new("spin", schema())
            .add_node("spin", noop())
            .add_edge("spin", "spin")
            .set_entry("spin")
            .compile()
            .unwrap();
        assert_eq!(graph.diagnostics().len(), 1);
        assert!(graph.diagnostics()[0].contains("no path to a terminal"));
    }

    #[test]
    fn reports_unreachable_nodes() {
        let graph = GraphDefinition::new("g", schema())
            .add_node("a", noop())
            .add_node("orphan", noop())
            .set_entry("a")
            .compile()
            .unwrap();
        assert_eq!(
            graph.diagnostics(),
            &["node 'orphan' is unreachable from the entry".to_string()]
        );
    }

    #[test]
    fn validates_fan_out() {
        let producer = |_: &RunState| -> Result<Vec<ChildInvocation>> {
            Ok(vec![ChildInvocation::new("work", json!({}))])
        };

        let ok = GraphDefinition::new("g", schema())
            .add_fan_out(
                "dispatch",
                FanOut::new(producer)
                    .target("work")
                    .join("sum")
                    .inputs(&["messages"])
                    .outputs(&["results"]),
            )
            .add_node("work", noop())
            .add_node("sum", noop())
            .set_entry("dispatch")
            .compile()
            .unwrap();
        // Child-only nodes are not flagged for lacking a terminal path.
        assert!(ok.diagnostics().is_empty());

        let err = GraphDefinition::new("g", schema())
            .add_fan_out("dispatch", FanOut::new(producer).target("work"))
            .add_node("work", noop())
            .set_entry("dispatch")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("no join node"));

        let err = GraphDefinition::new("g", schema())
            .add_fan_out(
                "dispatch",
                FanOut::new(producer).target("work").join("sum").failures("verdict"),
            )
            .add_node("work", noop())
            .add_node("sum", noop())
            .set_entry("dispatch")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("not an accumulate field"));

        let err = GraphDefinition::new("g", schema())
            .add_fan_out("dispatch", FanOut::new(producer).target("sum").join("sum"))
            .add_node("sum", noop())
            .add_edge("dispatch", "sum")
            .set_entry("dispatch")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("cannot have outgoing edges"));
    }

    #[test]
    fn interrupt_needs_continue_target() {
        let err = GraphDefinition::new("g", schema())
            .add_node("chat", noop())
            .add_interrupt("review", Interrupt::new("ok?", "messages"))
            .add_edge("chat", "review")
            .set_entry("chat")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("no continue target"));

        let err = GraphDefinition::new("g", schema())
            .add_node("chat", noop())
            .add_interrupt("review", Interrupt::new("ok?", "verdict").on_continue("chat"))
            .add_edge("chat", "review")
            .set_entry("chat")
            .compile()
            .unwrap_err();
        assert!(err.to_string().contains("append-by-id history"));
    }
}
