use std::fmt::Write;

use super::compiled::{CompiledGraph, Next, Transition};
use super::node::NodeKind;
use super::END;

const START: &str = "__start__";

impl CompiledGraph {
    /// Render the graph as a Mermaid flowchart.
    ///
    /// Shapes mark node kinds: tool loops are subroutines, fan-outs are
    /// hexagons, interrupts are flags. Conditional routes are dotted and
    /// labelled; fan-out dispatch is a thick arrow.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("flowchart TD\n");
        let _ = writeln!(out, "    {START}([start])");
        for node in &self.nodes {
            let id = node_id(&node.name);
            let line = match node.kind {
                NodeKind::Transform(_) => format!("{id}[{}]", node.name),
                NodeKind::ToolLoop(_) => format!("{id}[[{}]]", node.name),
                NodeKind::FanOut(_) => format!("{id}{{{{{}}}}}", node.name),
                NodeKind::Interrupt(_) => format!("{id}>{}]", node.name),
            };
            let _ = writeln!(out, "    {line}");
        }
        let _ = writeln!(out, "    {}([end])", node_id(END));

        let _ = writeln!(out, "    {START} --> {}", node_id(self.entry()));
        for node in &self.nodes {
            let from = node_id(&node.name);
            match &node.transition {
                Transition::Static(Next::End) if !self.is_child_only(&node.name) => {
                    let _ = writeln!(out, "    {from} --> {}", node_id(END));
                }
                Transition::Static(Next::End) => {}
                Transition::Static(next) => {
                    let _ = writeln!(out, "    {from} --> {}", node_id(self.next_name(*next)));
                }
                Transition::Conditional(route) => {
                    for (label, next) in &route.targets {
                        let _ = writeln!(
                            out,
                            "    {from} -.->|{label}| {}",
                            node_id(self.next_name(*next))
                        );
                    }
                }
                Transition::FanOut { join, .. } => {
                    if let NodeKind::FanOut(fan_out) = &node.kind {
                        for target in &fan_out.targets {
                            let _ = writeln!(out, "    {from} ==>|fan-out| {}", node_id(target));
                        }
                    }
                    let _ = writeln!(out, "    {from} --> {}", node_id(&self.nodes[*join].name));
                }
                Transition::Interrupt {
                    on_continue,
                    on_finish,
                } => {
                    let _ = writeln!(
                        out,
                        "    {from} -.->|reply| {}",
                        node_id(self.next_name(*on_continue))
                    );
                    let _ = writeln!(
                        out,
                        "    {from} -.->|terminal| {}",
                        node_id(self.next_name(*on_finish))
                    );
                }
            }
        }
        out
    }

    fn is_child_only(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| match &n.kind {
            NodeKind::FanOut(fan_out) => fan_out.targets.iter().any(|t| t == name),
            _ => false,
        })
    }
}

/// Mermaid ids cannot contain spaces or most punctuation.
fn node_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::graph::{node_fn, GraphDefinition, NodeContext, END};
    use stepgraph_core::state::{RunState, StateSchema, StateUpdate};

    #[test]
    fn renders_nodes_and_edges() {
        let noop = || node_fn(|_: RunState, _: NodeContext| async { Ok(StateUpdate::new()) });
        let graph = GraphDefinition::new("demo", StateSchema::new())
            .add_node("load data", noop())
            .add_node("answer", noop())
            .add_edge("load data", "answer")
            .add_edge("answer", END)
            .set_entry("load data")
            .compile()
            .unwrap();

        let chart = graph.to_mermaid();
        assert!(chart.starts_with("flowchart TD\n"));
        assert!(chart.contains("load_data[load data]"));
        assert!(chart.contains("__start__ --> load_data"));
        assert!(chart.contains("load_data --> answer"));
        assert!(chart.contains("answer --> __end__"));
    }
}
