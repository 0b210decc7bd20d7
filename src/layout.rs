//! Node placement for graphs produced by the agent.
//!
//! The agent returns nodes without meaningful positions. Before the graph is
//! imported into the canvas it goes through a [`LayoutEngine`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::{
    algo::{is_cyclic_directed, tarjan_scc, toposort},
    graph::{DiGraph, NodeIndex},
    Direction,
};
use serde::{Deserialize, Serialize};

use crate::types::{Edge, Node, Position};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutDirection {
    #[default]
    LeftToRight,
    TopToBottom,
}

/// Pure function from a graph to repositioned nodes.
pub trait LayoutEngine: Send + Sync {
    fn layout(&self, nodes: Vec<Node>, edges: &[Edge], direction: LayoutDirection) -> Vec<Node>;
}

/// Layered placement by topological generation.
///
/// Generation `n` sits at `n * rank_sep` along the main axis; each layer is
/// centred on the cross axis with `node_sep` between nodes, in id order.
/// Nodes caught in a cycle go into one trailing layer.
#[derive(Debug, Clone)]
pub struct LayeredLayout {
    pub rank_sep: f64,
    pub node_sep: f64,
}

impl Default for LayeredLayout {
    fn default() -> Self {
        Self {
            rank_sep: 250.0,
            node_sep: 150.0,
        }
    }
}

impl LayeredLayout {
    fn generations(nodes: &[Node], edges: &[Edge]) -> Vec<Vec<String>> {
        let ids: BTreeSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut graph: DiGraph<&str, ()> = DiGraph::with_capacity(ids.len(), edges.len());
        let index_of: HashMap<&str, NodeIndex> =
            ids.iter().map(|id| (*id, graph.add_node(*id))).collect();

        // Edges to unknown nodes are dropped; repeated edges collapse.
        for edge in edges {
            if let (Some(&from), Some(&to)) = (
                index_of.get(edge.source.as_str()),
                index_of.get(edge.target.as_str()),
            ) {
                graph.update_edge(from, to, ());
            }
        }

        let mut cyclic: BTreeSet<&str> = BTreeSet::new();
        if is_cyclic_directed(&graph) {
            for component in tarjan_scc(&graph) {
                let looped = match component.as_slice() {
                    [single] => graph.contains_edge(*single, *single),
                    _ => true,
                };
                if looped {
                    cyclic.extend(component.iter().map(|ix| graph[*ix]));
                }
            }
        }

        let dag = graph.filter_map(
            |_, id| (!cyclic.contains(id)).then_some(*id),
            |_, edge| Some(*edge),
        );
        let order = toposort(&dag, None).unwrap_or_else(|_| dag.node_indices().collect());

        // A node's generation is one past its deepest predecessor.
        let mut rank = vec![0usize; dag.node_count()];
        let mut by_rank: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for ix in order {
            let r = dag
                .neighbors_directed(ix, Direction::Incoming)
                .map(|pred| rank[pred.index()] + 1)
                .max()
                .unwrap_or(0);
            rank[ix.index()] = r;
            by_rank.entry(r).or_default().push(dag[ix]);
        }

        let mut layers: Vec<Vec<String>> = by_rank
            .into_values()
            .map(|mut layer| {
                layer.sort_unstable();
                layer.into_iter().map(str::to_string).collect()
            })
            .collect();
        if !cyclic.is_empty() {
            tracing::debug!(count = cyclic.len(), "graph has cycles; placing them last");
            layers.push(cyclic.into_iter().map(str::to_string).collect());
        }
        layers
    }
}

impl LayoutEngine for LayeredLayout {
    fn layout(&self, mut nodes: Vec<Node>, edges: &[Edge], direction: LayoutDirection) -> Vec<Node> {
        let mut positions: HashMap<String, Position> = HashMap::new();
        for (rank, layer) in Self::generations(&nodes, edges).into_iter().enumerate() {
            let main = rank as f64 * self.rank_sep;
            let start = -((layer.len() as f64 - 1.0) * self.node_sep) / 2.0;
            for (index, id) in layer.into_iter().enumerate() {
                let cross = start + index as f64 * self.node_sep;
                let position = match direction {
                    LayoutDirection::LeftToRight => Position { x: main, y: cross },
                    LayoutDirection::TopToBottom => Position { x: cross, y: main },
                };
                positions.insert(id, position);
            }
        }
        for node in &mut nodes {
            if let Some(position) = positions.remove(&node.id) {
                node.position = position;
            }
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(nodes: &[Node]) -> Vec<(&str, f64, f64)> {
        nodes
            .iter()
            .map(|n| (n.id.as_str(), n.position.x, n.position.y))
            .collect()
    }

    #[test]
    fn layers_follow_topological_generations() {
        let nodes = vec![
            Node::new("end", "end"),
            Node::new("start", "start"),
            Node::new("b", "llm"),
            Node::new("a", "llm"),
        ];
        let edges = vec![
            Edge::new("start", "a"),
            Edge::new("start", "b"),
            Edge::new("a", "end"),
            Edge::new("b", "end"),
        ];
        let laid = LayeredLayout::default().layout(nodes, &edges, LayoutDirection::LeftToRight);
        assert_eq!(
            positions(&laid),
            vec![
                ("end", 500.0, 0.0),
                ("start", 0.0, 0.0),
                ("b", 250.0, 75.0),
                ("a", 250.0, -75.0),
            ]
        );
    }

    #[test]
    fn top_to_bottom_swaps_axes() {
        let nodes = vec![Node::new("a", "x"), Node::new("b", "x")];
        let edges = vec![Edge::new("a", "b")];
        let laid = LayeredLayout::default().layout(nodes, &edges, LayoutDirection::TopToBottom);
        assert_eq!(positions(&laid), vec![("a", 0.0, 0.0), ("b", 0.0, 250.0)]);
    }

    #[test]
    fn cycles_and_dangling_edges_do_not_lose_nodes() {
        let nodes = vec![Node::new("root", "x"), Node::new("p", "x"), Node::new("q", "x")];
        let edges = vec![
            Edge::new("p", "q"),
            Edge::new("q", "p"),
            Edge::new("root", "ghost"),
        ];
        let laid = LayeredLayout::default().layout(nodes, &edges, LayoutDirection::LeftToRight);
        assert_eq!(
            positions(&laid),
            vec![("root", 0.0, 0.0), ("p", 250.0, -75.0), ("q", 250.0, 75.0)]
        );
    }

    #[test]
    fn nodes_downstream_of_a_cycle_keep_their_rank() {
        let nodes = vec![
            Node::new("start", "x"),
            Node::new("p", "x"),
            Node::new("q", "x"),
            Node::new("after", "x"),
            Node::new("looped", "x"),
        ];
        let edges = vec![
            Edge::new("start", "p"),
            Edge::new("p", "q"),
            Edge::new("q", "p"),
            Edge::new("q", "after"),
            Edge::new("start", "after"),
            Edge::new("start", "after"),
            Edge::new("looped", "looped"),
        ];
        let laid = LayeredLayout::default().layout(nodes, &edges, LayoutDirection::LeftToRight);
        assert_eq!(
            positions(&laid),
            vec![
                ("start", 0.0, 0.0),
                ("p", 500.0, 0.0),
                ("q", 500.0, 150.0),
                ("after", 250.0, 0.0),
                ("looped", 500.0, -150.0),
            ]
        );
    }
}
