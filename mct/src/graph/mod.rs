//! Framework agnostic graph representation of a model.
//!
//! A [`Graph`] owns its [`Node`]s, keyed by a monotonically increasing [`NodeId`], and the
//! [`Edge`]s linking their wires. Every structural rewrite keeps the graph a DAG whose
//! edges connect wires of identical shape; operations that would break that invariant fail
//! with a [`GraphError`] and leave the graph untouched.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

mod edge;
mod node;

pub use edge::{Edge, OutputRef, Side};
pub use node::{
    AttrValue, Node, NodeId, OpType, Shape, SplitRole, WeightTensor, ACTIVATION_ATTR, BETA, BIAS,
    EPSILON, GAMMA, IDENTITY_ACTIVATION, KERNEL, MOVING_MEAN, MOVING_VARIANCE,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("graph contains a cycle among nodes {remaining:?}")]
    Cycle { remaining: Vec<NodeId> },
    #[error("adding edge {0} would create a cycle")]
    CycleCreated(Edge),
    #[error("node {node} still has {edges} connected wire(s)")]
    DanglingEdge { node: NodeId, edges: usize },
    #[error("{side} index {index} out of range for node {node} ({available} available)")]
    IndexMismatch {
        node: NodeId,
        side: Side,
        index: usize,
        available: usize,
    },
    #[error("shape mismatch on edge {edge}: producer gives {produced:?}, consumer expects {expected:?}")]
    ShapeMismatch {
        edge: Edge,
        produced: Shape,
        expected: Shape,
    },
    #[error("input {index} of node {node} is already fed")]
    DuplicateInput { node: NodeId, index: usize },
    #[error("node {node} cannot be spliced out: {reason}")]
    NotSpliceable { node: NodeId, reason: String },
    #[error("weight of shape {shape:?} cannot hold {len} values")]
    InvalidWeight { shape: Shape, len: usize },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "GraphData")]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeSet<Edge>,
    /// Output wires of the graph, in the order the model returns them
    outputs: Vec<OutputRef>,
    #[serde(skip)]
    next_id: NodeId,
}

/// Serialized form of a [`Graph`]; the id counter is rebuilt from the node ids
#[derive(Deserialize)]
struct GraphData {
    nodes: BTreeMap<NodeId, Node>,
    #[serde(default)]
    edges: BTreeSet<Edge>,
    #[serde(default)]
    outputs: Vec<OutputRef>,
}

impl From<GraphData> for Graph {
    fn from(data: GraphData) -> Self {
        let next_id = data.nodes.keys().next_back().map_or(0, |id| id + 1);
        Self {
            nodes: data.nodes,
            edges: data.edges,
            outputs: data.outputs,
            next_id,
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `node` under a fresh id, never one already in use
    pub fn add_node(&mut self, node: Node) -> NodeId {
        while self.nodes.contains_key(&self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().map(|(id, n)| (*id, n))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut Node)> {
        self.nodes.iter_mut().map(|(id, n)| (*id, n))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn outputs(&self) -> &[OutputRef] {
        &self.outputs
    }

    /// Nodes fed from outside the graph
    pub fn input_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.op == OpType::Input)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| *id)
    }

    /// Adds an edge after checking both endpoints, wire indices, shapes, that the input wire
    /// is not already fed and that the edge does not close a cycle.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        self.check_edge(&edge)?;
        if self.in_edges(edge.sink)?.iter().any(|e| e.sink_index == edge.sink_index) {
            return Err(GraphError::DuplicateInput {
                node: edge.sink,
                index: edge.sink_index,
            });
        }
        if edge.source == edge.sink || self.reaches(edge.sink, edge.source) {
            return Err(GraphError::CycleCreated(edge));
        }
        self.edges.insert(edge);
        Ok(())
    }

    pub fn remove_edge(&mut self, edge: &Edge) -> bool {
        self.edges.remove(edge)
    }

    /// Marks an output wire of `node` as an output of the graph.
    pub fn add_output(&mut self, node: NodeId, index: usize) -> Result<(), GraphError> {
        let available = self.node(node)?.output_shapes.len();
        if index >= available {
            return Err(GraphError::IndexMismatch {
                node,
                side: Side::Output,
                index,
                available,
            });
        }
        self.outputs.push(OutputRef::new(node, index));
        Ok(())
    }

    /// Incoming edges of `id`, ordered by input index
    pub fn in_edges(&self, id: NodeId) -> Result<Vec<Edge>, GraphError> {
        self.node(id)?;
        Ok(self
            .edges
            .iter()
            .filter(|e| e.sink == id)
            .copied()
            .sorted_by_key(|e| e.sink_index)
            .collect())
    }

    /// Outgoing edges of `id`, ordered by output index then consumer
    pub fn out_edges(&self, id: NodeId) -> Result<Vec<Edge>, GraphError> {
        self.node(id)?;
        Ok(self
            .edges
            .iter()
            .filter(|e| e.source == id)
            .copied()
            .sorted_by_key(|e| (e.source_index, e.sink, e.sink_index))
            .collect())
    }

    /// Distinct consumers of any output of `id`
    pub fn get_next_nodes(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        Ok(self
            .out_edges(id)?
            .into_iter()
            .map(|e| e.sink)
            .unique()
            .collect())
    }

    /// Distinct producers of the inputs of `id`, in input order
    pub fn get_prev_nodes(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        Ok(self
            .in_edges(id)?
            .into_iter()
            .map(|e| e.source)
            .unique()
            .collect())
    }

    /// Kahn's algorithm; among ready nodes the smallest id goes first so that the order
    /// only depends on the graph content.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();
        for edge in &self.edges {
            *in_degree.entry(edge.sink).or_default() += 1;
        }
        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for edge in self.edges.iter().filter(|e| e.source == id) {
                if let Some(d) = in_degree.get_mut(&edge.sink) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(edge.sink);
                    }
                }
            }
        }
        if order.len() != in_degree.len() {
            let remaining = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .collect();
            return Err(GraphError::Cycle { remaining });
        }
        Ok(order)
    }

    /// Replaces `old` by `new`. With `reconnect_edges`, every edge and graph output attached
    /// to `old` is moved onto `new` with the same wire indices; the move is checked up front
    /// so a failure leaves the graph untouched. Without it `old` must be disconnected.
    pub fn replace_node(
        &mut self,
        old: NodeId,
        new: Node,
        reconnect_edges: bool,
    ) -> Result<NodeId, GraphError> {
        let incoming = self.in_edges(old)?;
        let outgoing = self.out_edges(old)?;
        let output_refs = self.outputs.iter().filter(|o| o.node == old).count();
        if !reconnect_edges {
            let edges = incoming.len() + outgoing.len() + output_refs;
            if edges > 0 {
                return Err(GraphError::DanglingEdge { node: old, edges });
            }
            self.nodes.remove(&old);
            return Ok(self.add_node(new));
        }

        for edge in &incoming {
            let produced = self.output_shape(edge.source, edge.source_index)?;
            let expected = wire_shape(old, &new.input_shapes, Side::Input, edge.sink_index)?;
            if produced != expected {
                return Err(GraphError::ShapeMismatch {
                    edge: *edge,
                    produced: produced.clone(),
                    expected: expected.clone(),
                });
            }
        }
        for edge in &outgoing {
            let produced = wire_shape(old, &new.output_shapes, Side::Output, edge.source_index)?;
            let expected = self.input_shape(edge.sink, edge.sink_index)?;
            if produced != expected {
                return Err(GraphError::ShapeMismatch {
                    edge: *edge,
                    produced: produced.clone(),
                    expected: expected.clone(),
                });
            }
        }
        for output in self.outputs.iter().filter(|o| o.node == old) {
            wire_shape(old, &new.output_shapes, Side::Output, output.index)?;
        }

        let new_id = self.add_node(new);
        for edge in incoming {
            self.edges.remove(&edge);
            self.edges.insert(edge.with_sink(new_id));
        }
        for edge in outgoing {
            self.edges.remove(&edge);
            self.edges.insert(edge.with_source(new_id, edge.source_index));
        }
        for output in self.outputs.iter_mut().filter(|o| o.node == old) {
            output.node = new_id;
        }
        self.nodes.remove(&old);
        Ok(new_id)
    }

    /// Removes `id`. With `splice_edges` the node must be a single input pass-through whose
    /// input and output shapes agree; its consumers and graph outputs are reconnected to its
    /// producer. Without it the node must be disconnected.
    pub fn remove_node(&mut self, id: NodeId, splice_edges: bool) -> Result<Node, GraphError> {
        let incoming = self.in_edges(id)?;
        let outgoing = self.out_edges(id)?;
        if !splice_edges {
            let edges = incoming.len()
                + outgoing.len()
                + self.outputs.iter().filter(|o| o.node == id).count();
            if edges > 0 {
                return Err(GraphError::DanglingEdge { node: id, edges });
            }
            return self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id));
        }

        let node = self.node(id)?;
        let not_spliceable = |reason: &str| GraphError::NotSpliceable {
            node: id,
            reason: reason.to_string(),
        };
        if node.input_shapes.len() != 1 || node.output_shapes.len() != 1 {
            return Err(not_spliceable("expected exactly one input and one output"));
        }
        if node.input_shapes[0] != node.output_shapes[0] {
            return Err(not_spliceable("input and output shapes differ"));
        }
        let [producer] = incoming.as_slice() else {
            return Err(not_spliceable("input wire is not connected"));
        };
        let producer = *producer;

        self.edges.remove(&producer);
        for edge in outgoing {
            self.edges.remove(&edge);
            self.edges
                .insert(edge.with_source(producer.source, producer.source_index));
        }
        for output in self.outputs.iter_mut().filter(|o| o.node == id) {
            *output = OutputRef::new(producer.source, producer.source_index);
        }
        self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id))
    }

    /// Routes every consumer of output `output_index` of `id` (graph outputs included)
    /// through `new_node`, which must take and produce a wire of that output's shape.
    pub fn insert_node_after(
        &mut self,
        id: NodeId,
        output_index: usize,
        new_node: Node,
    ) -> Result<NodeId, GraphError> {
        let shape = self.output_shape(id, output_index)?.clone();
        let consumers = self
            .out_edges(id)?
            .into_iter()
            .filter(|e| e.source_index == output_index)
            .collect_vec();
        let link = Edge::new(id, output_index, usize::MAX, 0);
        for shapes in [&new_node.input_shapes, &new_node.output_shapes] {
            if shapes.len() != 1 || shapes[0] != shape {
                return Err(GraphError::ShapeMismatch {
                    edge: link,
                    produced: shape,
                    expected: shapes.first().cloned().unwrap_or_default(),
                });
            }
        }

        let new_id = self.add_node(new_node);
        for edge in consumers {
            self.edges.remove(&edge);
            self.edges.insert(edge.with_source(new_id, 0));
        }
        self.edges.insert(link.with_sink(new_id));
        for output in self
            .outputs
            .iter_mut()
            .filter(|o| o.node == id && o.index == output_index)
        {
            *output = OutputRef::new(new_id, 0);
        }
        Ok(new_id)
    }

    /// Checks the structural invariants: every edge and graph output references existing
    /// nodes and wires of matching shapes, each input wire has one producer at most, and
    /// the graph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut fed = BTreeSet::new();
        for edge in &self.edges {
            self.check_edge(edge)?;
            if !fed.insert((edge.sink, edge.sink_index)) {
                return Err(GraphError::DuplicateInput {
                    node: edge.sink,
                    index: edge.sink_index,
                });
            }
        }
        for output in &self.outputs {
            self.output_shape(output.node, output.index)?;
        }
        self.topological_order().map(|_| ())
    }

    fn check_edge(&self, edge: &Edge) -> Result<(), GraphError> {
        let produced = self.output_shape(edge.source, edge.source_index)?;
        let expected = self.input_shape(edge.sink, edge.sink_index)?;
        if produced != expected {
            return Err(GraphError::ShapeMismatch {
                edge: *edge,
                produced: produced.clone(),
                expected: expected.clone(),
            });
        }
        Ok(())
    }

    pub fn output_shape(&self, id: NodeId, index: usize) -> Result<&Shape, GraphError> {
        wire_shape(id, &self.node(id)?.output_shapes, Side::Output, index)
    }

    pub fn input_shape(&self, id: NodeId, index: usize) -> Result<&Shape, GraphError> {
        wire_shape(id, &self.node(id)?.input_shapes, Side::Input, index)
    }

    /// Whether `to` can be reached from `from` following edges
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.edges.iter().filter(|e| e.source == id).map(|e| e.sink));
            }
        }
        false
    }
}

fn wire_shape(
    node: NodeId,
    shapes: &[Shape],
    side: Side,
    index: usize,
) -> Result<&Shape, GraphError> {
    shapes.get(index).ok_or(GraphError::IndexMismatch {
        node,
        side,
        index,
        available: shapes.len(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn unary(name: &str, op: OpType, shape: &[usize]) -> Node {
        Node::new(name, op, vec![shape.to_vec()], vec![shape.to_vec()])
    }

    /// input -> a -> b, with b as graph output
    fn chain() -> (Graph, [NodeId; 3]) {
        let mut g = Graph::new();
        let shape = [1, 4];
        let input = g.add_node(Node::new("in", OpType::Input, vec![], vec![shape.to_vec()]));
        let a = g.add_node(unary("a", OpType::Identity, &shape));
        let b = g.add_node(unary("b", OpType::Activation, &shape));
        g.add_edge(Edge::single(input, a)).unwrap();
        g.add_edge(Edge::single(a, b)).unwrap();
        g.add_output(b, 0).unwrap();
        (g, [input, a, b])
    }

    #[test]
    fn test_add_edge_checks() {
        let (mut g, [input, a, b]) = chain();
        assert!(matches!(
            g.add_edge(Edge::single(input, a)),
            Err(GraphError::DuplicateInput { index: 0, .. })
        ));
        assert!(matches!(
            g.add_edge(Edge::new(a, 1, b, 0)),
            Err(GraphError::IndexMismatch {
                side: Side::Output,
                index: 1,
                available: 1,
                ..
            })
        ));
        let c = g.add_node(unary("c", OpType::Add, &[1, 8]));
        assert!(matches!(
            g.add_edge(Edge::single(b, c)),
            Err(GraphError::ShapeMismatch { .. })
        ));
        let add = g.add_node(Node::new("add", OpType::Add, vec![vec![1, 4]; 2], vec![vec![
            1, 4,
        ]]));
        g.add_edge(Edge::new(b, 0, add, 0)).unwrap();
        // add -> a would close add -> a -> b -> add
        let mut bad = g.clone();
        bad.remove_edge(&Edge::single(input, a));
        assert!(matches!(
            bad.add_edge(Edge::single(add, a)),
            Err(GraphError::CycleCreated(_))
        ));
        assert!(matches!(
            g.add_edge(Edge::single(add, 99)),
            Err(GraphError::UnknownNode(99))
        ));
    }

    #[test]
    fn test_topological_order_is_deterministic() {
        let mut g = Graph::new();
        let shape = vec![2];
        let input = g.add_node(Node::new("in", OpType::Input, vec![], vec![shape.clone()]));
        let right = g.add_node(unary("right", OpType::Identity, &shape));
        let left = g.add_node(unary("left", OpType::Identity, &shape));
        let add = g.add_node(Node::new("add", OpType::Add, vec![shape.clone(); 2], vec![
            shape.clone(),
        ]));
        g.add_edge(Edge::single(input, left)).unwrap();
        g.add_edge(Edge::single(input, right)).unwrap();
        g.add_edge(Edge::new(left, 0, add, 0)).unwrap();
        g.add_edge(Edge::new(right, 0, add, 1)).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec![input, right, left, add]);
        assert_eq!(g.get_prev_nodes(add).unwrap(), vec![left, right]);
        assert_eq!(g.get_next_nodes(input).unwrap(), vec![right, left]);
    }

    #[test]
    fn test_replace_node_keeps_indices() {
        let (mut g, [input, a, b]) = chain();
        let new_id = g
            .replace_node(b, unary("b2", OpType::Identity, &[1, 4]), true)
            .unwrap();
        assert!(!g.contains(b));
        assert_eq!(g.in_edges(new_id).unwrap(), vec![Edge::single(a, new_id)]);
        assert_eq!(g.outputs(), &[OutputRef::new(new_id, 0)]);
        g.validate().unwrap();

        // a replacement which cannot take the wire fails and leaves the graph as is
        let before = g.edges().copied().collect_vec();
        let err = g
            .replace_node(a, unary("wide", OpType::Identity, &[1, 8]), true)
            .unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
        assert_eq!(g.edges().copied().collect_vec(), before);
        assert!(g.contains(a));

        let err = g
            .replace_node(a, Node::new("none", OpType::Identity, vec![], vec![]), true)
            .unwrap_err();
        assert!(matches!(err, GraphError::IndexMismatch { .. }));

        let err = g
            .replace_node(input, unary("x", OpType::Input, &[1, 4]), false)
            .unwrap_err();
        assert!(matches!(err, GraphError::DanglingEdge { edges: 1, .. }));
    }

    #[test]
    fn test_remove_node_splices() {
        let (mut g, [input, a, b]) = chain();
        let removed = g.remove_node(a, true).unwrap();
        assert_eq!(removed.name, "a");
        assert_eq!(g.in_edges(b).unwrap(), vec![Edge::single(input, b)]);
        g.validate().unwrap();

        // the output node gets spliced onto its producer
        g.remove_node(b, true).unwrap();
        assert_eq!(g.outputs(), &[OutputRef::new(input, 0)]);
        assert!(matches!(
            g.remove_node(input, true),
            Err(GraphError::NotSpliceable { .. })
        ));
        assert!(matches!(
            g.remove_node(input, false),
            Err(GraphError::DanglingEdge { edges: 1, .. })
        ));
    }

    #[test]
    fn test_deserialized_graph_never_reuses_ids() {
        let (g, [input, a, b]) = chain();
        let mut json = serde_json::to_value(&g).unwrap();
        assert!(json.get("next_id").is_none());
        // a stale counter written by hand is ignored
        json["next_id"] = 0.into();
        let mut reloaded: Graph = serde_json::from_value(json).unwrap();
        reloaded.validate().unwrap();

        let c = reloaded.add_node(unary("c", OpType::Identity, &[1, 4]));
        assert!(![input, a, b].contains(&c));
        assert_eq!(reloaded.node(input).unwrap().op, OpType::Input);
        assert_eq!(reloaded.len(), 4);
        let new_b = reloaded
            .replace_node(b, unary("b2", OpType::Activation, &[1, 4]), true)
            .unwrap();
        assert!(new_b > c);
        reloaded.validate().unwrap();
    }

    #[test]
    fn test_insert_node_after() {
        let (mut g, [_, a, b]) = chain();
        let mid = g
            .insert_node_after(a, 0, unary("mid", OpType::Activation, &[1, 4]))
            .unwrap();
        assert_eq!(g.get_next_nodes(a).unwrap(), vec![mid]);
        assert_eq!(g.get_next_nodes(mid).unwrap(), vec![b]);
        let tail = g
            .insert_node_after(b, 0, unary("tail", OpType::Identity, &[1, 4]))
            .unwrap();
        assert_eq!(g.outputs(), &[OutputRef::new(tail, 0)]);
        assert!(matches!(
            g.insert_node_after(b, 0, unary("bad", OpType::Identity, &[4])),
            Err(GraphError::ShapeMismatch { .. })
        ));
        g.validate().unwrap();
    }
}
