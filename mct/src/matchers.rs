//! Node predicates used to select where a substitution applies.
//!
//! Matchers are pure: evaluating one never mutates it nor the node, so a single matcher can be
//! shared between substitutions and threads. They compose with [`and`], [`or`] and [`not`] (or
//! the [`MatcherExt`] methods), each returning a new matcher.

use std::{collections::BTreeSet, fmt::Debug, sync::Arc};

use crate::graph::{AttrValue, Graph, Node, NodeId, OpType};

pub trait NodeMatcher: Send + Sync + Debug {
    fn matches(&self, node: &Node) -> bool;
}

impl<M: NodeMatcher + ?Sized> NodeMatcher for Box<M> {
    fn matches(&self, node: &Node) -> bool {
        (**self).matches(node)
    }
}

impl<M: NodeMatcher + ?Sized> NodeMatcher for Arc<M> {
    fn matches(&self, node: &Node) -> bool {
        (**self).matches(node)
    }
}

impl<M: NodeMatcher + ?Sized> NodeMatcher for &M {
    fn matches(&self, node: &Node) -> bool {
        (**self).matches(node)
    }
}

#[derive(Clone, Debug)]
pub struct And<A, B>(A, B);

impl<A: NodeMatcher, B: NodeMatcher> NodeMatcher for And<A, B> {
    fn matches(&self, node: &Node) -> bool {
        self.0.matches(node) && self.1.matches(node)
    }
}

#[derive(Clone, Debug)]
pub struct Or<A, B>(A, B);

impl<A: NodeMatcher, B: NodeMatcher> NodeMatcher for Or<A, B> {
    fn matches(&self, node: &Node) -> bool {
        self.0.matches(node) || self.1.matches(node)
    }
}

#[derive(Clone, Debug)]
pub struct Not<A>(A);

impl<A: NodeMatcher> NodeMatcher for Not<A> {
    fn matches(&self, node: &Node) -> bool {
        !self.0.matches(node)
    }
}

pub fn and<A: NodeMatcher, B: NodeMatcher>(a: A, b: B) -> And<A, B> {
    And(a, b)
}

pub fn or<A: NodeMatcher, B: NodeMatcher>(a: A, b: B) -> Or<A, B> {
    Or(a, b)
}

pub fn not<A: NodeMatcher>(a: A) -> Not<A> {
    Not(a)
}

/// Method form of the combinators
pub trait MatcherExt: NodeMatcher + Sized {
    fn and<B: NodeMatcher>(self, other: B) -> And<Self, B> {
        and(self, other)
    }

    fn or<B: NodeMatcher>(self, other: B) -> Or<Self, B> {
        or(self, other)
    }

    fn negate(self) -> Not<Self> {
        not(self)
    }
}

impl<M: NodeMatcher> MatcherExt for M {}

/// Matches nodes whose operation is one of the given set
#[derive(Clone, Debug)]
pub struct NodeOperationMatcher {
    ops: BTreeSet<OpType>,
}

impl NodeOperationMatcher {
    pub fn new(op: OpType) -> Self {
        Self::any_of([op])
    }

    pub fn any_of<I: IntoIterator<Item = OpType>>(ops: I) -> Self {
        Self {
            ops: ops.into_iter().collect(),
        }
    }
}

impl NodeMatcher for NodeOperationMatcher {
    fn matches(&self, node: &Node) -> bool {
        self.ops.contains(&node.op)
    }
}

/// Matches nodes carrying `key` with exactly `value`
#[derive(Clone, Debug)]
pub struct NodeAttributeMatcher {
    key: String,
    value: AttrValue,
}

impl NodeAttributeMatcher {
    pub fn new<K: Into<String>, V: Into<AttrValue>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl NodeMatcher for NodeAttributeMatcher {
    fn matches(&self, node: &Node) -> bool {
        node.attribute(&self.key) == Some(&self.value)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AnyNode;

impl NodeMatcher for AnyNode {
    fn matches(&self, _node: &Node) -> bool {
        true
    }
}

/// Matches nodes which already received their quantization candidates
#[derive(Clone, Copy, Debug, Default)]
pub struct HasQuantizationCandidates;

impl NodeMatcher for HasQuantizationCandidates {
    fn matches(&self, node: &Node) -> bool {
        !node.candidates().is_empty()
    }
}

/// Matches a linear chain of nodes, one matcher per link. Every node after the first must
/// be the only consumer of its predecessor, and take it as its only input.
#[derive(Debug)]
pub struct WalkMatcher {
    links: Vec<Box<dyn NodeMatcher>>,
}

impl WalkMatcher {
    pub fn new(links: Vec<Box<dyn NodeMatcher>>) -> Self {
        Self { links }
    }

    /// Returns the ids of the chain starting at `start`, if it matches.
    pub fn match_from(&self, graph: &Graph, start: NodeId) -> Option<Vec<NodeId>> {
        let (first, rest) = self.links.split_first()?;
        if !first.matches(graph.node(start).ok()?) {
            return None;
        }
        let mut chain = vec![start];
        let mut current = start;
        for link in rest {
            let out = graph.out_edges(current).ok()?;
            let [edge] = out.as_slice() else {
                return None;
            };
            if graph.outputs().iter().any(|o| o.node == current) {
                return None;
            }
            let next = graph.node(edge.sink).ok()?;
            if next.input_shapes.len() != 1 || !link.matches(next) {
                return None;
            }
            chain.push(edge.sink);
            current = edge.sink;
        }
        Some(chain)
    }
}

impl NodeMatcher for WalkMatcher {
    /// Only the head of the walk can be checked on a single node
    fn matches(&self, node: &Node) -> bool {
        self.links.first().is_some_and(|m| m.matches(node))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;
    use crate::graph::{Edge, ACTIVATION_ATTR};

    fn node(op: OpType, activation: &str) -> Node {
        Node::new("n", op, vec![vec![1, 2]], vec![vec![1, 2]])
            .with_attribute(ACTIVATION_ATTR, activation)
    }

    #[rstest]
    #[case(OpType::Conv2d, "relu")]
    #[case(OpType::Dense, "linear")]
    #[case(OpType::Activation, "relu")]
    #[case(OpType::BatchNorm, "linear")]
    fn test_matcher_algebra(#[case] op: OpType, #[case] activation: &str) {
        let n = node(op, activation);
        let m1 = NodeOperationMatcher::any_of([OpType::Conv2d, OpType::Dense]);
        let m2 = NodeAttributeMatcher::new(ACTIVATION_ATTR, "relu");
        let (r1, r2) = (m1.matches(&n), m2.matches(&n));
        assert_eq!(or(&m1, &m2).matches(&n), r1 || r2);
        assert_eq!(and(&m1, &m2).matches(&n), r1 && r2);
        assert_eq!(not(&m1).matches(&n), !r1);
        assert_eq!(m1.clone().negate().negate().matches(&n), r1);
        assert_eq!(m1.clone().and(m2.clone()).matches(&n), r1 && r2);
        assert_eq!(m1.or(m2).matches(&n), r1 || r2);
        assert!(AnyNode.matches(&n));
    }

    #[test]
    fn test_matchers_are_shareable() {
        let m: Arc<dyn NodeMatcher> = Arc::new(not(NodeOperationMatcher::new(OpType::Identity)));
        let handles = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || m.matches(&node(OpType::Dense, "relu")))
            })
            .collect::<Vec<_>>();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn test_walk_matcher() {
        let mut g = Graph::new();
        let shape = vec![1, 2];
        let conv = g.add_node(node(OpType::Conv2d, "linear"));
        let bn = g.add_node(node(OpType::BatchNorm, "linear"));
        let act = g.add_node(node(OpType::Activation, "relu"));
        g.add_edge(Edge::single(conv, bn)).unwrap();
        g.add_edge(Edge::single(bn, act)).unwrap();
        let walk = WalkMatcher::new(vec![
            Box::new(NodeOperationMatcher::new(OpType::Conv2d)),
            Box::new(NodeOperationMatcher::new(OpType::BatchNorm)),
        ]);
        assert_eq!(walk.match_from(&g, conv), Some(vec![conv, bn]));
        assert_eq!(walk.match_from(&g, bn), None);

        // a second consumer of the conv breaks the chain
        let other = g.add_node(Node::new("o", OpType::Identity, vec![shape.clone()], vec![
            shape,
        ]));
        g.add_edge(Edge::single(conv, other)).unwrap();
        assert_eq!(walk.match_from(&g, conv), None);
    }
}
