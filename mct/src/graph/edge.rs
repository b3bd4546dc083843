use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::NodeId;

/// Represents a link between the output wire `source_index` of `source` and the input wire
/// `sink_index` of `sink`.
///
/// An output wire used by several nodes is represented by several edges sharing the same
/// `(source, source_index)` pair. An input wire has at most one producing edge.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display("{source}:{source_index} -> {sink}:{sink_index}")]
pub struct Edge {
    pub source: NodeId,
    pub source_index: usize,
    pub sink: NodeId,
    pub sink_index: usize,
}

impl Edge {
    pub fn new(source: NodeId, source_index: usize, sink: NodeId, sink_index: usize) -> Self {
        Self {
            source,
            source_index,
            sink,
            sink_index,
        }
    }

    /// Edge between the first output of `source` and the first input of `sink`
    pub fn single(source: NodeId, sink: NodeId) -> Self {
        Self::new(source, 0, sink, 0)
    }

    pub(crate) fn with_source(self, source: NodeId, source_index: usize) -> Self {
        Self {
            source,
            source_index,
            ..self
        }
    }

    pub(crate) fn with_sink(self, sink: NodeId) -> Self {
        Self { sink, ..self }
    }
}

/// An output wire of a node which is also an output of the whole graph
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display("{node}:{index}")]
pub struct OutputRef {
    pub node: NodeId,
    pub index: usize,
}

impl OutputRef {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

/// Which side of a node a wire index refers to
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Side {
    #[display("input")]
    Input,
    #[display("output")]
    Output,
}
