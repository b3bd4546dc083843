use tracing::debug;

use super::{Substitution, SubstitutionError};
use crate::{
    graph::{Graph, NodeId, OpType},
    matchers::{NodeMatcher, NodeOperationMatcher},
};

/// Splices `Identity` nodes out of the graph, reconnecting their consumers to their producer.
#[derive(Debug)]
pub struct RemoveIdentity {
    matcher: NodeOperationMatcher,
}

impl Default for RemoveIdentity {
    fn default() -> Self {
        Self {
            matcher: NodeOperationMatcher::new(OpType::Identity),
        }
    }
}

impl Substitution for RemoveIdentity {
    fn name(&self) -> &str {
        "remove_identity"
    }

    fn matcher(&self) -> &dyn NodeMatcher {
        &self.matcher
    }

    fn substitute(&self, graph: &mut Graph, id: NodeId) -> Result<bool, SubstitutionError> {
        let node = graph.node(id)?;
        let pass_through = matches!(
            (node.input_shapes.as_slice(), node.output_shapes.as_slice()),
            ([input], [output]) if input == output
        );
        if !pass_through || graph.in_edges(id)?.len() != 1 {
            return Ok(false);
        }
        debug!(node = id, "removing identity");
        graph.remove_node(id, true)?;
        Ok(true)
    }
}
