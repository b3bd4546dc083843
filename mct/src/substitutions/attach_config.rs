use tracing::debug;

use super::{Substitution, SubstitutionError};
use crate::{
    graph::{Graph, Node, NodeId, SplitRole},
    matchers::{not, HasQuantizationCandidates, NodeMatcher, Not},
    quantization::{QuantizationConfigCandidate, QuantizationConfigOptions},
};

/// Gives every node without candidates its own copy of the configured candidate list.
///
/// Weights quantization stays enabled only on kernel ops that are not the activation half of
/// a split. Activation quantization is turned off for shape ops and for the weights half of
/// a split, whose output feeds the activation node directly.
#[derive(Debug)]
pub struct AttachQuantizationConfig {
    options: QuantizationConfigOptions,
    matcher: Not<HasQuantizationCandidates>,
}

impl AttachQuantizationConfig {
    pub fn new(options: QuantizationConfigOptions) -> Self {
        Self {
            options,
            matcher: not(HasQuantizationCandidates),
        }
    }

    fn adjust(node: &Node, candidate: &QuantizationConfigCandidate) -> QuantizationConfigCandidate {
        let mut candidate = candidate.clone();
        if !node.op.is_kernel_op() || node.split_role() == Some(SplitRole::Activation) {
            candidate = candidate.with_weights_disabled();
        }
        if node.op.is_shape_op() || node.split_role() == Some(SplitRole::Weights) {
            candidate = candidate.with_activation_disabled();
        }
        candidate
    }
}

impl Default for AttachQuantizationConfig {
    fn default() -> Self {
        Self::new(QuantizationConfigOptions::default())
    }
}

impl Substitution for AttachQuantizationConfig {
    fn name(&self) -> &str {
        "attach_quantization_config"
    }

    fn matcher(&self) -> &dyn NodeMatcher {
        &self.matcher
    }

    fn substitute(&self, graph: &mut Graph, id: NodeId) -> Result<bool, SubstitutionError> {
        // attaching nothing would leave the node matching forever
        if self.options.candidates().is_empty() {
            return Ok(false);
        }
        let node = graph.node_mut(id)?;
        let candidates = self
            .options
            .candidates()
            .iter()
            .map(|c| Self::adjust(node, c))
            .collect();
        node.set_candidates(candidates);
        debug!(node = id, name = %node.name, count = node.candidates().len(), "attached candidates");
        Ok(true)
    }
}
