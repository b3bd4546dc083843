use tracing::debug;

use super::{Substitution, SubstitutionError};
use crate::{
    graph::{
        AttrValue, Graph, Node, NodeId, OpType, SplitRole, ACTIVATION_ATTR, IDENTITY_ACTIVATION,
    },
    matchers::{NodeMatcher, NodeOperationMatcher},
};

const NAME: &str = "weights_activation_split";

/// Splits a kernel op with a fused activation into a weights-only node followed by a
/// dedicated activation node, so that each can be quantized on its own.
///
/// The weights node keeps the name, shapes, weights and attributes of the original node,
/// except for the activation which becomes the identity. The activation node carries the
/// original activation and takes over every consumer and graph output.
#[derive(Debug)]
pub struct WeightsActivationSplit {
    matcher: NodeOperationMatcher,
}

impl Default for WeightsActivationSplit {
    fn default() -> Self {
        Self {
            matcher: NodeOperationMatcher::any_of([
                OpType::Conv2d,
                OpType::ConvTranspose2d,
                OpType::Dense,
            ]),
        }
    }
}

impl Substitution for WeightsActivationSplit {
    fn name(&self) -> &str {
        NAME
    }

    fn matcher(&self) -> &dyn NodeMatcher {
        &self.matcher
    }

    fn substitute(&self, graph: &mut Graph, id: NodeId) -> Result<bool, SubstitutionError> {
        let node = graph.node(id)?;
        let activation = node
            .attribute(ACTIVATION_ATTR)
            .ok_or_else(|| SubstitutionError::MissingAttribute {
                substitution: NAME.to_string(),
                node: node.name.clone(),
                attribute: ACTIVATION_ATTR.to_string(),
            })?
            .clone();
        if activation == AttrValue::from(IDENTITY_ACTIVATION) {
            return Ok(false);
        }
        let shape = graph.output_shape(id, 0)?.clone();

        let mut weights = node.clone();
        weights
            .attributes
            .insert(ACTIVATION_ATTR.to_string(), IDENTITY_ACTIVATION.into());
        weights.split_role = Some(SplitRole::Weights);

        let mut act = Node::new(
            format!("{}_activation", node.name),
            OpType::Activation,
            vec![shape.clone()],
            vec![shape],
        )
        .with_attribute(ACTIVATION_ATTR, activation);
        act.split_role = Some(SplitRole::Activation);

        if !node.candidates().is_empty() {
            weights.candidates = node
                .candidates()
                .iter()
                .map(|c| c.clone().with_activation_disabled())
                .collect();
            act.candidates = node
                .candidates()
                .iter()
                .map(|c| c.clone().with_weights_disabled())
                .collect();
            act.final_candidate = node.final_candidate;
        }

        debug!(node = id, name = %node.name, "splitting activation out of kernel op");
        let weights_id = graph.replace_node(id, weights, true)?;
        graph.insert_node_after(weights_id, 0, act)?;
        Ok(true)
    }
}
