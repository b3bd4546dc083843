use tracing::{debug, warn};

use super::{Substitution, SubstitutionError};
use crate::{
    graph::{
        AttrValue, Graph, Node, NodeId, OpType, WeightTensor, ACTIVATION_ATTR, BETA, BIAS, EPSILON,
        GAMMA, IDENTITY_ACTIVATION, KERNEL, MOVING_MEAN, MOVING_VARIANCE,
    },
    matchers::{NodeMatcher, NodeOperationMatcher, WalkMatcher},
};

const NAME: &str = "batchnorm_folding";
/// Keras' default batch-norm epsilon
const DEFAULT_EPSILON: f64 = 1e-3;

/// Folds a batch-norm that directly follows a linear kernel op into the kernel and bias:
///
/// `scale = gamma / sqrt(var + eps)`, `kernel[o] *= scale[o]`,
/// `bias[o] = beta[o] + (bias[o] - mean[o]) * scale[o]`.
#[derive(Debug)]
pub struct BatchNormFolding {
    walk: WalkMatcher,
}

impl Default for BatchNormFolding {
    fn default() -> Self {
        Self {
            walk: WalkMatcher::new(vec![
                Box::new(NodeOperationMatcher::any_of([OpType::Conv2d, OpType::Dense])),
                Box::new(NodeOperationMatcher::new(OpType::BatchNorm)),
            ]),
        }
    }
}

impl BatchNormFolding {
    fn weight<'a>(node: &'a Node, key: &str) -> Result<&'a WeightTensor, SubstitutionError> {
        node.weight(key).ok_or_else(|| SubstitutionError::MissingWeight {
            substitution: NAME.to_string(),
            node: node.name.clone(),
            weight: key.to_string(),
        })
    }

    fn invalid(node: &Node, reason: String) -> SubstitutionError {
        SubstitutionError::InvalidWeights {
            substitution: NAME.to_string(),
            node: node.name.clone(),
            reason,
        }
    }
}

impl Substitution for BatchNormFolding {
    fn name(&self) -> &str {
        NAME
    }

    fn matcher(&self) -> &dyn NodeMatcher {
        &self.walk
    }

    fn substitute(&self, graph: &mut Graph, id: NodeId) -> Result<bool, SubstitutionError> {
        let Some(chain) = self.walk.match_from(graph, id) else {
            return Ok(false);
        };
        let [kernel_id, bn_id] = chain[..] else {
            return Ok(false);
        };
        let kernel_node = graph.node(kernel_id)?;
        // a fused non linearity sits between the kernel and the batch-norm
        if kernel_node
            .attribute(ACTIVATION_ATTR)
            .is_some_and(|a| *a != AttrValue::from(IDENTITY_ACTIVATION))
        {
            return Ok(false);
        }
        let bn = graph.node(bn_id)?;
        let gamma = Self::weight(bn, GAMMA)?.data();
        let beta = Self::weight(bn, BETA)?.data();
        let mean = Self::weight(bn, MOVING_MEAN)?.data();
        let var = Self::weight(bn, MOVING_VARIANCE)?.data();
        let eps = bn
            .attribute(EPSILON)
            .and_then(AttrValue::as_f64)
            .unwrap_or(DEFAULT_EPSILON) as f32;
        let channels = gamma.len();
        if channels == 0 {
            return Err(Self::invalid(bn, "batch-norm has no channels".to_string()));
        }
        if [beta.len(), mean.len(), var.len()].iter().any(|l| *l != channels) {
            return Err(Self::invalid(
                bn,
                "batch-norm statistics have different lengths".to_string(),
            ));
        }

        let kernel = Self::weight(kernel_node, KERNEL)?;
        if kernel.data().is_empty() {
            return Err(Self::invalid(kernel_node, "kernel is empty".to_string()));
        }
        if kernel.shape().first() != Some(&channels) {
            return Err(Self::invalid(
                kernel_node,
                format!(
                    "kernel of shape {:?} does not have {channels} output channels",
                    kernel.shape()
                ),
            ));
        }
        let bias = match kernel_node.weight(BIAS) {
            Some(b) if b.data().len() == channels => b.data().to_vec(),
            Some(b) => {
                return Err(Self::invalid(
                    kernel_node,
                    format!("bias has {} values, expected {channels}", b.data().len()),
                ));
            }
            None => vec![0.0; channels],
        };

        let scale: Vec<f32> = gamma
            .iter()
            .zip(var)
            .map(|(g, v)| g / (v + eps).sqrt())
            .collect();
        if scale.iter().any(|s| !s.is_finite()) {
            warn!(node = %bn.name, "non finite batch-norm scale, folding anyway");
        }
        let mut folded_kernel = kernel.clone();
        let per_channel = folded_kernel.data().len() / channels;
        for (chunk, s) in folded_kernel
            .data_mut()
            .chunks_mut(per_channel)
            .zip(&scale)
        {
            chunk.iter_mut().for_each(|w| *w *= s);
        }
        let folded_bias = bias
            .iter()
            .zip(&scale)
            .zip(beta.iter().zip(mean))
            .map(|((b, s), (beta, mean))| beta + (b - mean) * s)
            .collect();

        debug!(kernel = kernel_id, bn = bn_id, "folding batch-norm into kernel");
        let kernel_node = graph.node_mut(kernel_id)?;
        kernel_node.weights.insert(KERNEL.to_string(), folded_kernel);
        kernel_node
            .weights
            .insert(BIAS.to_string(), WeightTensor::vector(folded_bias));
        graph.remove_node(bn_id, true)?;
        Ok(true)
    }
}
