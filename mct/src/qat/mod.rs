//! Trainable quantizers for quantization aware training.
//!
//! [`build_node_quantizers`] turns the final quantization candidate of a node into one weights
//! quantizer per kernel attribute and one activation quantizer per output. With the default
//! [`ActivationReplication::Shared`] all the activation slots of a node point to the *same*
//! quantizer, so updating the state through one slot is visible through every other one.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use tracing::debug;

use crate::{
    graph::{Graph, Node, NodeId},
    quantization::QuantizationMethod,
};

mod config;
mod quantizers;
mod registry;

pub use config::{
    ActivationReplication, QatConfig, QuantizationTarget, TrainableQuantizerConfig,
    TrainingMethod,
};
pub use quantizers::{LsqQuantizer, SteQuantizer, TrainableQuantizer};
pub use registry::{QuantizerConstructor, QuantizerIdentifier, QuantizerRegistry};

pub type SharedQuantizer = Arc<RwLock<Box<dyn TrainableQuantizer>>>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QuantizerError {
    #[error("no trainable quantizer registered for target {target}, method {method}, training {training}")]
    Lookup {
        target: QuantizationTarget,
        method: QuantizationMethod,
        training: TrainingMethod,
    },
    #[error("node {node} has no final quantization candidate")]
    NoFinalCandidate { node: String },
    #[error("quantizer {quantizer} has no parameter {key}")]
    UnknownParameter {
        quantizer: QuantizerIdentifier,
        key: String,
    },
    #[error("invalid parameter {key} for quantizer {quantizer}: {reason}")]
    InvalidParameter {
        quantizer: QuantizerIdentifier,
        key: String,
        reason: String,
    },
}

/// Quantizers of one node
#[derive(Clone, Debug, Default)]
pub struct NodeQuantizers {
    /// Weight attribute name to its quantizer
    pub weights: BTreeMap<String, SharedQuantizer>,
    /// One entry per node output
    pub activations: Vec<SharedQuantizer>,
}

impl NodeQuantizers {
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty() && self.activations.is_empty()
    }
}

fn share(quantizer: Box<dyn TrainableQuantizer>) -> SharedQuantizer {
    Arc::new(RwLock::new(quantizer))
}

pub fn build_node_quantizers(
    node: &Node,
    qat_config: &QatConfig,
    registry: &QuantizerRegistry,
) -> Result<NodeQuantizers, QuantizerError> {
    let candidate = node
        .final_candidate()
        .ok_or_else(|| QuantizerError::NoFinalCandidate {
            node: node.name.clone(),
        })?;
    // the bit-widths the node may still switch between, only known for mixed precision nodes
    let (weights_bits, activation_bits): (Vec<u8>, Vec<u8>) = if node.candidates().len() > 1 {
        (
            node.candidates().iter().map(|c| c.weights_n_bits).collect(),
            node.candidates().iter().map(|c| c.activation_n_bits).collect(),
        )
    } else {
        (Vec::new(), Vec::new())
    };

    let mut quantizers = NodeQuantizers::default();
    if node.is_weights_quantization_enabled() {
        let target = QuantizationTarget::Weights;
        let constructor = registry.lookup(QuantizerIdentifier::new(
            target,
            candidate.weights_quantization_method,
            qat_config.training_method(target),
        ))?;
        for attr in node.op.kernel_attributes() {
            let config = TrainableQuantizerConfig::weights(candidate, weights_bits.clone());
            let mut quantizer = constructor(config, qat_config.params_override(target))?;
            if let Some(weight) = node.weight(attr) {
                quantizer.initialize(weight.data(), weight.shape());
            }
            debug!(node = %node.name, attr, quantizer = %quantizer.identifier(), "weights quantizer");
            quantizers.weights.insert(attr.to_string(), share(quantizer));
        }
    }

    if node.is_activation_quantization_enabled() {
        let target = QuantizationTarget::Activation;
        let constructor = registry.lookup(QuantizerIdentifier::new(
            target,
            candidate.activation_quantization_method,
            qat_config.training_method(target),
        ))?;
        let outputs = node.output_shapes.len();
        let build = || {
            constructor(
                TrainableQuantizerConfig::activation(candidate, activation_bits.clone()),
                qat_config.params_override(target),
            )
            .map(share)
        };
        quantizers.activations = match qat_config.activation_replication {
            ActivationReplication::Shared => vec![build()?; outputs],
            ActivationReplication::Independent => {
                (0..outputs).map(|_| build()).collect::<Result<_, _>>()?
            }
        };
        debug!(node = %node.name, outputs, replication = %qat_config.activation_replication, "activation quantizers");
    }
    Ok(quantizers)
}

/// Quantizers of every node with quantization enabled
pub fn build_graph_quantizers(
    graph: &Graph,
    qat_config: &QatConfig,
    registry: &QuantizerRegistry,
) -> Result<BTreeMap<NodeId, NodeQuantizers>, QuantizerError> {
    let mut all = BTreeMap::new();
    for (id, node) in graph.nodes() {
        let quantizers = build_node_quantizers(node, qat_config, registry)?;
        if !quantizers.is_empty() {
            all.insert(id, quantizers);
        }
    }
    Ok(all)
}
