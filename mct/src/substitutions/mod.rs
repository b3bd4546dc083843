//! Rule based graph rewrites.
//!
//! A [`Substitution`] pairs a [`NodeMatcher`] with a rewrite. Rewrites must detect their own
//! output: once a node has been transformed the substitution either stops matching it or
//! returns `Ok(false)` for it, which is what makes [`SubstitutionPipeline::run`] terminate.

use std::fmt::Debug;

use crate::{
    graph::{Graph, GraphError, NodeId},
    matchers::NodeMatcher,
};

mod attach_config;
mod batchnorm_folding;
pub mod pipeline;
mod remove_identity;
mod weights_activation_split;

pub use attach_config::AttachQuantizationConfig;
pub use batchnorm_folding::BatchNormFolding;
pub use pipeline::{PipelineMode, PipelineReport, StepReport, SubstitutionPipeline};
pub use remove_identity::RemoveIdentity;
pub use weights_activation_split::WeightsActivationSplit;

pub trait Substitution: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Nodes this substitution is offered
    fn matcher(&self) -> &dyn NodeMatcher;

    /// Rewrites the graph around `node`, returning whether anything changed.
    fn substitute(&self, graph: &mut Graph, node: NodeId) -> Result<bool, SubstitutionError>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SubstitutionError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("{substitution}: node {node} has no attribute {attribute}")]
    MissingAttribute {
        substitution: String,
        node: String,
        attribute: String,
    },
    #[error("{substitution}: node {node} has no weight {weight}")]
    MissingWeight {
        substitution: String,
        node: String,
        weight: String,
    },
    #[error("{substitution}: invalid weights on node {node}: {reason}")]
    InvalidWeights {
        substitution: String,
        node: String,
        reason: String,
    },
}
