//! Model compression core.
//!
//! A model is held as a [`Graph`] of typed nodes. Before quantization it is rewritten by a
//! [`SubstitutionPipeline`]: batch-norm folding, identity removal, quantization candidates
//! and, for quantization aware training, splitting kernels from their activations. Trainable
//! quantizers are then built per node from the selected candidates, see [`qat`].
//! [`data_generation`] synthesizes calibration images from the batch-norm statistics of a
//! frozen model.

pub mod data_generation;
pub mod error;
pub mod graph;
pub mod matchers;
pub mod qat;
pub mod quantization;
pub mod substitutions;
pub mod testing;

pub use error::{ConfigError, MctError};
pub use graph::{Edge, Graph, GraphError, Node, NodeId, OpType};
pub use substitutions::{PipelineMode, PipelineReport, Substitution, SubstitutionPipeline};
