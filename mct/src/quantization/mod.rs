//! Quantization configuration candidates attached to graph nodes, and the fake quantization
//! arithmetic they describe.

mod candidate;
pub mod fake_quant;

pub use candidate::{
    select_highest_bit_width, QuantizationConfigCandidate, QuantizationConfigOptions,
    QuantizationMethod,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QuantizationError {
    #[error("quantization config options need at least one candidate")]
    EmptyOptions,
    #[error("node {node} has no quantization candidates")]
    NoCandidates { node: String },
    #[error("candidate {index} out of range for node {node} ({len} candidates)")]
    CandidateOutOfRange {
        node: String,
        index: usize,
        len: usize,
    },
}
