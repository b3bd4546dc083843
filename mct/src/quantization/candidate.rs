use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::QuantizationError;
use crate::graph::Graph;

#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMethod {
    /// Symmetric range whose threshold is constrained to a power of two
    #[display("power_of_two")]
    PowerOfTwo,
    /// Symmetric range with an arbitrary threshold
    #[display("symmetric")]
    Symmetric,
    /// Arbitrary `[min, max]` range
    #[display("uniform")]
    Uniform,
}

/// One admissible way of quantizing a node's weights and activations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfigCandidate {
    pub weights_quantization_method: QuantizationMethod,
    pub activation_quantization_method: QuantizationMethod,
    pub weights_n_bits: u8,
    pub activation_n_bits: u8,
    pub enable_weights_quantization: bool,
    pub enable_activation_quantization: bool,
}

impl QuantizationConfigCandidate {
    pub fn new(
        weights_quantization_method: QuantizationMethod,
        activation_quantization_method: QuantizationMethod,
        weights_n_bits: u8,
        activation_n_bits: u8,
    ) -> Self {
        Self {
            weights_quantization_method,
            activation_quantization_method,
            weights_n_bits,
            activation_n_bits,
            enable_weights_quantization: true,
            enable_activation_quantization: true,
        }
    }

    pub fn with_weights_disabled(mut self) -> Self {
        self.enable_weights_quantization = false;
        self
    }

    pub fn with_activation_disabled(mut self) -> Self {
        self.enable_activation_quantization = false;
        self
    }
}

/// The candidate list handed to every node when quantization configs get attached.
/// Never empty, whether built or deserialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "OptionsData")]
pub struct QuantizationConfigOptions {
    pub(crate) candidates: Vec<QuantizationConfigCandidate>,
}

#[derive(Deserialize)]
struct OptionsData {
    candidates: Vec<QuantizationConfigCandidate>,
}

impl TryFrom<OptionsData> for QuantizationConfigOptions {
    type Error = QuantizationError;

    fn try_from(data: OptionsData) -> Result<Self, Self::Error> {
        Self::new(data.candidates)
    }
}

impl QuantizationConfigOptions {
    pub fn new(candidates: Vec<QuantizationConfigCandidate>) -> Result<Self, QuantizationError> {
        if candidates.is_empty() {
            return Err(QuantizationError::EmptyOptions);
        }
        Ok(Self { candidates })
    }

    /// One candidate per weights bit-width, all sharing the same methods and activation
    /// bit-width. Used to feed a mixed precision search.
    pub fn mixed_precision(
        base: QuantizationConfigCandidate,
        weights_n_bits: &[u8],
    ) -> Result<Self, QuantizationError> {
        Self::new(
            weights_n_bits
                .iter()
                .map(|bits| QuantizationConfigCandidate {
                    weights_n_bits: *bits,
                    ..base.clone()
                })
                .collect(),
        )
    }

    pub fn candidates(&self) -> &[QuantizationConfigCandidate] {
        &self.candidates
    }
}

impl Default for QuantizationConfigOptions {
    fn default() -> Self {
        Self {
            candidates: vec![QuantizationConfigCandidate::new(
                QuantizationMethod::Symmetric,
                QuantizationMethod::PowerOfTwo,
                8,
                8,
            )],
        }
    }
}

/// Stand-in for the mixed precision search: every node keeps its widest candidate
/// (weights bit-width first, then activation bit-width; ties keep the first one).
pub fn select_highest_bit_width(graph: &mut Graph) -> Result<(), QuantizationError> {
    for (id, node) in graph.nodes_mut() {
        let best = node
            .candidates()
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, c)| (c.weights_n_bits, c.activation_n_bits))
            .map(|(i, _)| i)
            .ok_or_else(|| QuantizationError::NoCandidates {
                node: node.name.clone(),
            })?;
        debug!(node = id, name = %node.name, candidate = best, "selected final candidate");
        node.set_final_candidate(best)?;
    }
    Ok(())
}
