use std::{collections::BTreeMap, path::Path};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    quantization::{QuantizationConfigCandidate, QuantizationMethod},
};

#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMethod {
    /// Straight-through estimator around a fixed range
    #[display("ste")]
    Ste,
    /// Learned step size
    #[display("lsq")]
    Lsq,
    /// Differentiable quantization; no built-in quantizer implements it yet
    #[display("dqa")]
    Dqa,
}

#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationTarget {
    #[display("weights")]
    Weights,
    #[display("activation")]
    Activation,
}

/// How the activation quantizer of a multi-output node is replicated over its outputs
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReplication {
    /// Every output slot holds the same quantizer instance
    #[default]
    #[display("shared")]
    Shared,
    /// One quantizer instance per output
    #[display("independent")]
    Independent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QatConfig {
    pub weight_training_method: TrainingMethod,
    pub activation_training_method: TrainingMethod,
    /// Extra constructor parameters handed to every weights quantizer
    pub weight_quantizer_params_override: BTreeMap<String, f64>,
    /// Extra constructor parameters handed to every activation quantizer
    pub activation_quantizer_params_override: BTreeMap<String, f64>,
    pub activation_replication: ActivationReplication,
}

impl Default for QatConfig {
    fn default() -> Self {
        Self {
            weight_training_method: TrainingMethod::Ste,
            activation_training_method: TrainingMethod::Ste,
            weight_quantizer_params_override: BTreeMap::new(),
            activation_quantizer_params_override: BTreeMap::new(),
            activation_replication: ActivationReplication::Shared,
        }
    }
}

impl QatConfig {
    pub fn with_training_methods(mut self, weights: TrainingMethod, activation: TrainingMethod) -> Self {
        self.weight_training_method = weights;
        self.activation_training_method = activation;
        self
    }

    pub fn with_weight_override<K: Into<String>>(mut self, key: K, value: f64) -> Self {
        self.weight_quantizer_params_override.insert(key.into(), value);
        self
    }

    pub fn with_activation_override<K: Into<String>>(mut self, key: K, value: f64) -> Self {
        self.activation_quantizer_params_override
            .insert(key.into(), value);
        self
    }

    pub fn with_activation_replication(mut self, replication: ActivationReplication) -> Self {
        self.activation_replication = replication;
        self
    }

    pub fn training_method(&self, target: QuantizationTarget) -> TrainingMethod {
        match target {
            QuantizationTarget::Weights => self.weight_training_method,
            QuantizationTarget::Activation => self.activation_training_method,
        }
    }

    pub fn params_override(&self, target: QuantizationTarget) -> &BTreeMap<String, f64> {
        match target {
            QuantizationTarget::Weights => &self.weight_quantizer_params_override,
            QuantizationTarget::Activation => &self.activation_quantizer_params_override,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

/// Everything a trainable quantizer needs to know about the tensor it quantizes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainableQuantizerConfig {
    pub target: QuantizationTarget,
    pub method: QuantizationMethod,
    pub n_bits: u8,
    /// One range per slice along `channel_axis` instead of one for the whole tensor
    pub per_channel: bool,
    pub channel_axis: Option<usize>,
    pub signed: bool,
    /// Bit-widths of all the node candidates, filled only when the node had several
    pub candidate_n_bits: Vec<u8>,
}

impl TrainableQuantizerConfig {
    /// Kernels are quantized per output channel, which is their leading axis
    pub fn weights(candidate: &QuantizationConfigCandidate, candidate_n_bits: Vec<u8>) -> Self {
        Self {
            target: QuantizationTarget::Weights,
            method: candidate.weights_quantization_method,
            n_bits: candidate.weights_n_bits,
            per_channel: true,
            channel_axis: Some(0),
            signed: true,
            candidate_n_bits,
        }
    }

    pub fn activation(candidate: &QuantizationConfigCandidate, candidate_n_bits: Vec<u8>) -> Self {
        Self {
            target: QuantizationTarget::Activation,
            method: candidate.activation_quantization_method,
            n_bits: candidate.activation_n_bits,
            per_channel: false,
            channel_axis: None,
            signed: true,
            candidate_n_bits,
        }
    }
}
