//! Error types shared across modules, and [`MctError`] for callers who want a single type.

use crate::{
    data_generation::DataGenError, graph::GraphError, qat::QuantizerError,
    quantization::QuantizationError, substitutions::SubstitutionError,
};

/// Invalid configuration. Always raised while setting up, before any work starts.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {kind}, expected one of {expected:?}")]
    InvalidEnumValue {
        kind: &'static str,
        value: String,
        expected: &'static [&'static str],
    },
    #[error("normalization std is zero for channel {channel}")]
    ZeroNormalizationStd { channel: usize },
    #[error("normalization mean has {mean} values but std has {std}")]
    NormalizationLengthMismatch { mean: usize, std: usize },
    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum MctError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Substitution(#[from] SubstitutionError),
    #[error(transparent)]
    Quantization(#[from] QuantizationError),
    #[error(transparent)]
    Quantizer(#[from] QuantizerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DataGeneration(#[from] DataGenError),
}
