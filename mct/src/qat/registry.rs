use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{
    config::TrainableQuantizerConfig,
    quantizers::{LsqQuantizer, SteQuantizer, TrainableQuantizer},
    QuantizationTarget, QuantizerError, TrainingMethod,
};
use crate::quantization::QuantizationMethod;

/// Builds a quantizer from its config and the user's parameter overrides
pub type QuantizerConstructor = fn(
    TrainableQuantizerConfig,
    &BTreeMap<String, f64>,
) -> Result<Box<dyn TrainableQuantizer>, QuantizerError>;

/// Key under which a trainable quantizer implementation is registered
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display("({target}, {method}, {training})")]
pub struct QuantizerIdentifier {
    pub target: QuantizationTarget,
    pub method: QuantizationMethod,
    pub training: TrainingMethod,
}

impl QuantizerIdentifier {
    pub fn new(
        target: QuantizationTarget,
        method: QuantizationMethod,
        training: TrainingMethod,
    ) -> Self {
        Self {
            target,
            method,
            training,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QuantizerRegistry {
    constructors: BTreeMap<QuantizerIdentifier, QuantizerConstructor>,
}

impl QuantizerRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registers `constructor`, returning the one it replaces if any
    pub fn register(
        &mut self,
        id: QuantizerIdentifier,
        constructor: QuantizerConstructor,
    ) -> Option<QuantizerConstructor> {
        self.constructors.insert(id, constructor)
    }

    pub fn lookup(&self, id: QuantizerIdentifier) -> Result<QuantizerConstructor, QuantizerError> {
        self.constructors
            .get(&id)
            .copied()
            .ok_or(QuantizerError::Lookup {
                target: id.target,
                method: id.method,
                training: id.training,
            })
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &QuantizerIdentifier> {
        self.constructors.keys()
    }
}

impl Default for QuantizerRegistry {
    /// STE for every method, LSQ for symmetric and uniform, on both targets
    fn default() -> Self {
        let mut registry = Self::empty();
        for target in [QuantizationTarget::Weights, QuantizationTarget::Activation] {
            for method in [
                QuantizationMethod::PowerOfTwo,
                QuantizationMethod::Symmetric,
                QuantizationMethod::Uniform,
            ] {
                registry.register(
                    QuantizerIdentifier::new(target, method, TrainingMethod::Ste),
                    SteQuantizer::boxed,
                );
            }
            for method in [QuantizationMethod::Symmetric, QuantizationMethod::Uniform] {
                registry.register(
                    QuantizerIdentifier::new(target, method, TrainingMethod::Lsq),
                    LsqQuantizer::boxed,
                );
            }
        }
        registry
    }
}
