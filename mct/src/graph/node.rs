use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::GraphError;
use crate::quantization::{QuantizationConfigCandidate, QuantizationError};

/// Identifier of a node inside a [`super::Graph`]. Ids are never reused.
pub type NodeId = usize;
pub type Shape = Vec<usize>;

/// Name of the attribute carrying the fused activation of kernel ops
pub const ACTIVATION_ATTR: &str = "activation";
/// Activation value meaning "no activation"
pub const IDENTITY_ACTIVATION: &str = "linear";
pub const KERNEL: &str = "kernel";
pub const BIAS: &str = "bias";
pub const GAMMA: &str = "gamma";
pub const BETA: &str = "beta";
pub const MOVING_MEAN: &str = "moving_mean";
pub const MOVING_VARIANCE: &str = "moving_variance";
pub const EPSILON: &str = "epsilon";

/// The operation performed by a node, independent of the framework it was imported from.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    #[display("input")]
    Input,
    #[display("conv2d")]
    Conv2d,
    #[display("conv_transpose2d")]
    ConvTranspose2d,
    #[display("dense")]
    Dense,
    #[display("batch_norm")]
    BatchNorm,
    #[display("activation")]
    Activation,
    #[display("identity")]
    Identity,
    #[display("add")]
    Add,
    #[display("reshape")]
    Reshape,
    #[display("flatten")]
    Flatten,
    #[display("max_pool2d")]
    MaxPool2d,
}

impl OpType {
    /// Names of the weight attributes that get a weights quantizer.
    pub fn kernel_attributes(&self) -> &'static [&'static str] {
        match self {
            OpType::Conv2d | OpType::ConvTranspose2d | OpType::Dense => &[KERNEL],
            _ => &[],
        }
    }

    pub fn is_kernel_op(&self) -> bool {
        !self.kernel_attributes().is_empty()
    }

    /// Ops that only move data around; their outputs are never quantized.
    pub fn is_shape_op(&self) -> bool {
        matches!(self, OpType::Reshape | OpType::Flatten)
    }
}

/// Op specific parameter, e.g. strides, padding or the fused activation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

/// A constant tensor attached to a node (kernel, bias, batch-norm statistics...).
/// Kernels are stored output channel first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightTensor {
    shape: Shape,
    data: Vec<f32>,
}

impl WeightTensor {
    pub fn new(shape: Shape, data: Vec<f32>) -> Result<Self, GraphError> {
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(GraphError::InvalidWeight {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

/// Marks the nodes produced by splitting a kernel op from its activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitRole {
    /// Carries the kernel; its output is not activation-quantized.
    Weights,
    /// Carries the activation; it has no weights to quantize.
    Activation,
}

/// Represents a layer of the model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: OpType,
    pub attributes: BTreeMap<String, AttrValue>,
    pub input_shapes: Vec<Shape>,
    pub output_shapes: Vec<Shape>,
    pub weights: BTreeMap<String, WeightTensor>,
    pub(crate) split_role: Option<SplitRole>,
    pub(crate) candidates: Vec<QuantizationConfigCandidate>,
    pub(crate) final_candidate: Option<usize>,
}

impl Node {
    pub fn new<S: Into<String>>(
        name: S,
        op: OpType,
        input_shapes: Vec<Shape>,
        output_shapes: Vec<Shape>,
    ) -> Self {
        Self {
            name: name.into(),
            op,
            attributes: BTreeMap::new(),
            input_shapes,
            output_shapes,
            weights: BTreeMap::new(),
            split_role: None,
            candidates: Vec::new(),
            final_candidate: None,
        }
    }

    pub fn with_attribute<K: Into<String>, V: Into<AttrValue>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_weight<K: Into<String>>(mut self, key: K, weight: WeightTensor) -> Self {
        self.weights.insert(key.into(), weight);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn weight(&self, key: &str) -> Option<&WeightTensor> {
        self.weights.get(key)
    }

    pub fn split_role(&self) -> Option<SplitRole> {
        self.split_role
    }

    pub fn candidates(&self) -> &[QuantizationConfigCandidate] {
        &self.candidates
    }

    /// Replaces the candidate list. Any previous final selection is dropped.
    pub fn set_candidates(&mut self, candidates: Vec<QuantizationConfigCandidate>) {
        self.candidates = candidates;
        self.final_candidate = None;
    }

    pub fn set_final_candidate(&mut self, index: usize) -> Result<(), QuantizationError> {
        if self.candidates.is_empty() {
            return Err(QuantizationError::NoCandidates {
                node: self.name.clone(),
            });
        }
        if index >= self.candidates.len() {
            return Err(QuantizationError::CandidateOutOfRange {
                node: self.name.clone(),
                index,
                len: self.candidates.len(),
            });
        }
        self.final_candidate = Some(index);
        Ok(())
    }

    pub fn final_candidate(&self) -> Option<&QuantizationConfigCandidate> {
        self.final_candidate.and_then(|i| self.candidates.get(i))
    }

    pub fn is_weights_quantization_enabled(&self) -> bool {
        self.final_candidate()
            .is_some_and(|c| c.enable_weights_quantization)
    }

    pub fn is_activation_quantization_enabled(&self) -> bool {
        self.final_candidate()
            .is_some_and(|c| c.enable_activation_quantization)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::quantization::QuantizationMethod;

    #[test]
    fn test_weight_tensor_shape_check() {
        assert!(WeightTensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            WeightTensor::new(vec![2, 3], vec![0.0; 5]),
            Err(GraphError::InvalidWeight { len: 5, .. })
        ));
    }

    #[test]
    fn test_final_candidate_selection() {
        let mut node = Node::new("conv", OpType::Conv2d, vec![vec![1, 3, 8, 8]], vec![vec![
            1, 4, 8, 8,
        ]]);
        assert!(node.set_final_candidate(0).is_err());
        let cand = QuantizationConfigCandidate::new(
            QuantizationMethod::Symmetric,
            QuantizationMethod::PowerOfTwo,
            8,
            8,
        );
        node.set_candidates(vec![cand.clone(), cand.with_activation_disabled()]);
        assert!(node.final_candidate().is_none());
        assert!(matches!(
            node.set_final_candidate(2),
            Err(QuantizationError::CandidateOutOfRange { index: 2, len: 2, .. })
        ));
        node.set_final_candidate(1).unwrap();
        assert!(node.is_weights_quantization_enabled());
        assert!(!node.is_activation_quantization_enabled());
    }
}
