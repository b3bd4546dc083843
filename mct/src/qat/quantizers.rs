//! Built-in trainable quantizers.
//!
//! Both keep one quantization range per channel (a single one for per-tensor quantization)
//! and fake quantize with [`crate::quantization::fake_quant`]. Their trainable state is
//! exposed by name through [`TrainableQuantizer::parameters`] so a training loop living
//! outside this crate can update it.

use std::{collections::BTreeMap, fmt::Debug};

use super::{
    config::TrainableQuantizerConfig, registry::QuantizerIdentifier, QuantizerError,
    TrainingMethod,
};
use crate::quantization::{fake_quant, QuantizationMethod};

const DEFAULT_THRESHOLD: f32 = 8.0;

pub trait TrainableQuantizer: Debug + Send + Sync {
    fn identifier(&self) -> QuantizerIdentifier;

    fn config(&self) -> &TrainableQuantizerConfig;

    /// Recomputes the quantization ranges from observed values of shape `shape`.
    fn initialize(&mut self, values: &[f32], shape: &[usize]);

    fn quantize(&self, values: &[f32]) -> Vec<f32>;

    fn parameters(&self) -> BTreeMap<String, Vec<f32>>;

    fn set_parameter(&mut self, name: &str, values: Vec<f32>) -> Result<(), QuantizerError>;
}

/// Maps flat indices of a row-major tensor to the channel they belong to
#[derive(Clone, Copy, Debug, PartialEq)]
struct ChannelLayout {
    channels: usize,
    stride: usize,
}

impl ChannelLayout {
    const PER_TENSOR: Self = Self {
        channels: 1,
        stride: 1,
    };

    fn new(config: &TrainableQuantizerConfig, shape: &[usize]) -> Self {
        match config.channel_axis {
            Some(axis) if config.per_channel && axis < shape.len() => Self {
                channels: shape[axis].max(1),
                stride: shape[axis + 1..].iter().product::<usize>().max(1),
            },
            _ => Self::PER_TENSOR,
        }
    }

    fn channel(&self, index: usize) -> usize {
        (index / self.stride) % self.channels
    }

    /// Groups `values` by channel
    fn split(&self, values: &[f32]) -> Vec<Vec<f32>> {
        let mut out = vec![Vec::new(); self.channels];
        for (i, v) in values.iter().enumerate() {
            out[self.channel(i)].push(*v);
        }
        out
    }
}

fn identifier(config: &TrainableQuantizerConfig, training: TrainingMethod) -> QuantizerIdentifier {
    QuantizerIdentifier::new(config.target, config.method, training)
}

fn check_len(
    id: QuantizerIdentifier,
    name: &str,
    values: &[f32],
    channels: usize,
) -> Result<(), QuantizerError> {
    if values.len() != channels {
        return Err(QuantizerError::InvalidParameter {
            quantizer: id,
            key: name.to_string(),
            reason: format!("expected {channels} values, got {}", values.len()),
        });
    }
    Ok(())
}

fn check_positive(id: QuantizerIdentifier, name: &str, value: f64) -> Result<f32, QuantizerError> {
    if !(value > 0.0 && value.is_finite()) {
        return Err(QuantizerError::InvalidParameter {
            quantizer: id,
            key: name.to_string(),
            reason: format!("{value} is not a positive number"),
        });
    }
    Ok(value as f32)
}

fn unknown(id: QuantizerIdentifier, key: &str) -> QuantizerError {
    QuantizerError::UnknownParameter {
        quantizer: id,
        key: key.to_string(),
    }
}

/// Fixed range fake quantizer trained with a straight-through estimator
#[derive(Clone, Debug)]
pub struct SteQuantizer {
    config: TrainableQuantizerConfig,
    layout: ChannelLayout,
    /// `(-threshold, threshold)` for symmetric methods, `(min, max)` for uniform
    ranges: Vec<(f32, f32)>,
}

impl SteQuantizer {
    pub fn new(
        config: TrainableQuantizerConfig,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<Self, QuantizerError> {
        let id = identifier(&config, TrainingMethod::Ste);
        let mut range = (-DEFAULT_THRESHOLD, DEFAULT_THRESHOLD);
        for (key, value) in overrides {
            match (config.method, key.as_str()) {
                (QuantizationMethod::Uniform, "min") => range.0 = *value as f32,
                (QuantizationMethod::Uniform, "max") => range.1 = *value as f32,
                (QuantizationMethod::PowerOfTwo | QuantizationMethod::Symmetric, "threshold") => {
                    let t = check_positive(id, key, *value)?;
                    range = (-t, t);
                }
                _ => return Err(unknown(id, key)),
            }
        }
        if range.0 >= range.1 {
            return Err(QuantizerError::InvalidParameter {
                quantizer: id,
                key: "min".to_string(),
                reason: format!("min {} must be below max {}", range.0, range.1),
            });
        }
        Ok(Self {
            config,
            layout: ChannelLayout::PER_TENSOR,
            ranges: vec![range],
        })
    }

    pub fn boxed(
        config: TrainableQuantizerConfig,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<Box<dyn TrainableQuantizer>, QuantizerError> {
        Ok(Box::new(Self::new(config, overrides)?))
    }

    fn range(&self, channel: usize) -> (f32, f32) {
        self.ranges[channel.min(self.ranges.len() - 1)]
    }
}

impl TrainableQuantizer for SteQuantizer {
    fn identifier(&self) -> QuantizerIdentifier {
        identifier(&self.config, TrainingMethod::Ste)
    }

    fn config(&self) -> &TrainableQuantizerConfig {
        &self.config
    }

    fn initialize(&mut self, values: &[f32], shape: &[usize]) {
        self.layout = ChannelLayout::new(&self.config, shape);
        self.ranges = self
            .layout
            .split(values)
            .iter()
            .map(|channel| match self.config.method {
                QuantizationMethod::PowerOfTwo => {
                    let t = fake_quant::power_of_two_threshold(fake_quant::max_abs(channel));
                    (-t, t)
                }
                QuantizationMethod::Symmetric => {
                    let t = fake_quant::max_abs(channel);
                    (-t, t)
                }
                QuantizationMethod::Uniform => {
                    let (min, max) = fake_quant::min_max(channel);
                    fake_quant::adjust_range_to_include_zero(min, max, self.config.n_bits)
                }
            })
            .collect();
    }

    fn quantize(&self, values: &[f32]) -> Vec<f32> {
        let n_bits = self.config.n_bits;
        values
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let (lo, hi) = self.range(self.layout.channel(i));
                match self.config.method {
                    QuantizationMethod::PowerOfTwo | QuantizationMethod::Symmetric => {
                        fake_quant::symmetric(*x, hi, n_bits, self.config.signed)
                    }
                    QuantizationMethod::Uniform => fake_quant::uniform(*x, lo, hi, n_bits),
                }
            })
            .collect()
    }

    fn parameters(&self) -> BTreeMap<String, Vec<f32>> {
        match self.config.method {
            QuantizationMethod::PowerOfTwo | QuantizationMethod::Symmetric => {
                BTreeMap::from([("threshold".to_string(), self.ranges.iter().map(|r| r.1).collect())])
            }
            QuantizationMethod::Uniform => BTreeMap::from([
                ("min".to_string(), self.ranges.iter().map(|r| r.0).collect()),
                ("max".to_string(), self.ranges.iter().map(|r| r.1).collect()),
            ]),
        }
    }

    fn set_parameter(&mut self, name: &str, values: Vec<f32>) -> Result<(), QuantizerError> {
        let id = self.identifier();
        check_len(id, name, &values, self.ranges.len())?;
        let ranges: Vec<(f32, f32)> = match (self.config.method, name) {
            (QuantizationMethod::PowerOfTwo | QuantizationMethod::Symmetric, "threshold") => values
                .iter()
                .map(|t| check_positive(id, name, *t as f64).map(|t| (-t, t)))
                .collect::<Result<_, _>>()?,
            (QuantizationMethod::Uniform, "min") => {
                self.ranges.iter().zip(&values).map(|(r, v)| (*v, r.1)).collect()
            }
            (QuantizationMethod::Uniform, "max") => {
                self.ranges.iter().zip(&values).map(|(r, v)| (r.0, *v)).collect()
            }
            _ => return Err(unknown(id, name)),
        };
        if let Some((lo, hi)) = ranges
            .iter()
            .find(|(lo, hi)| lo >= hi || lo.is_nan() || hi.is_nan())
        {
            return Err(QuantizerError::InvalidParameter {
                quantizer: id,
                key: name.to_string(),
                reason: format!("min {lo} must be below max {hi}"),
            });
        }
        self.ranges = ranges;
        Ok(())
    }
}

/// Learned step size quantizer. The step (and zero point for uniform quantization) are the
/// trainable parameters.
#[derive(Clone, Debug)]
pub struct LsqQuantizer {
    config: TrainableQuantizerConfig,
    layout: ChannelLayout,
    scales: Vec<f32>,
    zero_points: Vec<f32>,
}

impl LsqQuantizer {
    pub fn new(
        config: TrainableQuantizerConfig,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<Self, QuantizerError> {
        let id = identifier(&config, TrainingMethod::Lsq);
        let mut scale = 2.0 * DEFAULT_THRESHOLD / 2f32.powi(config.n_bits as i32);
        for (key, value) in overrides {
            match key.as_str() {
                "scale" => scale = check_positive(id, key, *value)?,
                _ => return Err(unknown(id, key)),
            }
        }
        let zero_point = match config.method {
            QuantizationMethod::Uniform => (DEFAULT_THRESHOLD / scale).round(),
            _ => 0.0,
        };
        Ok(Self {
            config,
            layout: ChannelLayout::PER_TENSOR,
            scales: vec![scale],
            zero_points: vec![zero_point],
        })
    }

    pub fn boxed(
        config: TrainableQuantizerConfig,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<Box<dyn TrainableQuantizer>, QuantizerError> {
        Ok(Box::new(Self::new(config, overrides)?))
    }

    /// Integer grid bounds, zero point excluded
    fn grid(&self) -> (f32, f32) {
        let n_bits = self.config.n_bits as i32;
        match self.config.method {
            QuantizationMethod::Uniform => (0.0, 2f32.powi(n_bits) - 1.0),
            _ if self.config.signed => (-(2f32.powi(n_bits - 1)), 2f32.powi(n_bits - 1) - 1.0),
            _ => (0.0, 2f32.powi(n_bits) - 1.0),
        }
    }
}

impl TrainableQuantizer for LsqQuantizer {
    fn identifier(&self) -> QuantizerIdentifier {
        identifier(&self.config, TrainingMethod::Lsq)
    }

    fn config(&self) -> &TrainableQuantizerConfig {
        &self.config
    }

    fn initialize(&mut self, values: &[f32], shape: &[usize]) {
        self.layout = ChannelLayout::new(&self.config, shape);
        let (_, qmax) = self.grid();
        let (scales, zero_points): (Vec<f32>, Vec<f32>) = self
            .layout
            .split(values)
            .iter()
            .map(|channel| match self.config.method {
                QuantizationMethod::Uniform => {
                    let (min, max) = fake_quant::min_max(channel);
                    let (min, max) =
                        fake_quant::adjust_range_to_include_zero(min, max, self.config.n_bits);
                    let scale = (max - min) / qmax;
                    (scale, (-min / scale).round())
                }
                _ => {
                    let mean_abs =
                        channel.iter().map(|v| v.abs()).sum::<f32>() / channel.len().max(1) as f32;
                    ((2.0 * mean_abs / qmax.sqrt()).max(1e-8), 0.0)
                }
            })
            .unzip();
        self.scales = scales;
        self.zero_points = zero_points;
    }

    fn quantize(&self, values: &[f32]) -> Vec<f32> {
        let (qmin, qmax) = self.grid();
        values
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let c = self.layout.channel(i).min(self.scales.len() - 1);
                let (s, zp) = (self.scales[c], self.zero_points[c]);
                ((x / s).round() + zp).clamp(qmin, qmax) * s - zp * s
            })
            .collect()
    }

    fn parameters(&self) -> BTreeMap<String, Vec<f32>> {
        let mut params = BTreeMap::from([("scale".to_string(), self.scales.clone())]);
        if self.config.method == QuantizationMethod::Uniform {
            params.insert("zero_point".to_string(), self.zero_points.clone());
        }
        params
    }

    fn set_parameter(&mut self, name: &str, values: Vec<f32>) -> Result<(), QuantizerError> {
        let id = self.identifier();
        check_len(id, name, &values, self.scales.len())?;
        match (self.config.method, name) {
            (_, "scale") => {
                for v in &values {
                    check_positive(id, name, *v as f64)?;
                }
                self.scales = values;
            }
            (QuantizationMethod::Uniform, "zero_point") => self.zero_points = values,
            _ => return Err(unknown(id, name)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        qat::QuantizationTarget,
        quantization::{QuantizationConfigCandidate, QuantizationMethod},
    };

    fn weights_config(method: QuantizationMethod, n_bits: u8) -> TrainableQuantizerConfig {
        TrainableQuantizerConfig::weights(
            &QuantizationConfigCandidate::new(method, method, n_bits, n_bits),
            vec![],
        )
    }

    #[test]
    fn test_ste_per_channel_thresholds() {
        let mut q =
            SteQuantizer::new(weights_config(QuantizationMethod::PowerOfTwo, 8), &BTreeMap::new())
                .unwrap();
        // two output channels of three values each
        q.initialize(&[0.1, -0.3, 0.2, 3.0, 1.0, -2.0], &[2, 3]);
        assert_eq!(q.parameters()["threshold"], vec![0.5, 4.0]);
        let out = q.quantize(&[0.1, -0.3, 0.2, 3.0, 1.0, -2.0]);
        for (a, b) in out.iter().zip([0.1, -0.3, 0.2, 3.0, 1.0, -2.0]) {
            assert!((a - b).abs() < 4.0 / 128.0);
        }
        assert!(q.set_parameter("threshold", vec![1.0]).is_err());
        q.set_parameter("threshold", vec![1.0, 1.0]).unwrap();
        assert_eq!(q.quantize(&[0.0, 0.0, 0.0, 3.0, 0.0, 0.0])[3], 127.0 / 128.0);
    }

    #[test]
    fn test_ste_overrides() {
        let config = TrainableQuantizerConfig::activation(
            &QuantizationConfigCandidate::new(
                QuantizationMethod::Symmetric,
                QuantizationMethod::Uniform,
                8,
                8,
            ),
            vec![],
        );
        assert_eq!(config.target, QuantizationTarget::Activation);
        let q = SteQuantizer::new(
            config.clone(),
            &BTreeMap::from([("min".to_string(), 0.0), ("max".to_string(), 6.0)]),
        )
        .unwrap();
        assert_eq!(q.parameters()["max"], vec![6.0]);
        assert!(matches!(
            SteQuantizer::new(config.clone(), &BTreeMap::from([("threshold".to_string(), 1.0)])),
            Err(QuantizerError::UnknownParameter { .. })
        ));
        assert!(matches!(
            SteQuantizer::new(config, &BTreeMap::from([("min".to_string(), 9.0)])),
            Err(QuantizerError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_ste_set_parameter_keeps_valid_ranges() {
        let mut symmetric =
            SteQuantizer::new(weights_config(QuantizationMethod::Symmetric, 8), &BTreeMap::new())
                .unwrap();
        for bad in [0.0, -1.0, f32::NAN] {
            assert!(matches!(
                symmetric.set_parameter("threshold", vec![bad]),
                Err(QuantizerError::InvalidParameter { .. })
            ));
        }
        assert_eq!(symmetric.parameters()["threshold"], vec![DEFAULT_THRESHOLD]);

        let mut uniform =
            SteQuantizer::new(weights_config(QuantizationMethod::Uniform, 8), &BTreeMap::new())
                .unwrap();
        assert!(uniform.set_parameter("min", vec![DEFAULT_THRESHOLD]).is_err());
        assert!(uniform.set_parameter("max", vec![-9.0]).is_err());
        uniform.set_parameter("max", vec![2.0]).unwrap();
        uniform.set_parameter("min", vec![-1.0]).unwrap();
        assert_eq!(uniform.parameters()["min"], vec![-1.0]);
        assert_eq!(uniform.parameters()["max"], vec![2.0]);
    }

    #[test]
    fn test_lsq_uniform_keeps_zero() {
        let mut q =
            LsqQuantizer::new(weights_config(QuantizationMethod::Uniform, 4), &BTreeMap::new())
                .unwrap();
        q.initialize(&[-1.0, 0.0, 2.0, 3.0], &[1, 4]);
        let out = q.quantize(&[0.0, 3.0, -5.0]);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 3.0).abs() < 0.3);
        assert!(out[2] >= -1.3);
        assert!(q.parameters().contains_key("zero_point"));
        assert!(q.set_parameter("scale", vec![-1.0]).is_err());
    }
}
