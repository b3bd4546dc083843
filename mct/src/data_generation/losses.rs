use candle_core::{DType, Device, Result, Tensor};

use super::{
    config::{BatchNormAlignmentLossType, BnLayerWeightingType, OutputLossType},
    model_info::{BnLayerStats, LayerMoments},
};

/// Added to variances before taking their square root
pub const STD_EPS: f64 = 1e-6;
const NORM_EPS: f64 = 1e-6;

/// Weight of every batch-norm layer in the alignment loss
pub fn layer_weights(kind: BnLayerWeightingType, n_layers: usize) -> Vec<f64> {
    let average = 1.0 / n_layers as f64;
    match kind {
        BnLayerWeightingType::Average => vec![average; n_layers],
        BnLayerWeightingType::FirstLayerMultiplier => (0..n_layers)
            .map(|i| if i == 0 { 10.0 * average } else { average })
            .collect(),
    }
}

/// Batch-norm statistics as `(1, channels)` tensors ready to broadcast against live statistics
#[derive(Clone, Debug)]
pub struct BnTarget {
    mean: Tensor,
    std: Tensor,
}

impl BnTarget {
    pub fn new(stats: &BnLayerStats, device: &Device) -> Result<Self> {
        let c = stats.channels();
        Ok(Self {
            mean: Tensor::from_slice(&stats.mean, (1, c), device)?,
            std: Tensor::from_slice(&stats.std, (1, c), device)?,
        })
    }
}

/// Weighted distance between live statistics and the batch-norm ones, summed over layers.
/// Within a layer distances are summed over channels and averaged over groups.
pub fn bn_alignment_loss(
    kind: BatchNormAlignmentLossType,
    moments: &[LayerMoments],
    targets: &[BnTarget],
    weights: &[f64],
) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for ((moments, target), weight) in moments.iter().zip(targets).zip(weights) {
        let layer = match kind {
            BatchNormAlignmentLossType::L2Square => {
                let mean_term = moments.mean.broadcast_sub(&target.mean)?.sqr()?.sum(1)?;
                let std_term = moments
                    .std(STD_EPS)?
                    .broadcast_sub(&target.std)?
                    .sqr()?
                    .sum(1)?;
                (mean_term + std_term)?.mean_all()?.affine(*weight, 0.0)?
            }
        };
        total = Some(match total {
            Some(total) => (total + layer)?,
            None => layer,
        });
    }
    match total {
        Some(total) => Ok(total),
        None => Tensor::zeros((), DType::F32, &Device::Cpu),
    }
}

/// Loss on the model output pushing every image toward a confident prediction.
/// `weight_norms` is `(1, classes)`; without it outputs are normalized per image.
pub fn output_loss(
    kind: OutputLossType,
    output: &Tensor,
    weight_norms: Option<&Tensor>,
) -> Result<Tensor> {
    match kind {
        OutputLossType::None => Tensor::zeros((), output.dtype(), output.device()),
        OutputLossType::MinMaxDiff => min_max_diff(output),
        OutputLossType::RegularizedMinMaxDiff => {
            let normalized = match weight_norms {
                Some(norms) => output.broadcast_div(&norms.affine(1.0, NORM_EPS)?)?,
                None => {
                    let norm = output.sqr()?.sum_keepdim(1)?.sqrt()?.affine(1.0, NORM_EPS)?;
                    output.broadcast_div(&norm)?
                }
            };
            min_max_diff(&normalized)
        }
    }
}

fn min_max_diff(output: &Tensor) -> Result<Tensor> {
    output.min(1)?.sub(&output.max(1)?)?.mean_all()
}
