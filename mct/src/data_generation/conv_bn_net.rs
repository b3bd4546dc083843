//! A small frozen conv / batch-norm classifier with random parameters, used to exercise data
//! generation end to end without a trained model at hand.

use candle_core::{Device, Result, Tensor};
use rand::{distributions::Distribution, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;

use super::{
    model_info::{BnLayerStats, ForwardOutput, FrozenModel},
    DataGenError,
};

const BN_EPS: f32 = 1e-3;

#[derive(Clone, Debug)]
struct ConvBnBlock {
    /// `(out, in, 3, 3)`
    kernel: Tensor,
    /// `(1, out, 1, 1)`
    bias: Tensor,
    /// Batch-norm folded into `x * scale + shift`, both `(1, out, 1, 1)`
    scale: Tensor,
    shift: Tensor,
}

/// `[conv 3x3 -> batch-norm -> relu] * n -> global average pool -> dense`
#[derive(Clone, Debug)]
pub struct ConvBnNet {
    input_shape: (usize, usize, usize),
    blocks: Vec<ConvBnBlock>,
    /// `(channels, classes)`
    dense_weight: Tensor,
    /// `(1, classes)`
    dense_bias: Tensor,
    bn_stats: Vec<BnLayerStats>,
}

impl ConvBnNet {
    /// One block per entry of `channels`, parameters drawn from `seed`
    pub fn random(
        input_shape: (usize, usize, usize),
        channels: &[usize],
        classes: usize,
        seed: u64,
        device: &Device,
    ) -> std::result::Result<Self, DataGenError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut blocks = Vec::with_capacity(channels.len());
        let mut bn_stats = Vec::with_capacity(channels.len());
        let mut c_in = input_shape.0;
        for (i, &c_out) in channels.iter().enumerate() {
            let fan_in = c_in * 9;
            let kernel = he_normal(c_out * fan_in, fan_in, &mut rng)?;
            let mut sample = |lo: f32, hi: f32| -> Vec<f32> {
                (0..c_out).map(|_| rng.gen_range(lo..hi)).collect()
            };
            let bias = sample(-0.1, 0.1);
            let mean = sample(-0.5, 0.5);
            let var = sample(0.5, 1.5);
            let gamma = sample(0.5, 1.5);
            let beta = sample(-0.2, 0.2);

            let scale: Vec<f32> = gamma
                .iter()
                .zip(&var)
                .map(|(g, v)| g / (v + BN_EPS).sqrt())
                .collect();
            let shift: Vec<f32> = beta
                .iter()
                .zip(&mean)
                .zip(&scale)
                .map(|((b, m), s)| b - m * s)
                .collect();
            let channel_shape = (1, c_out, 1, 1);
            blocks.push(ConvBnBlock {
                kernel: Tensor::from_vec(kernel, (c_out, c_in, 3, 3), device)?,
                bias: Tensor::from_vec(bias, channel_shape, device)?,
                scale: Tensor::from_vec(scale, channel_shape, device)?,
                shift: Tensor::from_vec(shift, channel_shape, device)?,
            });
            bn_stats.push(BnLayerStats {
                name: format!("bn_{i}"),
                std: var.iter().map(|v| v.sqrt()).collect(),
                mean,
            });
            c_in = c_out;
        }
        let dense_weight = he_normal(c_in * classes, c_in, &mut rng)?;
        let dense_bias: Vec<f32> = (0..classes).map(|_| rng.gen_range(-0.1..0.1)).collect();
        Ok(Self {
            input_shape,
            blocks,
            dense_weight: Tensor::from_vec(dense_weight, (c_in, classes), device)?,
            dense_bias: Tensor::from_vec(dense_bias, (1, classes), device)?,
            bn_stats,
        })
    }
}

fn he_normal(
    len: usize,
    fan_in: usize,
    rng: &mut ChaCha8Rng,
) -> std::result::Result<Vec<f32>, DataGenError> {
    let normal = Normal::new(0.0, (2.0 / fan_in as f64).sqrt())
        .map_err(|e| DataGenError::Distribution(e.to_string()))?;
    Ok((0..len).map(|_| normal.sample(&mut *rng) as f32).collect())
}

impl FrozenModel for ConvBnNet {
    fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    fn bn_stats(&self) -> &[BnLayerStats] {
        &self.bn_stats
    }

    fn forward(&self, images: &Tensor) -> Result<ForwardOutput> {
        let mut x = images.clone();
        let mut bn_inputs = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let y = x.conv2d(&block.kernel, 1, 1, 1, 1)?.broadcast_add(&block.bias)?;
            x = y
                .broadcast_mul(&block.scale)?
                .broadcast_add(&block.shift)?
                .relu()?;
            bn_inputs.push(y);
        }
        let pooled = x.mean((2, 3))?;
        let output = pooled
            .matmul(&self.dense_weight)?
            .broadcast_add(&self.dense_bias)?;
        Ok(ForwardOutput { output, bn_inputs })
    }

    fn output_weight_norms(&self) -> Result<Option<Tensor>> {
        Ok(Some(self.dense_weight.sqr()?.sum_keepdim(0)?.sqrt()?))
    }
}
