//! What data generation needs from the frozen model: the statistics stored in its batch-norm
//! layers and, for a batch of images, the inputs of those layers.

use candle_core::{Result, Tensor};

use super::config::ImageGranularity;

/// Running statistics of one batch-norm layer, one entry per channel
#[derive(Clone, Debug, PartialEq)]
pub struct BnLayerStats {
    pub name: String,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl BnLayerStats {
    pub fn channels(&self) -> usize {
        self.mean.len()
    }
}

/// Result of a forward pass with batch-norm inputs captured
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    /// `(batch, classes)`
    pub output: Tensor,
    /// Input of every batch-norm layer, in the order of [`FrozenModel::bn_stats`], each
    /// `(batch, channels, height, width)`
    pub bn_inputs: Vec<Tensor>,
}

/// A trained model whose parameters stay fixed while images are optimized against it
pub trait FrozenModel {
    /// `(channels, height, width)` of one input image
    fn input_shape(&self) -> (usize, usize, usize);

    fn bn_stats(&self) -> &[BnLayerStats];

    fn forward(&self, images: &Tensor) -> Result<ForwardOutput>;

    /// L2 norm of the output layer weights of every class as a `(1, classes)` tensor, used by
    /// the regularized output loss. Models without a dense output layer return `None`.
    fn output_weight_norms(&self) -> Result<Option<Tensor>> {
        Ok(None)
    }
}

/// Mean and second moment of one layer input, both `(groups, channels)`
#[derive(Clone, Debug)]
pub struct LayerMoments {
    pub mean: Tensor,
    pub second_moment: Tensor,
}

impl LayerMoments {
    /// Per channel statistics of `x`. One group per image for [`ImageGranularity::ImageWise`],
    /// a single group over the whole batch otherwise.
    pub fn of(x: &Tensor, granularity: ImageGranularity) -> Result<Self> {
        let (b, c, h, w) = x.dims4()?;
        let flat = x.reshape((b, c, h * w))?;
        let mean = flat.mean(2)?;
        let second_moment = flat.sqr()?.mean(2)?;
        match granularity {
            ImageGranularity::ImageWise => Ok(Self {
                mean,
                second_moment,
            }),
            // every image holds the same number of pixels, so averaging image means is exact
            ImageGranularity::BatchWise | ImageGranularity::AllImages => Ok(Self {
                mean: mean.mean_keepdim(0)?,
                second_moment: second_moment.mean_keepdim(0)?,
            }),
        }
    }

    /// Standard deviation per group and channel
    pub fn std(&self, eps: f64) -> Result<Tensor> {
        self.second_moment
            .sub(&self.mean.sqr()?)?
            .relu()?
            .affine(1.0, eps)?
            .sqrt()
    }

    /// Detached values of a single group statistics, one entry per channel
    pub fn to_vecs(&self) -> Result<(Vec<f32>, Vec<f32>)> {
        Ok((
            self.mean.flatten_all()?.to_vec1::<f32>()?,
            self.second_moment.flatten_all()?.to_vec1::<f32>()?,
        ))
    }
}

#[cfg(test)]
mod test {
    use candle_core::Device;

    use super::*;

    #[test]
    fn test_moments_by_granularity() -> Result<()> {
        // two images, one channel of two pixels
        let x = Tensor::from_vec(vec![1f32, 3.0, 5.0, 7.0], (2, 1, 1, 2), &Device::Cpu)?;
        let image_wise = LayerMoments::of(&x, ImageGranularity::ImageWise)?;
        assert_eq!(image_wise.mean.dims(), &[2, 1]);
        assert_eq!(image_wise.mean.flatten_all()?.to_vec1::<f32>()?, vec![2.0, 6.0]);
        assert_eq!(image_wise.std(0.0)?.flatten_all()?.to_vec1::<f32>()?, vec![
            1.0, 1.0
        ]);

        let batch_wise = LayerMoments::of(&x, ImageGranularity::BatchWise)?;
        let (mean, second) = batch_wise.to_vecs()?;
        assert_eq!(mean, vec![4.0]);
        assert_eq!(second, vec![21.0]);
        let std = batch_wise.std(0.0)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((std[0] - 5f32.sqrt()).abs() < 1e-5);
        Ok(())
    }
}
