//! Synthetic image generation from a frozen model.
//!
//! Images start from noise and are optimized so the statistics they produce at every
//! batch-norm layer match the running statistics stored in that layer, optionally pushed
//! toward confident predictions by an output loss. See [`DataGenerationRun`].

use candle_core::{Device, Tensor};

use crate::error::ConfigError;

pub mod config;
mod conv_bn_net;
mod image_pipeline;
mod init;
mod losses;
mod model_info;
mod optimization;
mod optimizer;
mod progress;

pub use config::{DataGenerationConfig, DataGenerationConfigBuilder};
pub use conv_bn_net::ConvBnNet;
pub use image_pipeline::ImagePipeline;
pub use losses::{bn_alignment_loss, layer_weights, output_loss, BnTarget};
pub use model_info::{BnLayerStats, ForwardOutput, FrozenModel, LayerMoments};
pub use optimization::{DataGenerationRun, ImagesOptimizationHandler, RunState};
pub use optimizer::{ImageOptimizer, Scheduler};
pub use progress::{IterationReport, NoProgress, ProgressObserver, TracingProgress};

#[derive(thiserror::Error, Debug)]
pub enum DataGenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("tensor backend error: {0}")]
    Backend(#[from] candle_core::Error),
    #[error("model takes {model} input channels but the normalization has {normalization}")]
    ChannelMismatch { model: usize, normalization: usize },
    #[error("model has no batch-norm layer to align statistics with")]
    NoBnLayers,
    #[error("model returned {got} batch-norm inputs, expected {expected}")]
    BnLayerCountMismatch { expected: usize, got: usize },
    #[error("cannot generate {0} images")]
    InvalidImageCount(usize),
    #[error("no gradient reached the images of batch {batch}")]
    MissingGradient { batch: usize },
    #[error("invalid sampling distribution: {0}")]
    Distribution(String),
    #[error("all {n_iter} iterations already ran")]
    IterationsExhausted { n_iter: usize },
    #[error("run is already finalized")]
    RunFinalized,
}

/// Generates `n_images` images for `model`, running every iteration
pub fn generate_images<M, O>(
    model: &M,
    config: DataGenerationConfig,
    n_images: usize,
    device: &Device,
    observer: &O,
) -> Result<Vec<Tensor>, DataGenError>
where
    M: FrozenModel + ?Sized,
    O: ProgressObserver + ?Sized,
{
    DataGenerationRun::new(model, config, n_images, device)?.run(observer)
}
