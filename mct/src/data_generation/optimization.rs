//! The optimization loop: images are split in batches, and every iteration visits each batch
//! once in a random order, moving its pixels along the gradient of the batch-norm alignment
//! loss plus the weighted output loss.

use candle_core::{Device, Tensor, Var};
use derive_more::Display;
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, instrument, warn};

use super::{
    config::{DataGenerationConfig, ImageGranularity, OutputLossType},
    image_pipeline::ImagePipeline,
    init::sample_images,
    losses::{bn_alignment_loss, layer_weights, output_loss, BnTarget},
    model_info::{FrozenModel, LayerMoments},
    optimizer::{ImageOptimizer, Scheduler},
    progress::{IterationReport, ProgressObserver},
    DataGenError,
};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RunState {
    #[display("initialized")]
    Initialized,
    #[display("iterating")]
    Iterating,
    #[display("finalized")]
    Finalized,
}

#[derive(Debug)]
struct BatchState {
    images: Var,
    optimizer: ImageOptimizer,
    scheduler: Scheduler,
    n_images: usize,
    updates: usize,
}

/// Per channel `(mean, second moment)` of every layer input
type BatchMoments = Vec<(Vec<f32>, Vec<f32>)>;

/// Statistics of the finalized images of every batch, so one batch can be optimized against
/// the statistics of all images
#[derive(Debug)]
struct AllImagesStats {
    batches: Vec<BatchMoments>,
    counts: Vec<usize>,
}

impl AllImagesStats {
    /// `live` statistics of `batch` merged with the stored ones of every other batch, weighted
    /// by image count. Only the live part carries gradients.
    fn combine(
        &self,
        batch: usize,
        layer: usize,
        live: &LayerMoments,
    ) -> candle_core::Result<LayerMoments> {
        let total: usize = self.counts.iter().sum();
        let channels = self.batches[batch][layer].0.len();
        let (mut mean, mut second) = (vec![0f32; channels], vec![0f32; channels]);
        for (other, (moments, count)) in self.batches.iter().zip(&self.counts).enumerate() {
            if other == batch {
                continue;
            }
            let (other_mean, other_second) = &moments[layer];
            let weight = *count as f32 / total as f32;
            for c in 0..channels {
                mean[c] += other_mean[c] * weight;
                second[c] += other_second[c] * weight;
            }
        }
        let live_weight = self.counts[batch] as f64 / total as f64;
        let device = live.mean.device();
        Ok(LayerMoments {
            mean: live
                .mean
                .affine(live_weight, 0.0)?
                .broadcast_add(&Tensor::from_vec(mean, (1, channels), device)?)?,
            second_moment: live
                .second_moment
                .affine(live_weight, 0.0)?
                .broadcast_add(&Tensor::from_vec(second, (1, channels), device)?)?,
        })
    }
}

fn moments_of(bn_inputs: &[Tensor]) -> candle_core::Result<BatchMoments> {
    bn_inputs
        .iter()
        .map(|x| LayerMoments::of(x, ImageGranularity::AllImages)?.to_vecs())
        .collect()
}

/// Owns the images under optimization, with the optimizer and scheduler of each batch
#[derive(Debug)]
pub struct ImagesOptimizationHandler {
    batches: Vec<BatchState>,
    batch_order: Vec<usize>,
    all_images_stats: Option<AllImagesStats>,
    clip_bounds: Option<Vec<(f32, f32)>>,
    reflection: bool,
    device: Device,
}

impl ImagesOptimizationHandler {
    pub fn new<M: FrozenModel + ?Sized>(
        config: &DataGenerationConfig,
        model: &M,
        pipeline: &ImagePipeline,
        n_images: usize,
        rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> Result<Self, DataGenError> {
        let (c, _, _) = model.input_shape();
        let (h, w) = pipeline.image_input_size();
        let mut batches = Vec::new();
        let mut initial = Vec::new();
        let mut first = 0;
        while first < n_images {
            let n = config.data_gen_batch_size().min(n_images - first);
            let pixels = sample_images(config.data_init_type(), n, c * h * w, rng)?;
            let len = pixels.len();
            let images = Tensor::from_vec(pixels, (n, c, h, w), device)?;
            batches.push(BatchState {
                images: Var::from_tensor(&images)?,
                optimizer: ImageOptimizer::new(config.optimizer(), len),
                scheduler: Scheduler::new(
                    config.scheduler_type(),
                    config.initial_lr(),
                    config.n_iter(),
                ),
                n_images: n,
                updates: 0,
            });
            initial.push(images);
            first += n;
        }

        let all_images_stats = if config.use_all_data_stats() {
            let moments = initial
                .iter()
                .map(|images| {
                    let finalized = pipeline.image_output_finalize(images)?;
                    moments_of(&model.forward(&finalized)?.bn_inputs)
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            Some(AllImagesStats {
                batches: moments,
                counts: batches.iter().map(|b| b.n_images).collect(),
            })
        } else {
            None
        };

        Ok(Self {
            batch_order: (0..batches.len()).collect(),
            batches,
            all_images_stats,
            clip_bounds: config.clip_images().then(|| config.clip_bounds()),
            reflection: config.reflection(),
            device: device.clone(),
        })
    }

    pub fn n_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn batch_order(&self) -> &[usize] {
        &self.batch_order
    }

    pub fn random_batch_reorder(&mut self, rng: &mut ChaCha8Rng) {
        self.batch_order.shuffle(rng);
    }

    pub fn get_images_by_batch_index(&self, batch: usize) -> &Var {
        &self.batches[batch].images
    }

    /// Optimizer updates applied to each image, in image order
    pub fn image_update_counts(&self) -> Vec<usize> {
        self.batches
            .iter()
            .flat_map(|b| std::iter::repeat(b.updates).take(b.n_images))
            .collect()
    }

    pub fn steps_taken(&self) -> usize {
        self.batches.iter().map(|b| b.updates).sum()
    }

    /// Moves the images of `batch` along `grad`, then clips them. Returns the updated images.
    pub fn optimization_step(
        &mut self,
        batch: usize,
        grad: &Tensor,
        loss: f32,
    ) -> Result<Tensor, DataGenError> {
        let state = &mut self.batches[batch];
        let dims = state.images.dims().to_vec();
        let mut pixels = state.images.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        let grad = grad.flatten_all()?.to_vec1::<f32>()?;
        state
            .optimizer
            .step(&mut pixels, &grad, state.scheduler.lr());
        state.scheduler.step(loss);

        if let Some(bounds) = &self.clip_bounds {
            let plane = dims[2] * dims[3];
            clip_and_reflect(&mut pixels, bounds, plane, self.reflection);
        }
        let updated = Tensor::from_vec(pixels, dims, &self.device)?;
        state.images.set(&updated)?;
        state.updates += 1;
        Ok(updated)
    }

    fn combine_moments(
        &self,
        batch: usize,
        moments: Vec<LayerMoments>,
    ) -> candle_core::Result<Vec<LayerMoments>> {
        match &self.all_images_stats {
            Some(stats) => moments
                .iter()
                .enumerate()
                .map(|(layer, live)| stats.combine(batch, layer, live))
                .collect(),
            None => Ok(moments),
        }
    }

    fn update_statistics(&mut self, batch: usize, moments: BatchMoments) {
        if let Some(stats) = &mut self.all_images_stats {
            stats.batches[batch] = moments;
        }
    }

    /// Output sized images, in the order they were created
    pub fn finalized_images(&self, pipeline: &ImagePipeline) -> Result<Vec<Tensor>, DataGenError> {
        let mut images = Vec::new();
        for batch in &self.batches {
            let finalized = pipeline.image_output_finalize(batch.images.as_tensor())?;
            for i in 0..batch.n_images {
                images.push(finalized.get(i)?.contiguous()?);
            }
        }
        Ok(images)
    }
}

/// Reflects values back over the channel bounds, then clamps them
fn clip_and_reflect(pixels: &mut [f32], bounds: &[(f32, f32)], plane: usize, reflection: bool) {
    let channels = bounds.len();
    pixels
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(i, channel)| {
            let (lo, hi) = bounds[i % channels];
            for p in channel.iter_mut() {
                if reflection {
                    if *p > hi {
                        *p = 2.0 * hi - *p;
                    } else if *p < lo {
                        *p = 2.0 * lo - *p;
                    }
                }
                *p = p.clamp(lo, hi);
            }
        });
}

#[derive(Clone, Copy, Debug, Default)]
struct LossTotals {
    total: f32,
    bn: f32,
    output: f32,
}

/// One data generation run over a frozen model.
///
/// A run starts [`RunState::Initialized`], moves to [`RunState::Iterating`] with the first
/// iteration and ends [`RunState::Finalized`] once the images are extracted.
pub struct DataGenerationRun<'m, M: FrozenModel + ?Sized> {
    model: &'m M,
    config: DataGenerationConfig,
    pipeline: ImagePipeline,
    handler: ImagesOptimizationHandler,
    targets: Vec<BnTarget>,
    layer_weights: Vec<f64>,
    weight_norms: Option<Tensor>,
    rng: ChaCha8Rng,
    state: RunState,
    iteration: usize,
}

impl<'m, M: FrozenModel + ?Sized> DataGenerationRun<'m, M> {
    pub fn new(
        model: &'m M,
        config: DataGenerationConfig,
        n_images: usize,
        device: &Device,
    ) -> Result<Self, DataGenError> {
        if n_images == 0 {
            return Err(DataGenError::InvalidImageCount(n_images));
        }
        let bn_stats = model.bn_stats();
        if bn_stats.is_empty() {
            return Err(DataGenError::NoBnLayers);
        }
        let (channels, h, w) = model.input_shape();
        let normalization = config.image_normalization_type().mean_std().0.len();
        if normalization != channels {
            return Err(DataGenError::ChannelMismatch {
                model: channels,
                normalization,
            });
        }

        let pipeline = ImagePipeline::new(config.image_pipeline_type(), (h, w), config.extra_pixels());
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed());
        let handler =
            ImagesOptimizationHandler::new(&config, model, &pipeline, n_images, &mut rng, device)?;
        let targets = bn_stats
            .iter()
            .map(|stats| BnTarget::new(stats, device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let weight_norms = match config.output_loss_type() {
            OutputLossType::RegularizedMinMaxDiff => model.output_weight_norms()?,
            OutputLossType::None | OutputLossType::MinMaxDiff => None,
        };
        debug!(
            n_images,
            batches = handler.n_batches(),
            bn_layers = bn_stats.len(),
            "data generation initialized"
        );
        Ok(Self {
            model,
            layer_weights: layer_weights(config.layer_weighting_type(), bn_stats.len()),
            config,
            pipeline,
            handler,
            targets,
            weight_norms,
            rng,
            state: RunState::Initialized,
            iteration: 0,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn handler(&self) -> &ImagesOptimizationHandler {
        &self.handler
    }

    pub fn steps_taken(&self) -> usize {
        self.handler.steps_taken()
    }

    pub fn image_update_counts(&self) -> Vec<usize> {
        self.handler.image_update_counts()
    }

    /// Runs one outer iteration: every batch is optimized once, in a fresh random order
    pub fn step_iteration<O: ProgressObserver + ?Sized>(
        &mut self,
        observer: &O,
    ) -> Result<IterationReport, DataGenError> {
        match self.state {
            RunState::Finalized => return Err(DataGenError::RunFinalized),
            _ if self.iteration >= self.config.n_iter() => {
                return Err(DataGenError::IterationsExhausted {
                    n_iter: self.config.n_iter(),
                })
            }
            RunState::Initialized | RunState::Iterating => self.state = RunState::Iterating,
        }

        self.handler.random_batch_reorder(&mut self.rng);
        let order = self.handler.batch_order().to_vec();
        let mut totals = LossTotals::default();
        for &batch in &order {
            let step = self.optimize_batch(batch)?;
            totals.total += step.total;
            totals.bn += step.bn;
            totals.output += step.output;
        }
        let n = order.len() as f32;
        let report = IterationReport {
            iteration: self.iteration,
            total_loss: totals.total / n,
            bn_loss: totals.bn / n,
            output_loss: totals.output / n,
            batch_order: order,
        };
        observer.observe(&report);
        self.iteration += 1;
        Ok(report)
    }

    fn optimize_batch(&mut self, batch: usize) -> Result<LossTotals, DataGenError> {
        let images = self.handler.get_images_by_batch_index(batch).clone();
        let view = self
            .pipeline
            .image_input_manipulation(images.as_tensor(), &mut self.rng)?;
        let forward = self.model.forward(&view)?;
        if forward.bn_inputs.len() != self.targets.len() {
            return Err(DataGenError::BnLayerCountMismatch {
                expected: self.targets.len(),
                got: forward.bn_inputs.len(),
            });
        }

        let moments = forward
            .bn_inputs
            .iter()
            .map(|x| LayerMoments::of(x, self.config.image_granularity()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let moments = self.handler.combine_moments(batch, moments)?;
        let bn_loss = bn_alignment_loss(
            self.config.bn_alignment_loss_type(),
            &moments,
            &self.targets,
            &self.layer_weights,
        )?;

        let multiplier = self.config.output_loss_multiplier();
        let output_term = if multiplier > 0.0 && self.config.output_loss_type() != OutputLossType::None {
            Some(
                output_loss(
                    self.config.output_loss_type(),
                    &forward.output,
                    self.weight_norms.as_ref(),
                )?
                .affine(multiplier as f64, 0.0)?,
            )
        } else {
            None
        };
        let total = match &output_term {
            Some(output) => (&bn_loss + output)?,
            None => bn_loss.clone(),
        };

        let grads = total.backward()?;
        let grad = grads
            .get(images.as_tensor())
            .ok_or(DataGenError::MissingGradient { batch })?;
        let loss = LossTotals {
            total: total.to_scalar::<f32>()?,
            bn: bn_loss.to_scalar::<f32>()?,
            output: match &output_term {
                Some(output) => output.to_scalar::<f32>()?,
                None => 0.0,
            },
        };
        if !loss.total.is_finite() {
            warn!(batch, iteration = self.iteration, loss = loss.total, "non finite loss");
        }
        let updated = self.handler.optimization_step(batch, grad, loss.total)?;

        if self.config.use_all_data_stats() {
            let finalized = self.pipeline.image_output_finalize(&updated)?;
            let moments = moments_of(&self.model.forward(&finalized)?.bn_inputs)?;
            self.handler.update_statistics(batch, moments);
        }
        Ok(loss)
    }

    /// Runs every remaining iteration, then finalizes
    #[instrument(name = "data_generation", skip_all, fields(n_iter = self.config.n_iter()))]
    pub fn run<O: ProgressObserver + ?Sized>(
        &mut self,
        observer: &O,
    ) -> Result<Vec<Tensor>, DataGenError> {
        while self.iteration < self.config.n_iter() {
            self.step_iteration(observer)?;
        }
        self.finalize()
    }

    /// Output sized images `(channels, height, width)` in creation order
    pub fn finalize(&mut self) -> Result<Vec<Tensor>, DataGenError> {
        if self.state == RunState::Finalized {
            return Err(DataGenError::RunFinalized);
        }
        let images = self.handler.finalized_images(&self.pipeline)?;
        self.state = RunState::Finalized;
        debug!(
            images = images.len(),
            steps = self.steps_taken(),
            "data generation finalized"
        );
        Ok(images)
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use rstest::rstest;

    use super::*;
    use crate::data_generation::{
        config::{
            BnLayerWeightingType, DataGenerationConfigBuilder, DataInitType,
            ImageNormalizationType, ImagePipelineType, OptimizerType, SchedulerType,
        },
        conv_bn_net::ConvBnNet,
        progress::NoProgress,
    };

    fn small_net() -> ConvBnNet {
        ConvBnNet::random((3, 6, 6), &[4, 4], 5, 3, &Device::Cpu).unwrap()
    }

    fn small_config() -> DataGenerationConfigBuilder {
        DataGenerationConfig::builder()
            .n_iter(2)
            .data_gen_batch_size(4)
            .image_normalization_type(ImageNormalizationType::NoNormalization)
    }

    #[test]
    fn test_every_image_is_updated_once_per_iteration() {
        let net = small_net();
        let config = small_config().extra_pixels(2).build().unwrap();
        let mut run = DataGenerationRun::new(&net, config, 8, &Device::Cpu).unwrap();
        assert_eq!(run.state(), RunState::Initialized);
        assert_eq!(run.handler().n_batches(), 2);

        let reports = RefCell::new(Vec::new());
        let observer = |report: &IterationReport| reports.borrow_mut().push(report.clone());
        let images = run.run(&observer).unwrap();

        assert_eq!(run.state(), RunState::Finalized);
        assert_eq!(run.steps_taken(), 4);
        assert_eq!(run.image_update_counts(), vec![2; 8]);
        assert_eq!(images.len(), 8);
        assert!(images.iter().all(|image| image.dims() == [3, 6, 6]));

        let reports = reports.into_inner();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            let mut order = report.batch_order.clone();
            order.sort();
            assert_eq!(order, vec![0, 1]);
        }
    }

    #[rstest]
    #[case::image_wise(small_config().image_granularity(ImageGranularity::ImageWise))]
    #[case::batch_wise(small_config().image_granularity(ImageGranularity::BatchWise))]
    #[case::sgd(small_config().optimizer(OptimizerType::Sgd))]
    #[case::step_scheduler(small_config().scheduler_type(SchedulerType::Step))]
    #[case::identity_pipeline(small_config().image_pipeline_type(ImagePipelineType::Identity))]
    #[case::random_crop(
        small_config()
            .image_pipeline_type(ImagePipelineType::RandomCrop)
            .extra_pixels(2)
    )]
    #[case::random_crop_flip(
        small_config()
            .image_pipeline_type(ImagePipelineType::RandomCropFlip)
            .extra_pixels(2)
    )]
    #[case::diverse_init(small_config().data_init_type(DataInitType::Diverse))]
    #[case::first_layer_multiplier(
        small_config().layer_weighting_type(BnLayerWeightingType::FirstLayerMultiplier)
    )]
    #[case::plateau_batch_wise(
        small_config()
            .scheduler_type(SchedulerType::ReduceOnPlateau)
            .image_granularity(ImageGranularity::BatchWise)
    )]
    #[case::plateau_image_wise(
        small_config()
            .scheduler_type(SchedulerType::ReduceOnPlateau)
            .image_granularity(ImageGranularity::ImageWise)
    )]
    #[case::no_output_loss(small_config().output_loss_type(OutputLossType::None))]
    #[case::min_max_image_wise(
        small_config()
            .image_granularity(ImageGranularity::ImageWise)
            .output_loss_type(OutputLossType::MinMaxDiff)
            .output_loss_multiplier(1.0)
    )]
    #[case::regularized_image_wise(
        small_config()
            .image_granularity(ImageGranularity::ImageWise)
            .output_loss_type(OutputLossType::RegularizedMinMaxDiff)
            .output_loss_multiplier(1.0)
    )]
    #[case::torchvision_no_clip(
        small_config()
            .image_normalization_type(ImageNormalizationType::Torchvision)
            .clip_images(false)
    )]
    fn test_strategy_runs_full_loop(#[case] config: DataGenerationConfigBuilder) {
        let net = small_net();
        let config = config.initial_lr(0.1).build().unwrap();
        // batches of 4 and 2 images
        let mut run = DataGenerationRun::new(&net, config, 6, &Device::Cpu).unwrap();
        assert_eq!(run.handler().n_batches(), 2);

        let reports = RefCell::new(Vec::new());
        let images = run
            .run(&|report: &IterationReport| reports.borrow_mut().push(report.clone()))
            .unwrap();

        assert_eq!(run.steps_taken(), 4);
        assert_eq!(run.image_update_counts(), vec![2; 6]);
        assert_eq!(images.len(), 6);
        for image in &images {
            assert_eq!(image.dims(), &[3, 6, 6]);
            let pixels = image.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(pixels.iter().all(|p| p.is_finite()));
        }
        let reports = reports.into_inner();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert!(report.total_loss.is_finite(), "{report:?}");
            assert!(report.bn_loss.is_finite(), "{report:?}");
            assert!(report.output_loss.is_finite(), "{report:?}");
        }
    }

    #[test]
    fn test_zero_multiplier_leaves_only_bn_loss() {
        let net = small_net();
        let config = small_config().output_loss_multiplier(0.0).build().unwrap();
        let mut run = DataGenerationRun::new(&net, config, 4, &Device::Cpu).unwrap();
        let report = run.step_iteration(&NoProgress).unwrap();
        assert_eq!(report.output_loss, 0.0);
        assert_eq!(report.total_loss, report.bn_loss);
    }

    #[test]
    fn test_output_loss_is_added() {
        let net = small_net();
        let config = small_config()
            .output_loss_multiplier(1.0)
            .output_loss_type(OutputLossType::MinMaxDiff)
            .build()
            .unwrap();
        let mut run = DataGenerationRun::new(&net, config, 4, &Device::Cpu).unwrap();
        let report = run.step_iteration(&NoProgress).unwrap();
        assert!(report.output_loss < 0.0);
        let sum = report.bn_loss + report.output_loss;
        assert!((report.total_loss - sum).abs() <= 1e-4 * sum.abs().max(1.0));
    }

    #[test]
    fn test_images_stay_within_clip_bounds() {
        let net = small_net();
        // standard normal pixels mostly fall outside [0, 1]
        let config = small_config()
            .image_normalization_type(ImageNormalizationType::Custom {
                mean: vec![0.0; 3],
                std: vec![255.0; 3],
            })
            .build()
            .unwrap();
        let images = DataGenerationRun::new(&net, config, 4, &Device::Cpu)
            .unwrap()
            .run(&NoProgress)
            .unwrap();
        for image in images {
            let pixels = image.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(pixels.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn test_bn_loss_decreases() {
        let net = small_net();
        let config = small_config()
            .n_iter(30)
            .initial_lr(0.05)
            .clip_images(false)
            .output_loss_type(OutputLossType::None)
            .image_granularity(ImageGranularity::BatchWise)
            .image_pipeline_type(ImagePipelineType::Identity)
            .scheduler_type(SchedulerType::Step)
            .optimizer(OptimizerType::Adam)
            .build()
            .unwrap();
        let mut run = DataGenerationRun::new(&net, config, 4, &Device::Cpu).unwrap();
        let first = run.step_iteration(&NoProgress).unwrap().bn_loss;
        let mut last = first;
        while run.iteration() < 30 {
            last = run.step_iteration(&NoProgress).unwrap().bn_loss;
        }
        assert!(last < first, "{last} >= {first}");
    }

    #[test]
    fn test_same_seed_same_images() {
        let net = small_net();
        let generate = || {
            let config = small_config().build().unwrap();
            DataGenerationRun::new(&net, config, 5, &Device::Cpu)
                .unwrap()
                .run(&NoProgress)
                .unwrap()
                .iter()
                .map(|image| image.flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(generate(), generate());
    }

    #[test]
    fn test_run_errors() {
        let net = small_net();
        assert!(matches!(
            DataGenerationRun::new(&net, small_config().build().unwrap(), 0, &Device::Cpu),
            Err(DataGenError::InvalidImageCount(0))
        ));
        let one_channel = small_config()
            .image_normalization_type(ImageNormalizationType::Custom {
                mean: vec![0.0],
                std: vec![1.0],
            })
            .build()
            .unwrap();
        assert!(matches!(
            DataGenerationRun::new(&net, one_channel, 4, &Device::Cpu),
            Err(DataGenError::ChannelMismatch {
                model: 3,
                normalization: 1
            })
        ));

        let config = small_config().n_iter(1).build().unwrap();
        let mut run = DataGenerationRun::new(&net, config, 4, &Device::Cpu).unwrap();
        run.step_iteration(&NoProgress).unwrap();
        assert!(matches!(
            run.step_iteration(&NoProgress),
            Err(DataGenError::IterationsExhausted { n_iter: 1 })
        ));
        run.finalize().unwrap();
        assert!(matches!(run.finalize(), Err(DataGenError::RunFinalized)));
        assert!(matches!(
            run.step_iteration(&NoProgress),
            Err(DataGenError::RunFinalized)
        ));
    }

    #[test]
    fn test_clip_and_reflect() {
        let mut pixels = vec![1.5, -0.25, 0.5, 3.0];
        clip_and_reflect(&mut pixels, &[(0.0, 1.0)], 2, true);
        assert_eq!(pixels, vec![0.5, 0.25, 0.5, 0.0]);
        let mut pixels = vec![1.5, -0.25];
        clip_and_reflect(&mut pixels, &[(0.0, 1.0)], 2, false);
        assert_eq!(pixels, vec![1.0, 0.0]);
    }
}
