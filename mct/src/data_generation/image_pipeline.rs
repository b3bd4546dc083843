use candle_core::{Result, Tensor};
use rand::Rng;

use super::config::ImagePipelineType;

/// Augmentations applied to the optimized images before every forward pass, and the final
/// crop once optimization is over
#[derive(Clone, Debug)]
pub struct ImagePipeline {
    kind: ImagePipelineType,
    output_size: (usize, usize),
    extra_pixels: usize,
}

impl ImagePipeline {
    pub fn new(kind: ImagePipelineType, output_size: (usize, usize), extra_pixels: usize) -> Self {
        // nothing ever crops the margin away without augmentation
        let extra_pixels = match kind {
            ImagePipelineType::Identity => 0,
            ImagePipelineType::RandomCrop | ImagePipelineType::RandomCropFlip => extra_pixels,
        };
        Self {
            kind,
            output_size,
            extra_pixels,
        }
    }

    /// `(height, width)` of the images being optimized
    pub fn image_input_size(&self) -> (usize, usize) {
        let (h, w) = self.output_size;
        (h + self.extra_pixels, w + self.extra_pixels)
    }

    pub fn image_output_size(&self) -> (usize, usize) {
        self.output_size
    }

    /// Random view of `images` `(batch, channels, H, W)` at the output size. Every op is
    /// differentiable, so gradients flow back to the full images.
    pub fn image_input_manipulation<R: Rng>(&self, images: &Tensor, rng: &mut R) -> Result<Tensor> {
        match self.kind {
            ImagePipelineType::Identity => Ok(images.clone()),
            ImagePipelineType::RandomCrop => self.random_crop(images, rng),
            ImagePipelineType::RandomCropFlip => {
                let cropped = self.random_crop(images, rng)?;
                if rng.gen_bool(0.5) {
                    flip_horizontal(&cropped)
                } else {
                    Ok(cropped)
                }
            }
        }
    }

    /// Center crop of `images` to the output size
    pub fn image_output_finalize(&self, images: &Tensor) -> Result<Tensor> {
        let margin = self.extra_pixels / 2;
        self.crop(images, margin, margin)
    }

    fn random_crop<R: Rng>(&self, images: &Tensor, rng: &mut R) -> Result<Tensor> {
        let top = rng.gen_range(0..=self.extra_pixels);
        let left = rng.gen_range(0..=self.extra_pixels);
        self.crop(images, top, left)
    }

    fn crop(&self, images: &Tensor, top: usize, left: usize) -> Result<Tensor> {
        let (h, w) = self.output_size;
        images.narrow(2, top, h)?.narrow(3, left, w)
    }
}

fn flip_horizontal(images: &Tensor) -> Result<Tensor> {
    let width = images.dim(3)?;
    let reversed: Vec<u32> = (0..width as u32).rev().collect();
    let index = Tensor::from_vec(reversed, width, images.device())?;
    images.index_select(&index, 3)
}

#[cfg(test)]
mod test {
    use candle_core::Device;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn ramp(h: usize, w: usize) -> Result<Tensor> {
        Tensor::arange(0f32, (h * w) as f32, &Device::Cpu)?.reshape((1, 1, h, w))
    }

    #[test]
    fn test_sizes() {
        let pipeline = ImagePipeline::new(ImagePipelineType::RandomCropFlip, (8, 8), 2);
        assert_eq!(pipeline.image_input_size(), (10, 10));
        assert_eq!(pipeline.image_output_size(), (8, 8));
        let identity = ImagePipeline::new(ImagePipelineType::Identity, (8, 8), 2);
        assert_eq!(identity.image_input_size(), (8, 8));
    }

    #[test]
    fn test_manipulation_keeps_output_size() -> Result<()> {
        let pipeline = ImagePipeline::new(ImagePipelineType::RandomCropFlip, (3, 3), 2);
        let images = ramp(5, 5)?;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..8 {
            let view = pipeline.image_input_manipulation(&images, &mut rng)?;
            assert_eq!(view.dims(), &[1, 1, 3, 3]);
        }
        Ok(())
    }

    #[test]
    fn test_center_crop_and_flip() -> Result<()> {
        let pipeline = ImagePipeline::new(ImagePipelineType::RandomCrop, (2, 2), 2);
        let images = ramp(4, 4)?;
        let center = pipeline.image_output_finalize(&images)?;
        assert_eq!(center.flatten_all()?.to_vec1::<f32>()?, vec![5.0, 6.0, 9.0, 10.0]);
        let flipped = flip_horizontal(&center)?;
        assert_eq!(flipped.flatten_all()?.to_vec1::<f32>()?, vec![6.0, 5.0, 10.0, 9.0]);
        Ok(())
    }
}
