use rand::{distributions::Distribution, Rng};
use statrs::distribution::Normal;

use super::{config::DataInitType, DataGenError};

fn normal(mean: f64, std: f64) -> Result<Normal, DataGenError> {
    Normal::new(mean, std).map_err(|e| DataGenError::Distribution(e.to_string()))
}

/// Pixels of `n_images` images of `pixels_per_image` values each, image after image
pub fn sample_images<R: Rng>(
    kind: DataInitType,
    n_images: usize,
    pixels_per_image: usize,
    rng: &mut R,
) -> Result<Vec<f32>, DataGenError> {
    let mut pixels = Vec::with_capacity(n_images * pixels_per_image);
    for _ in 0..n_images {
        let distribution = match kind {
            DataInitType::Gaussian => normal(0.0, 1.0)?,
            DataInitType::Diverse => {
                let mean = rng.gen_range(-1.0..1.0);
                let std = rng.gen_range(0.5..1.5);
                normal(mean, std)?
            }
        };
        pixels.extend((0..pixels_per_image).map(|_| distribution.sample(&mut *rng) as f32));
    }
    Ok(pixels)
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(DataInitType::Gaussian)]
    #[case(DataInitType::Diverse)]
    fn test_sample_is_seeded(#[case] kind: DataInitType) {
        let first = sample_images(kind, 3, 16, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        let second = sample_images(kind, 3, 16, &mut ChaCha8Rng::seed_from_u64(7)).unwrap();
        assert_eq!(first.len(), 48);
        assert_eq!(first, second);
        assert!(first.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_diverse_images_differ_in_mean() {
        let pixels =
            sample_images(DataInitType::Diverse, 2, 4096, &mut ChaCha8Rng::seed_from_u64(1))
                .unwrap();
        let means: Vec<f32> = pixels
            .chunks(4096)
            .map(|image| image.iter().sum::<f32>() / 4096.0)
            .collect();
        assert!((means[0] - means[1]).abs() > 1e-3);
    }
}
