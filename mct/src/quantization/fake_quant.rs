//! Scalar fake quantization (quantize then dequantize) shared by the trainable quantizers.

const MIN_THRESHOLD: f32 = 1e-8;

/// Smallest power of two greater or equal to `max_abs`
pub fn power_of_two_threshold(max_abs: f32) -> f32 {
    2f32.powf(max_abs.max(MIN_THRESHOLD).log2().ceil())
}

/// Fake quantizes `x` on a grid of `2^n_bits` levels covering `[-threshold, threshold)`
/// when `signed`, `[0, threshold)` otherwise.
pub fn symmetric(x: f32, threshold: f32, n_bits: u8, signed: bool) -> f32 {
    let threshold = threshold.max(MIN_THRESHOLD);
    let levels = if signed {
        2f32.powi(n_bits as i32 - 1)
    } else {
        2f32.powi(n_bits as i32)
    };
    let delta = threshold / levels;
    let (lo, hi) = if signed {
        (-levels, levels - 1.0)
    } else {
        (0.0, levels - 1.0)
    };
    (x / delta).round().clamp(lo, hi) * delta
}

/// Moves `[min, max]` so that zero is exactly representable on the `n_bits` grid.
pub fn adjust_range_to_include_zero(min: f32, max: f32, n_bits: u8) -> (f32, f32) {
    let min = min.min(0.0);
    let max = max.max(0.0);
    if max - min < MIN_THRESHOLD {
        return (min, min + MIN_THRESHOLD);
    }
    let steps = 2f32.powi(n_bits as i32) - 1.0;
    let delta = (max - min) / steps;
    let zero_point = (-min / delta).round();
    let min_adj = -zero_point * delta;
    (min_adj, min_adj + steps * delta)
}

/// Fake quantizes `x` on a `2^n_bits` grid spanning `[min, max]`.
pub fn uniform(x: f32, min: f32, max: f32, n_bits: u8) -> f32 {
    let (min, max) = adjust_range_to_include_zero(min, max, n_bits);
    let steps = 2f32.powi(n_bits as i32) - 1.0;
    let delta = (max - min) / steps;
    ((x.clamp(min, max) - min) / delta).round() * delta + min
}

pub fn min_max(values: &[f32]) -> (f32, f32) {
    values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        })
}

pub fn max_abs(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_power_of_two_threshold() {
        assert_eq!(power_of_two_threshold(3.0), 4.0);
        assert_eq!(power_of_two_threshold(4.0), 4.0);
        assert_eq!(power_of_two_threshold(0.3), 0.5);
    }

    #[test]
    fn test_symmetric_grid() {
        // threshold 1 on 2 signed bits: grid {-1, -0.5, 0, 0.5}
        assert_eq!(symmetric(0.3, 1.0, 2, true), 0.5);
        assert_eq!(symmetric(2.0, 1.0, 2, true), 0.5);
        assert_eq!(symmetric(-2.0, 1.0, 2, true), -1.0);
        assert_eq!(symmetric(-0.2, 1.0, 2, false), 0.0);
    }

    #[test]
    fn test_uniform_keeps_zero() {
        let (lo, hi) = adjust_range_to_include_zero(0.5, 2.0, 8);
        assert_eq!(lo, 0.0);
        assert!((hi - 2.0).abs() < 1e-6);
        assert_eq!(uniform(0.0, -1.0, 3.0, 8), 0.0);
        assert!((uniform(5.0, -1.0, 3.0, 8) - 3.0).abs() < 1e-2);
    }
}
