//! Per batch optimizers and learning rate schedulers.
//!
//! Both work on the flattened image data of one batch; gradients are computed by candle and
//! applied here.

use rayon::prelude::*;

use super::config::{OptimizerType, SchedulerType};

#[derive(Clone, Debug)]
pub enum ImageOptimizer {
    Sgd,
    Adam {
        beta1: f32,
        beta2: f32,
        eps: f32,
        t: i32,
        m: Vec<f32>,
        v: Vec<f32>,
    },
}

impl ImageOptimizer {
    pub fn new(kind: OptimizerType, len: usize) -> Self {
        match kind {
            OptimizerType::Sgd => Self::Sgd,
            OptimizerType::Adam => Self::Adam {
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                t: 0,
                m: vec![0.0; len],
                v: vec![0.0; len],
            },
        }
    }

    /// Applies one update of `params` along `grads`
    pub fn step(&mut self, params: &mut [f32], grads: &[f32], lr: f32) {
        match self {
            Self::Sgd => params
                .par_iter_mut()
                .zip(grads.par_iter())
                .for_each(|(p, g)| *p -= lr * g),
            Self::Adam {
                beta1,
                beta2,
                eps,
                t,
                m,
                v,
            } => {
                *t += 1;
                let (beta1, beta2, eps) = (*beta1, *beta2, *eps);
                let bias_correction1 = 1.0 - beta1.powi(*t);
                let bias_correction2 = 1.0 - beta2.powi(*t);
                params
                    .par_iter_mut()
                    .zip(grads.par_iter())
                    .zip(m.par_iter_mut().zip(v.par_iter_mut()))
                    .for_each(|((p, g), (m, v))| {
                        *m = beta1 * *m + (1.0 - beta1) * g;
                        *v = beta2 * *v + (1.0 - beta2) * g * g;
                        let m_hat = *m / bias_correction1;
                        let v_hat = *v / bias_correction2;
                        *p -= lr * m_hat / (v_hat.sqrt() + eps);
                    });
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum Scheduler {
    /// Multiplies the rate by `gamma` every `step_size` steps
    Step {
        lr: f32,
        step_size: usize,
        gamma: f32,
        steps: usize,
    },
    /// Multiplies the rate by `factor` once the loss stopped improving for `patience` steps
    ReduceOnPlateau {
        lr: f32,
        factor: f32,
        patience: usize,
        min_lr: f32,
        threshold: f32,
        best: f32,
        bad_steps: usize,
    },
}

impl Scheduler {
    /// Scheduler of a run of `n_iter` iterations
    pub fn new(kind: SchedulerType, initial_lr: f32, n_iter: usize) -> Self {
        match kind {
            SchedulerType::Step => Self::Step {
                lr: initial_lr,
                step_size: (n_iter / 10).max(1),
                gamma: 0.5,
                steps: 0,
            },
            SchedulerType::ReduceOnPlateau => Self::ReduceOnPlateau {
                lr: initial_lr,
                factor: 0.5,
                patience: (n_iter / 50).max(1),
                min_lr: 1e-4,
                threshold: 1e-4,
                best: f32::INFINITY,
                bad_steps: 0,
            },
        }
    }

    pub fn lr(&self) -> f32 {
        match self {
            Self::Step { lr, .. } | Self::ReduceOnPlateau { lr, .. } => *lr,
        }
    }

    /// Records the end of one optimization step with its `loss`
    pub fn step(&mut self, loss: f32) {
        match self {
            Self::Step {
                lr,
                step_size,
                gamma,
                steps,
            } => {
                *steps += 1;
                if *steps % *step_size == 0 {
                    *lr *= *gamma;
                }
            }
            Self::ReduceOnPlateau {
                lr,
                factor,
                patience,
                min_lr,
                threshold,
                best,
                bad_steps,
            } => {
                if loss < *best * (1.0 - *threshold) {
                    *best = loss;
                    *bad_steps = 0;
                } else {
                    *bad_steps += 1;
                }
                if *bad_steps > *patience {
                    *lr = (*lr * *factor).max(*min_lr);
                    *bad_steps = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_step_scheduler_halves_at_boundary() {
        let mut scheduler = Scheduler::new(SchedulerType::Step, 8.0, 30);
        for _ in 0..2 {
            scheduler.step(1.0);
        }
        assert_eq!(scheduler.lr(), 8.0);
        scheduler.step(1.0);
        assert_eq!(scheduler.lr(), 4.0);
        for _ in 0..3 {
            scheduler.step(1.0);
        }
        assert_eq!(scheduler.lr(), 2.0);
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        // patience of 2 steps
        let mut scheduler = Scheduler::new(SchedulerType::ReduceOnPlateau, 1.0, 100);
        scheduler.step(10.0);
        scheduler.step(9.0);
        scheduler.step(9.0);
        scheduler.step(9.5);
        assert_eq!(scheduler.lr(), 1.0);
        scheduler.step(9.0);
        assert_eq!(scheduler.lr(), 0.5);
        // improving again keeps the rate
        scheduler.step(1.0);
        scheduler.step(0.5);
        assert_eq!(scheduler.lr(), 0.5);
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let mut scheduler = Scheduler::new(SchedulerType::ReduceOnPlateau, 2e-4, 1);
        for _ in 0..10 {
            scheduler.step(1.0);
        }
        assert_eq!(scheduler.lr(), 1e-4);
    }

    #[test]
    fn test_sgd_and_adam_descend() {
        let grads = [1.0, -2.0];
        let mut params = [0.0, 0.0];
        ImageOptimizer::new(OptimizerType::Sgd, 2).step(&mut params, &grads, 0.5);
        assert_eq!(params, [-0.5, 1.0]);

        // the first bias corrected adam step moves every parameter by lr against its gradient sign
        let mut params = [0.0, 0.0];
        let mut adam = ImageOptimizer::new(OptimizerType::Adam, 2);
        adam.step(&mut params, &grads, 0.1);
        assert!((params[0] + 0.1).abs() < 1e-5);
        assert!((params[1] - 0.1).abs() < 1e-5);
    }
}
