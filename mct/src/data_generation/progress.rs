use serde::Serialize;
use tracing::info;

/// Losses of one outer iteration, averaged over the batches it optimized
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IterationReport {
    pub iteration: usize,
    pub total_loss: f32,
    pub bn_loss: f32,
    /// Already scaled by the output loss multiplier
    pub output_loss: f32,
    /// Batches in the order they were optimized
    pub batch_order: Vec<usize>,
}

/// Receives a report after every outer iteration of a run
pub trait ProgressObserver {
    fn observe(&self, report: &IterationReport);
}

impl<F: Fn(&IterationReport)> ProgressObserver for F {
    fn observe(&self, report: &IterationReport) {
        self(report)
    }
}

/// Logs one line every `every` iterations, starting with the first
#[derive(Clone, Copy, Debug)]
pub struct TracingProgress {
    pub every: usize,
}

impl Default for TracingProgress {
    fn default() -> Self {
        Self { every: 1 }
    }
}

impl ProgressObserver for TracingProgress {
    fn observe(&self, report: &IterationReport) {
        if report.iteration % self.every.max(1) == 0 {
            info!(
                iteration = report.iteration,
                total_loss = report.total_loss,
                bn_loss = report.bn_loss,
                output_loss = report.output_loss,
                "data generation"
            );
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn observe(&self, _report: &IterationReport) {}
}
