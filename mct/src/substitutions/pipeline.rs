use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{
    AttachQuantizationConfig, BatchNormFolding, RemoveIdentity, Substitution, SubstitutionError,
    WeightsActivationSplit,
};
use crate::{graph::Graph, quantization::QuantizationConfigOptions};

/// Which compression flow a graph is being prepared for
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    #[display("post_training")]
    PostTraining,
    #[display("quantization_aware_training")]
    QuantizationAwareTraining,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub name: String,
    /// Number of successful rewrites
    pub applied: usize,
    /// Number of sweeps over the graph, the last one applying nothing
    pub sweeps: usize,
}

/// What a pipeline run did, one entry per step in execution order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub steps: Vec<StepReport>,
}

impl PipelineReport {
    pub fn total_applied(&self) -> usize {
        self.steps.iter().map(|s| s.applied).sum()
    }
}

/// An ordered list of substitutions. Steps run one after the other, in insertion order.
#[derive(Debug, Default)]
pub struct SubstitutionPipeline {
    steps: Vec<Box<dyn Substitution>>,
}

impl SubstitutionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step<S: Substitution + 'static>(mut self, step: S) -> Self {
        self.push(Box::new(step));
        self
    }

    pub fn push(&mut self, step: Box<dyn Substitution>) {
        self.steps.push(step);
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Structural clean up followed by config attachment
    pub fn post_training(options: QuantizationConfigOptions) -> Self {
        Self::new()
            .with_step(RemoveIdentity::default())
            .with_step(BatchNormFolding::default())
            .with_step(AttachQuantizationConfig::new(options))
    }

    /// Like [`Self::post_training`] with kernel activations split out before configs are
    /// attached, so that QAT can train the two quantizers separately.
    pub fn qat(options: QuantizationConfigOptions) -> Self {
        Self::new()
            .with_step(RemoveIdentity::default())
            .with_step(BatchNormFolding::default())
            .with_step(WeightsActivationSplit::default())
            .with_step(AttachQuantizationConfig::new(options))
    }

    pub fn for_mode(mode: PipelineMode, options: QuantizationConfigOptions) -> Self {
        match mode {
            PipelineMode::PostTraining => Self::post_training(options),
            PipelineMode::QuantizationAwareTraining => Self::qat(options),
        }
    }

    /// Applies every step until it stops rewriting. A sweep walks the nodes in topological
    /// order as of the sweep start, skipping nodes removed by earlier rewrites; nodes created
    /// during a sweep are visited by the next one.
    #[instrument(name = "substitution_pipeline", skip_all, fields(steps = self.steps.len()))]
    pub fn run(&self, graph: &mut Graph) -> Result<PipelineReport, SubstitutionError> {
        let mut report = PipelineReport::default();
        for step in &self.steps {
            let mut applied = 0;
            let mut sweeps = 0;
            loop {
                sweeps += 1;
                let mut changed = 0;
                for id in graph.topological_order()? {
                    if !graph.contains(id) || !step.matcher().matches(graph.node(id)?) {
                        continue;
                    }
                    if step.substitute(graph, id)? {
                        debug!(step = step.name(), node = id, "rewrite applied");
                        changed += 1;
                    }
                }
                applied += changed;
                if changed == 0 {
                    break;
                }
            }
            if cfg!(debug_assertions) {
                graph.validate()?;
            }
            info!(step = step.name(), applied, sweeps, nodes = graph.len(), "substitution step done");
            report.steps.push(StepReport {
                name: step.name().to_string(),
                applied,
                sweeps,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        graph::{OpType, SplitRole, ACTIVATION_ATTR},
        testing::conv_bn_graph,
    };

    #[test]
    fn test_pipeline_order_is_preserved() {
        let options = QuantizationConfigOptions::default();
        let pipeline = SubstitutionPipeline::qat(options.clone());
        assert_eq!(pipeline.step_names(), vec![
            "remove_identity",
            "batchnorm_folding",
            "weights_activation_split",
            "attach_quantization_config"
        ]);
        let mut graph = conv_bn_graph().unwrap();
        let report = pipeline.run(&mut graph).unwrap();
        let ran: Vec<_> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(ran, pipeline.step_names());
        assert!(report.steps.iter().all(|s| s.sweeps >= 1));

        assert_eq!(
            SubstitutionPipeline::for_mode(PipelineMode::PostTraining, options).step_names(),
            vec![
                "remove_identity",
                "batchnorm_folding",
                "attach_quantization_config"
            ]
        );
    }

    #[test]
    fn test_qat_pipeline_end_state() {
        let mut graph = conv_bn_graph().unwrap();
        let report = SubstitutionPipeline::qat(QuantizationConfigOptions::default())
            .run(&mut graph)
            .unwrap();
        // identity and bn gone, dense softmax split
        assert_eq!(report.steps[0].applied, 1);
        assert_eq!(report.steps[1].applied, 1);
        assert_eq!(report.steps[2].applied, 1);
        graph.validate().unwrap();
        assert!(graph.nodes().all(|(_, n)| n.op != OpType::BatchNorm));
        assert!(graph.nodes().all(|(_, n)| !n.candidates().is_empty()));
        let softmax = graph
            .nodes()
            .find(|(_, n)| n.attribute(ACTIVATION_ATTR) == Some(&"softmax".into()))
            .map(|(_, n)| n)
            .unwrap();
        assert_eq!(softmax.op, OpType::Activation);
        assert_eq!(softmax.split_role(), Some(SplitRole::Activation));
        assert_eq!(graph.len(), 6);
    }

    #[test]
    fn test_pipeline_keeps_dag_invariant() {
        let mut graph = conv_bn_graph().unwrap();
        for mode in [
            PipelineMode::PostTraining,
            PipelineMode::QuantizationAwareTraining,
        ] {
            SubstitutionPipeline::for_mode(mode, QuantizationConfigOptions::default())
                .run(&mut graph)
                .unwrap();
            graph.validate().unwrap();
            let order = graph.topological_order().unwrap();
            assert_eq!(order.len(), graph.len());
            for edge in graph.edges() {
                assert!(graph.contains(edge.source) && graph.contains(edge.sink));
            }
        }
    }
}
