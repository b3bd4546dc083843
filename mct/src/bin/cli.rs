use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use anyhow::Context;
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};
use mct::{
    data_generation::{generate_images, ConvBnNet, DataGenerationConfig, TracingProgress},
    qat::{build_graph_quantizers, QatConfig, QuantizerRegistry},
    quantization::{select_highest_bit_width, QuantizationConfigOptions},
    Graph, PipelineMode, SubstitutionPipeline,
};
use serde::Serialize;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

fn setup_logging(json: bool) -> anyhow::Result<()> {
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_target(true)
            .with_env_filter(filter())
            .with_span_events(FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("setting up logging")?;
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_target(true)
            .with_env_filter(filter())
            .with_span_events(FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("setting up logging")?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Should the logs be printed in json format or not
    #[arg(long, env, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Post training quantization
    Ptq,
    /// Quantization aware training
    Qat,
}

impl From<Mode> for PipelineMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Ptq => PipelineMode::PostTraining,
            Mode::Qat => PipelineMode::QuantizationAwareTraining,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Prepare a graph for quantization and build its trainable quantizers
    Compress {
        /// Path to the JSON graph to transform
        #[arg(short, long)]
        graph: PathBuf,

        #[arg(short, long, value_enum, default_value = "qat")]
        mode: Mode,

        /// Path to a JSON QAT config, defaults are used when absent
        #[arg(long, env)]
        qat_config: Option<PathBuf>,

        /// Where to write the transformed graph
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate images from a seeded random conv / batch-norm model
    Generate {
        /// Path to a JSON data generation config, defaults are used when absent
        #[arg(short, long, env)]
        config: Option<PathBuf>,

        #[arg(short, long, default_value = "8")]
        n_images: usize,

        #[arg(long, default_value = "16")]
        image_size: usize,

        /// Output channels of every conv / batch-norm block
        #[arg(long, value_delimiter = ',', default_value = "8,16")]
        blocks: Vec<usize>,

        #[arg(long, default_value = "10")]
        classes: usize,

        #[arg(long, default_value = "0")]
        model_seed: u64,

        /// Where to write the generated images
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct GeneratedImages {
    shape: Vec<usize>,
    images: Vec<Vec<f32>>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), value)
        .with_context(|| format!("writing {}", path.display()))
}

fn compress(
    graph_path: PathBuf,
    mode: Mode,
    qat_config: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let file = File::open(&graph_path)
        .with_context(|| format!("opening graph {}", graph_path.display()))?;
    let mut graph: Graph = serde_json::from_reader(file).context("parsing graph")?;
    graph.validate().context("validating input graph")?;

    let report = SubstitutionPipeline::for_mode(mode.into(), QuantizationConfigOptions::default())
        .run(&mut graph)
        .context("running substitutions")?;
    info!(applied = report.total_applied(), nodes = graph.len(), "graph transformed");
    select_highest_bit_width(&mut graph)?;

    if let Mode::Qat = mode {
        let qat_config = match qat_config {
            Some(path) => QatConfig::from_json_file(path)?,
            None => QatConfig::default(),
        };
        let quantizers =
            build_graph_quantizers(&graph, &qat_config, &QuantizerRegistry::default())?;
        for (id, node_quantizers) in &quantizers {
            info!(
                node = %graph.node(*id)?.name,
                weights = node_quantizers.weights.len(),
                activations = node_quantizers.activations.len(),
                "quantizers built"
            );
        }
    }

    if let Some(output) = output {
        write_json(&output, &graph)?;
        info!(path = %output.display(), "graph written");
    }
    Ok(())
}

fn generate(
    config: Option<PathBuf>,
    n_images: usize,
    image_size: usize,
    blocks: Vec<usize>,
    classes: usize,
    model_seed: u64,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => DataGenerationConfig::from_json_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DataGenerationConfig::builder().build()?,
    };
    let channels = config.image_normalization_type().mean_std().0.len();
    let device = Device::Cpu;
    let model = ConvBnNet::random(
        (channels, image_size, image_size),
        &blocks,
        classes,
        model_seed,
        &device,
    )?;
    let images = generate_images(&model, config, n_images, &device, &TracingProgress::default())?;
    info!(images = images.len(), "images generated");

    if let Some(output) = output {
        let generated = GeneratedImages {
            shape: vec![channels, image_size, image_size],
            images: images
                .iter()
                .map(|image| image.flatten_all()?.to_vec1::<f32>())
                .collect::<Result<_, _>>()?,
        };
        write_json(&output, &generated)?;
        info!(path = %output.display(), "images written");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.json)?;

    match args.command {
        Command::Compress {
            graph,
            mode,
            qat_config,
            output,
        } => compress(graph, mode, qat_config, output),
        Command::Generate {
            config,
            n_images,
            image_size,
            blocks,
            classes,
            model_seed,
            output,
        } => generate(
            config, n_images, image_size, blocks, classes, model_seed, output,
        ),
    }
}
