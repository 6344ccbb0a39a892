//! pp-reshard CLI - inspect how a checkpoint maps onto a new pipeline layout
//!
//! Reads the checkpoint metadata, builds the segment context for the requested
//! target layout and prints stage assignments and canonical parameter names.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};

use pp_reshard::{
    build_pipeline_context, extract_param_names_groupby_layer, CheckpointMeta, LayerClassifier,
    LayerPatterns, SegmentContext, SegmentMethod, TargetLayout,
};

#[derive(Parser)]
#[command(name = "pp-reshard")]
#[command(author, version, about = "Pipeline-parallel checkpoint resharding planner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print segment ranges and the canonical name mapping of every target stage
    Plan {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Print the logical layers owned by every target stage
    Layers {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show the layers and parameter counts recorded in the metadata
    Info {
        /// Checkpoint metadata JSON
        #[arg(short, long, env = "PP_RESHARD_META")]
        meta: PathBuf,

        /// Tensor-parallel rank whose shards are listed
        #[arg(long, default_value = "0")]
        tp_rank: usize,

        /// Parameter naming scheme of the checkpoint
        #[arg(long, value_enum, default_value = "ernie")]
        arch: ArchMode,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Checkpoint metadata JSON
    #[arg(short, long, env = "PP_RESHARD_META")]
    meta: PathBuf,

    /// Target layout JSON (overrides --pp, --vpp, --method and --layers)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target pipeline degree
    #[arg(long, default_value = "1")]
    pp: usize,

    /// Target virtual pipeline degree
    #[arg(long, default_value = "1")]
    vpp: usize,

    /// Segmentation policy
    #[arg(long, value_enum, default_value = "uniform")]
    method: MethodMode,

    /// Number of transformer blocks (derived from the metadata if omitted)
    #[arg(long)]
    layers: Option<usize>,

    /// Tensor-parallel rank whose metadata drives the naming
    #[arg(long, default_value = "0")]
    tp_rank: usize,

    /// Parameter naming scheme of the checkpoint
    #[arg(long, value_enum, default_value = "ernie")]
    arch: ArchMode,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum MethodMode {
    Uniform,
    Layer,
}

impl From<MethodMode> for SegmentMethod {
    fn from(mode: MethodMode) -> Self {
        match mode {
            MethodMode::Uniform => SegmentMethod::Uniform,
            MethodMode::Layer => SegmentMethod::Layer,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ArchMode {
    Ernie,
    Llama,
}

impl From<ArchMode> for LayerPatterns {
    fn from(mode: ArchMode) -> Self {
        match mode {
            ArchMode::Ernie => LayerPatterns::ernie(),
            ArchMode::Llama => LayerPatterns::llama(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pp_reshard=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { target } => {
            let context = load_context(&target)?;
            show_plan(&context)?;
        }

        Commands::Layers { target } => {
            let context = load_context(&target)?;
            show_layers(&context)?;
        }

        Commands::Info { meta, tp_rank, arch } => {
            show_info(&meta, tp_rank, arch.into())?;
        }
    }

    Ok(())
}

fn load_context(target: &TargetArgs) -> anyhow::Result<SegmentContext> {
    let meta = CheckpointMeta::from_file(&target.meta)?;

    let layout = match &target.config {
        Some(path) => TargetLayout::from_file(path)?,
        None => {
            let mut layout = TargetLayout::new(target.pp, target.vpp)
                .with_segment_method(target.method.into());
            layout.transformer_layer_num = target.layers;
            layout
        }
    };

    let classifier = LayerClassifier::new(target.arch.into());
    let context = build_pipeline_context(&meta, &layout, classifier, target.tp_rank)?;
    Ok(context)
}

fn show_plan(context: &SegmentContext) -> anyhow::Result<()> {
    println!("Target Layout");
    println!("=============");
    println!("Transformer layers: {}", context.transformer_layer_num());
    println!("Logical layers: {}", context.layer_num());
    println!("PP degree: {}", context.pp_degree());
    println!("VPP degree: {}", context.vpp_degree());
    println!("Segment method: {}", context.segment_method());

    for stage in 0..context.stage_count() {
        println!("\n{} stage {} {}", "=".repeat(30), stage, "=".repeat(30));
        println!("Segments: {:?}", context.stage_segments()[stage]);
        for (name, tensor_name, n_name) in context.name_mapping(stage)? {
            println!("{} mapping {} => {}", name, tensor_name, n_name);
        }
    }
    Ok(())
}

fn show_layers(context: &SegmentContext) -> anyhow::Result<()> {
    let groups = context.segment_layers(&context.layer_names())?;
    for (stage, layers) in groups.iter().enumerate() {
        println!("Stage {} ({} layers)", stage, layers.len());
        for layer in layers {
            println!("  {}", layer);
        }
    }
    Ok(())
}

fn show_info(meta_path: &Path, tp_rank: usize, patterns: LayerPatterns) -> anyhow::Result<()> {
    let meta = CheckpointMeta::from_file(meta_path)?;
    let classifier = LayerClassifier::new(patterns);
    let grouped = extract_param_names_groupby_layer(&meta, &classifier, tp_rank)?;

    println!("Checkpoint Information");
    println!("======================");
    println!("Source PP degree: {}", meta.pp_degree()?);
    println!("Logical layers: {}", grouped.len());
    println!("Parameters: {}", grouped.param_count());

    println!("\nParameters per layer");
    println!("====================");
    for (layer, params) in grouped.iter() {
        println!("{}: {}", layer, params.len());
    }
    Ok(())
}
