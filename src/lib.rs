//! # pp-reshard
//!
//! Converts a checkpoint sharded for one pipeline-parallel layout into names
//! and stage assignments valid for another, without re-running training.
//!
//! ## Core Concept
//!
//! Parameter names in a pipeline checkpoint encode where a parameter lived:
//! which stage, and which occurrence of a sub-layer type on that stage.
//! Re-sharding therefore needs to:
//! - **Classify** every raw parameter name into a logical layer with a dense ordinal
//! - **Segment** the ordinal range into `pp_degree * vpp_degree` contiguous ranges
//! - **Rename** every parameter with a per-stage counter tree so the result does
//!   not depend on how the source checkpoint was sharded
//! - **Exchange** the source states between target ranks and split them by stage
//!
//! ## Example
//!
//! ```ignore
//! use pp_reshard::{
//!     build_pipeline_context, CheckpointMeta, LayerClassifier, SegmentMethod, TargetLayout,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let meta = CheckpointMeta::from_file("model_meta.json")?;
//!     let layout = TargetLayout::new(4, 2).with_segment_method(SegmentMethod::Layer);
//!     let context = build_pipeline_context(&meta, &layout, LayerClassifier::default(), 0)?;
//!     let stage = context.map_name_to_stage("ernie.layers.3.mlp.up_proj.weight")?;
//!     println!("stage {}", stage);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod meta;
pub mod pipeline;
pub mod reshard;

// Re-exports for convenience
pub use config::{SegmentMethod, TargetLayout};
pub use meta::{extract_param_names_groupby_layer, CheckpointMeta, ParamNamesByLayer};
pub use pipeline::{
    build_pipeline_context, LayerClassifier, LayerKind, LayerPatterns, LayerRenamer, LayerRole,
    PipelineStage, SegmentContext, SegmentPlanner,
};
pub use reshard::{
    convert_pp_in_group, CollectiveGroup, LocalGroup, LocalTopology, NodeModelState, OptKey,
    ParamKey, StateCache, Topology,
};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum ReshardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unclassified parameter: {0}")]
    Classification(String),

    #[error("Shape mismatch: expected {expected} logical layers, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("Sequencing error: {0}")]
    Sequencing(String),

    #[error("Name consistency error: {0}")]
    NameConsistency(String),

    #[error("Collective failure: {0}")]
    Collective(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReshardError>;
