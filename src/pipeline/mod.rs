//! Layer segmentation and canonical naming for a target pipeline layout.
//!
//! This module provides:
//! - `LayerClassifier`: Map raw parameter names to logical layers and ordinals
//! - `LayerRenamer`: Rewrite sub-layer names with per-stage occurrence counters
//! - `SegmentPlanner`: Cut the layer ordinals into (virtual) pipeline segments
//! - `PipelineStage`: Per-stage segments, layers and name mapping
//! - `SegmentContext`: The assembled, read-only lookup used while resharding

mod classifier;
mod context;
mod naming;
mod planner;
mod stage;

pub use classifier::{LayerClassifier, LayerKind, LayerPatterns, LogicalLayer};
pub use context::{build_pipeline_context, SegmentContext};
pub use naming::{LayerRenamer, LayerRole};
pub use planner::SegmentPlanner;
pub use stage::{PipelineLayer, PipelineSegment, PipelineStage};
