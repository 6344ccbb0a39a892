//! Source checkpoint metadata and the per-layer parameter catalogue.

mod checkpoint_meta;

pub use checkpoint_meta::{extract_param_names_groupby_layer, CheckpointMeta, ParamNamesByLayer};
