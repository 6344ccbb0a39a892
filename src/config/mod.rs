//! Configuration module for the target pipeline layout.

mod layout_config;

pub use layout_config::{SegmentMethod, TargetLayout};
