//! Target pipeline layout for a resharding pass.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Policy used to cut the layer ordinals into pipeline segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentMethod {
    /// Near-equal ranges, remainder handed to the trailing segments
    #[default]
    Uniform,
    /// Cut by transformer-block weight; embedding, norm and head weigh nothing
    Layer,
}

impl SegmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentMethod::Uniform => "uniform",
            SegmentMethod::Layer => "layer",
        }
    }
}

impl FromStr for SegmentMethod {
    type Err = crate::ReshardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uniform" => Ok(SegmentMethod::Uniform),
            "layer" => Ok(SegmentMethod::Layer),
            other => Err(crate::ReshardError::Config(format!(
                "unknown segment method '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SegmentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination layout: pipeline degrees, segmentation policy and model depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLayout {
    /// Number of transformer blocks; derived from the metadata when unset
    #[serde(default)]
    pub transformer_layer_num: Option<usize>,

    /// Number of physical pipeline stages
    pub pp_degree: usize,

    /// Virtual pipeline chunks per physical stage
    #[serde(default = "default_vpp_degree")]
    pub vpp_degree: usize,

    /// Segmentation policy
    #[serde(default)]
    pub segment_method: SegmentMethod,
}

fn default_vpp_degree() -> usize {
    1
}

impl TargetLayout {
    /// Create a layout with the uniform policy and a derived layer count
    pub fn new(pp_degree: usize, vpp_degree: usize) -> Self {
        Self {
            transformer_layer_num: None,
            pp_degree,
            vpp_degree,
            segment_method: SegmentMethod::Uniform,
        }
    }

    /// Load a layout from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let layout: TargetLayout = serde_json::from_str(&content)?;
        layout.validate()?;
        Ok(layout)
    }

    /// Set the declared number of transformer blocks
    pub fn with_transformer_layer_num(mut self, num: usize) -> Self {
        self.transformer_layer_num = Some(num);
        self
    }

    /// Set the segmentation policy
    pub fn with_segment_method(mut self, method: SegmentMethod) -> Self {
        self.segment_method = method;
        self
    }

    /// Total number of pipeline segments (`pp_degree * vpp_degree`)
    pub fn stage_num(&self) -> usize {
        self.pp_degree * self.vpp_degree
    }

    /// Reject degenerate degrees before any planning happens.
    pub fn validate(&self) -> crate::Result<()> {
        if self.pp_degree == 0 {
            return Err(crate::ReshardError::Config("pp_degree must be at least 1".to_string()));
        }
        if self.vpp_degree == 0 {
            return Err(crate::ReshardError::Config("vpp_degree must be at least 1".to_string()));
        }
        if self.transformer_layer_num == Some(0) {
            return Err(crate::ReshardError::Config(
                "transformer_layer_num must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
