//! Checkpoint metadata: parallel config and per-shard structure name mappings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

use crate::pipeline::LayerClassifier;

/// Metadata stored next to a sharded checkpoint.
///
/// ```json
/// {
///   "parallel_config": {"pp_degree": 2, "mp_degree": 1},
///   "sharding_metas": {
///     "tp00_pp00": {"structure_name_mapping": {"ernie.embed_tokens.weight": "embedding_0.w_0"}}
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMeta {
    #[serde(default)]
    pub parallel_config: Option<Map<String, Value>>,

    #[serde(default)]
    pub sharding_metas: Map<String, Value>,
}

impl CheckpointMeta {
    /// Load metadata from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let meta: CheckpointMeta = serde_json::from_str(&content)?;
        Ok(meta)
    }

    /// Pipeline degree of the source checkpoint; accepts a number or a numeric string
    pub fn pp_degree(&self) -> crate::Result<usize> {
        let parallel_config = self.parallel_config.as_ref().ok_or_else(|| {
            crate::ReshardError::Config("metadata has no parallel_config".to_string())
        })?;
        let value = parallel_config.get("pp_degree").ok_or_else(|| {
            crate::ReshardError::Config("parallel_config has no pp_degree".to_string())
        })?;

        let pp_degree = match value {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().parse::<usize>().ok(),
            _ => None,
        };
        match pp_degree {
            Some(pp) if pp > 0 => Ok(pp),
            _ => Err(crate::ReshardError::Config(format!(
                "invalid pp_degree {}",
                value
            ))),
        }
    }

    /// Key of one (tensor-parallel rank, pipeline rank) shard, e.g. `tp00_pp01`
    pub fn shard_suffix(tp_rank: usize, pp_rank: usize) -> String {
        format!("tp{:02}_pp{:02}", tp_rank, pp_rank)
    }

    /// Ordered (raw name, tensor name) pairs of one shard.
    pub fn structure_name_mapping(
        &self,
        tp_rank: usize,
        pp_rank: usize,
    ) -> crate::Result<Vec<(String, String)>> {
        let suffix = Self::shard_suffix(tp_rank, pp_rank);
        let shard = self.sharding_metas.get(&suffix).ok_or_else(|| {
            crate::ReshardError::Config(format!("sharding_metas has no entry {}", suffix))
        })?;
        let mapping = shard
            .get("structure_name_mapping")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                crate::ReshardError::Config(format!(
                    "{} has no structure_name_mapping object",
                    suffix
                ))
            })?;

        mapping
            .iter()
            .map(|(k, v)| match v.as_str() {
                Some(t) => Ok((k.clone(), t.to_string())),
                None => Err(crate::ReshardError::Config(format!(
                    "{}: tensor name of {} is not a string",
                    suffix, k
                ))),
            })
            .collect()
    }
}

/// Parameters grouped by logical layer, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct ParamNamesByLayer {
    layers: Vec<(String, Vec<(String, String)>)>,
    index: HashMap<String, usize>,
}

impl ParamNamesByLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group a flat catalogue; every raw name must classify.
    pub fn from_catalogue<I, K, V>(classifier: &LayerClassifier, catalogue: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut grouped = Self::new();
        for (raw, tensor) in catalogue {
            let raw = raw.into();
            let layer = classifier.classify_required(&raw)?;
            grouped.push(&layer.name, raw, tensor.into());
        }
        Ok(grouped)
    }

    pub fn push(&mut self, layer_name: &str, raw_name: String, tensor_name: String) {
        let position = match self.index.get(layer_name) {
            Some(&position) => position,
            None => {
                self.layers.push((layer_name.to_string(), Vec::new()));
                self.index.insert(layer_name.to_string(), self.layers.len() - 1);
                self.layers.len() - 1
            }
        };
        self.layers[position].1.push((raw_name, tensor_name));
    }

    pub fn get(&self, layer_name: &str) -> Option<&[(String, String)]> {
        self.index
            .get(layer_name)
            .map(|&position| self.layers[position].1.as_slice())
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[(String, String)])> {
        self.layers
            .iter()
            .map(|(name, params)| (name.as_str(), params.as_slice()))
    }

    /// Number of distinct logical layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(|(_, params)| params.len()).sum()
    }
}

/// Collect the parameters of every source pipeline rank of `tp_rank`, grouped by layer.
pub fn extract_param_names_groupby_layer(
    meta: &CheckpointMeta,
    classifier: &LayerClassifier,
    tp_rank: usize,
) -> crate::Result<ParamNamesByLayer> {
    let pp_degree = meta.pp_degree()?;
    let mut grouped = ParamNamesByLayer::new();
    for pp_rank in 0..pp_degree {
        for (raw, tensor) in meta.structure_name_mapping(tp_rank, pp_rank)? {
            let layer = classifier.classify_required(&raw)?;
            grouped.push(&layer.name, raw, tensor);
        }
    }
    tracing::info!(
        "Collected {} parameters in {} layers from {} source stages",
        grouped.param_count(),
        grouped.len(),
        pp_degree
    );
    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample_meta() -> CheckpointMeta {
        serde_json::from_value(json!({
            "parallel_config": {"pp_degree": "2"},
            "sharding_metas": {
                "tp00_pp00": {"structure_name_mapping": {
                    "ernie.embed_tokens.weight": "embedding_0.w_0",
                    "ernie.layers.0.self_attn.q_proj.weight": "linear_0.w_0",
                    "ernie.layers.0.self_attn.q_proj.bias": "linear_0.b_0"
                }},
                "tp00_pp01": {"structure_name_mapping": {
                    "ernie.layers.1.self_attn.q_proj.weight": "linear_0.w_0",
                    "ernie.norm.weight": "layer_norm_0.w_0",
                    "lm_head.weight": "create_parameter_0.w_0"
                }}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_pp_degree_forms() {
        assert_eq!(sample_meta().pp_degree().unwrap(), 2);

        let meta: CheckpointMeta =
            serde_json::from_value(json!({"parallel_config": {"pp_degree": 4}})).unwrap();
        assert_eq!(meta.pp_degree().unwrap(), 4);

        let meta: CheckpointMeta = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(meta.pp_degree(), Err(crate::ReshardError::Config(_))));

        let meta: CheckpointMeta =
            serde_json::from_value(json!({"parallel_config": {"pp_degree": "two"}})).unwrap();
        assert!(matches!(meta.pp_degree(), Err(crate::ReshardError::Config(_))));
    }

    #[test]
    fn test_structure_name_mapping_keeps_order() {
        let mapping = sample_meta().structure_name_mapping(0, 0).unwrap();
        let names: Vec<&str> = mapping.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ernie.embed_tokens.weight",
                "ernie.layers.0.self_attn.q_proj.weight",
                "ernie.layers.0.self_attn.q_proj.bias",
            ]
        );
    }

    #[test]
    fn test_missing_shard_is_config_error() {
        let meta = sample_meta();
        assert!(matches!(
            meta.structure_name_mapping(1, 0),
            Err(crate::ReshardError::Config(_))
        ));
    }

    #[test]
    fn test_groupby_layer() {
        let grouped =
            extract_param_names_groupby_layer(&sample_meta(), &LayerClassifier::default(), 0)
                .unwrap();
        assert_eq!(grouped.len(), 5);
        assert_eq!(grouped.param_count(), 6);
        assert_eq!(
            grouped.layer_names().collect::<Vec<_>>(),
            vec![
                "ernie.embed_tokens",
                "ernie.layers.0",
                "ernie.layers.1",
                "ernie.norm",
                "lm_head"
            ]
        );
        assert_eq!(grouped.get("ernie.layers.0").unwrap().len(), 2);
    }

    #[test]
    fn test_unclassified_param_fails() {
        let meta: CheckpointMeta = serde_json::from_value(json!({
            "parallel_config": {"pp_degree": 1},
            "sharding_metas": {"tp00_pp00": {"structure_name_mapping": {
                "encoder.weight": "linear_0.w_0"
            }}}
        }))
        .unwrap();
        assert!(matches!(
            extract_param_names_groupby_layer(&meta, &LayerClassifier::default(), 0),
            Err(crate::ReshardError::Classification(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&sample_meta()).unwrap()).unwrap();
        let meta = CheckpointMeta::from_file(file.path()).unwrap();
        assert_eq!(meta.pp_degree().unwrap(), 2);
        assert_eq!(meta.structure_name_mapping(0, 1).unwrap().len(), 3);
    }
}
