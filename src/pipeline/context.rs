//! Segment context: the immutable name and stage lookup for one target layout.

use std::collections::HashMap;
use std::ops::Range;

use super::classifier::{LayerClassifier, LayerKind};
use super::planner::SegmentPlanner;
use super::stage::PipelineStage;
use crate::config::{SegmentMethod, TargetLayout};
use crate::meta::{extract_param_names_groupby_layer, CheckpointMeta, ParamNamesByLayer};

/// Stage assignment and canonical names of every parameter under a target
/// `(pp_degree, vpp_degree, segment_method)` layout.
///
/// The model is assumed to be an embedding, `transformer_layer_num` blocks,
/// a final norm and a head. Construction either succeeds completely or
/// returns the first violated invariant.
#[derive(Debug)]
pub struct SegmentContext {
    transformer_layer_num: usize,
    pp_degree: usize,
    vpp_degree: usize,
    segment_method: SegmentMethod,
    classifier: LayerClassifier,
    stages: Vec<PipelineStage>,
    stage_segments: Vec<Vec<Range<usize>>>,
    layer_name_to_index: HashMap<String, usize>,
    /// indexed by ordinal
    layer_index_to_stage: Vec<usize>,
}

impl SegmentContext {
    pub fn new(
        layout: &TargetLayout,
        classifier: LayerClassifier,
        param_names_by_layer: &ParamNamesByLayer,
    ) -> crate::Result<Self> {
        layout.validate()?;

        let transformer_layer_num =
            Self::resolve_transformer_layer_num(layout.transformer_layer_num, param_names_by_layer)?;
        let layer_num = transformer_layer_num + 3;

        let (layer_name_to_index, layer_index_to_name) =
            Self::index_layers(&classifier, param_names_by_layer, transformer_layer_num)?;

        let stage_segments = SegmentPlanner::new(
            layer_num,
            layout.pp_degree,
            layout.vpp_degree,
            layout.segment_method,
        )
        .plan()?;

        let mut stages = Vec::with_capacity(layout.pp_degree);
        let mut layer_index_to_stage = vec![usize::MAX; layer_num];
        for (stage_id, segments) in stage_segments.iter().enumerate() {
            let mut stage = PipelineStage::new();
            for segment in segments {
                stage.add_segment(segment.clone());
                for ordinal in segment.clone() {
                    let layer_name = layer_index_to_name[ordinal];
                    let params = param_names_by_layer.get(layer_name).ok_or_else(|| {
                        crate::ReshardError::Sequencing(format!("no parameters for {}", layer_name))
                    })?;
                    stage.add_layer(ordinal, layer_name, params)?;
                    layer_index_to_stage[ordinal] = stage_id;
                }
            }
            stages.push(stage);
        }

        for (stage_id, stage) in stages.iter_mut().enumerate() {
            stage.build_name_mapping()?;
            tracing::info!(
                "Stage {}: segments {:?}, {} parameters",
                stage_id,
                stage_segments[stage_id],
                stage.param_count()
            );
        }

        Ok(Self {
            transformer_layer_num,
            pp_degree: layout.pp_degree,
            vpp_degree: layout.vpp_degree,
            segment_method: layout.segment_method,
            classifier,
            stages,
            stage_segments,
            layer_name_to_index,
            layer_index_to_stage,
        })
    }

    /// Explicit count must match the catalogue; otherwise derive it as layers minus 3.
    fn resolve_transformer_layer_num(
        declared: Option<usize>,
        param_names_by_layer: &ParamNamesByLayer,
    ) -> crate::Result<usize> {
        let found = param_names_by_layer.len();
        match declared {
            Some(num) if num > 0 => {
                if found != num + 3 {
                    return Err(crate::ReshardError::ShapeMismatch {
                        expected: num + 3,
                        found,
                    });
                }
                Ok(num)
            }
            _ => {
                if found < 3 {
                    return Err(crate::ReshardError::ShapeMismatch { expected: 3, found });
                }
                Ok(found - 3)
            }
        }
    }

    /// Assign every logical layer its ordinal and check the assignment is a bijection.
    fn index_layers<'a>(
        classifier: &LayerClassifier,
        param_names_by_layer: &'a ParamNamesByLayer,
        transformer_layer_num: usize,
    ) -> crate::Result<(HashMap<String, usize>, Vec<&'a str>)> {
        let layer_num = transformer_layer_num + 3;
        let mut name_to_index = HashMap::with_capacity(layer_num);
        let mut index_to_name: Vec<Option<&str>> = vec![None; layer_num];

        for layer_name in param_names_by_layer.layer_names() {
            let layer = classifier.classify_required(layer_name)?;
            if let LayerKind::Block(idx) = layer.kind {
                if idx >= transformer_layer_num {
                    return Err(crate::ReshardError::ShapeMismatch {
                        expected: transformer_layer_num,
                        found: idx.saturating_add(1),
                    });
                }
            }
            let index = layer.kind.ordinal(transformer_layer_num).ok_or_else(|| {
                crate::ReshardError::Sequencing(format!("ordinal of {} overflows", layer_name))
            })?;
            if let Some(existing) = index_to_name[index] {
                return Err(crate::ReshardError::Sequencing(format!(
                    "ordinal {} claimed by both {} and {}",
                    index, existing, layer_name
                )));
            }
            index_to_name[index] = Some(layer_name);
            name_to_index.insert(layer_name.to_string(), index);
        }

        let index_to_name = index_to_name
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                name.ok_or_else(|| {
                    crate::ReshardError::Sequencing(format!("no layer at ordinal {}", index))
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok((name_to_index, index_to_name))
    }

    fn stage_of_layer(&self, layer_name: &str) -> crate::Result<(usize, usize)> {
        let index = *self.layer_name_to_index.get(layer_name).ok_or_else(|| {
            crate::ReshardError::Sequencing(format!("{} is not part of this context", layer_name))
        })?;
        Ok((index, self.layer_index_to_stage[index]))
    }

    /// Canonical name of a parameter under the target layout
    pub fn map_name(&self, param_name: &str, t_name: &str) -> crate::Result<String> {
        let layer = self.classifier.classify_required(param_name)?;
        let (_, stage_index) = self.stage_of_layer(&layer.name)?;
        self.stages[stage_index]
            .map_name(param_name, t_name)
            .map(str::to_string)
    }

    /// Physical stage in `[0, pp_degree)` that owns the parameter's layer
    pub fn map_name_to_stage(&self, name: &str) -> crate::Result<usize> {
        let layer = self.classifier.classify_required(name)?;
        let (_, stage_index) = self.stage_of_layer(&layer.name)?;
        Ok(stage_index)
    }

    /// Group layer names by owning stage, each group sorted by ordinal.
    pub fn segment_layers<S: AsRef<str>>(&self, layer_names: &[S]) -> crate::Result<Vec<Vec<String>>> {
        let mut layer_segments: Vec<Vec<(usize, String)>> = vec![Vec::new(); self.pp_degree];
        for layer_name in layer_names {
            let layer_name = layer_name.as_ref();
            let (index, stage_index) = self.stage_of_layer(layer_name)?;
            layer_segments[stage_index].push((index, layer_name.to_string()));
        }
        Ok(layer_segments
            .into_iter()
            .map(|mut segment| {
                segment.sort();
                segment.into_iter().map(|(_, name)| name).collect()
            })
            .collect())
    }

    /// Logical layer names in ordinal order
    pub fn layer_names(&self) -> Vec<String> {
        let mut layers: Vec<(usize, &String)> = self
            .layer_name_to_index
            .iter()
            .map(|(name, &index)| (index, name))
            .collect();
        layers.sort();
        layers.into_iter().map(|(_, name)| name.clone()).collect()
    }

    /// Segment ranges owned by each stage
    pub fn stage_segments(&self) -> &[Vec<Range<usize>>] {
        &self.stage_segments
    }

    /// (raw name, tensor name, canonical name) assigned on `stage`
    pub fn name_mapping(
        &self,
        stage: usize,
    ) -> crate::Result<impl Iterator<Item = (&str, &str, &str)>> {
        self.stages
            .get(stage)
            .map(|s| s.name_mapping())
            .ok_or_else(|| {
                crate::ReshardError::Sequencing(format!(
                    "stage {} out of range for pp_degree {}",
                    stage, self.pp_degree
                ))
            })
    }

    /// Log every stage's name mapping
    pub fn log_name_mapping(&self) {
        for (i, stage) in self.stages.iter().enumerate() {
            tracing::info!("{} stage {} {}", "=".repeat(30), i, "=".repeat(30));
            for (name, tensor_name, n_name) in stage.name_mapping() {
                tracing::info!("{} mapping {} => {}", name, tensor_name, n_name);
            }
        }
    }

    pub fn transformer_layer_num(&self) -> usize {
        self.transformer_layer_num
    }

    pub fn layer_num(&self) -> usize {
        self.transformer_layer_num + 3
    }

    pub fn pp_degree(&self) -> usize {
        self.pp_degree
    }

    pub fn vpp_degree(&self) -> usize {
        self.vpp_degree
    }

    pub fn segment_method(&self) -> SegmentMethod {
        self.segment_method
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

/// Build a [`SegmentContext`] for `layout` from the metadata of tensor-parallel rank `tp_rank`.
pub fn build_pipeline_context(
    meta: &CheckpointMeta,
    layout: &TargetLayout,
    classifier: LayerClassifier,
    tp_rank: usize,
) -> crate::Result<SegmentContext> {
    let layer_params = extract_param_names_groupby_layer(meta, &classifier, tp_rank)?;
    SegmentContext::new(layout, classifier, &layer_params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::LayerPatterns;

    /// Parameters of an ERNIE model with `blocks` transformer blocks, laid out
    /// the way a source checkpoint with global sub-layer counters names them.
    fn ernie_catalogue(blocks: usize) -> Vec<(String, String)> {
        let mut params = vec![(
            "ernie.embed_tokens.weight".to_string(),
            "embedding_0.w_0".to_string(),
        )];
        for b in 0..blocks {
            let proj = ["q_proj", "k_proj", "v_proj", "o_proj"];
            for (j, p) in proj.iter().enumerate() {
                let linear = b * 4 + j;
                params.push((
                    format!("ernie.layers.{}.self_attn.{}.weight", b, p),
                    format!("linear_{}.w_0", linear),
                ));
            }
            params.push((
                format!("ernie.layers.{}.input_layernorm.weight", b),
                format!("layer_norm_{}.w_0", b),
            ));
        }
        params.push((
            "ernie.norm.weight".to_string(),
            format!("layer_norm_{}.w_0", blocks),
        ));
        params.push((
            "lm_head.weight".to_string(),
            "create_parameter_0.w_0".to_string(),
        ));
        params
    }

    fn context(blocks: usize, layout: &TargetLayout) -> SegmentContext {
        let grouped =
            ParamNamesByLayer::from_catalogue(&LayerClassifier::default(), ernie_catalogue(blocks))
                .unwrap();
        SegmentContext::new(layout, LayerClassifier::default(), &grouped).unwrap()
    }

    #[test]
    fn test_uniform_stage_assignment() {
        let ctx = context(4, &TargetLayout::new(2, 1).with_transformer_layer_num(4));
        assert_eq!(ctx.layer_num(), 7);
        assert_eq!(ctx.stage_segments(), &[vec![0..3], vec![3..7]]);
        assert_eq!(ctx.map_name_to_stage("ernie.embed_tokens.weight").unwrap(), 0);
        assert_eq!(ctx.map_name_to_stage("ernie.layers.1.self_attn.q_proj.weight").unwrap(), 0);
        assert_eq!(ctx.map_name_to_stage("ernie.layers.2.self_attn.q_proj.weight").unwrap(), 1);
        assert_eq!(ctx.map_name_to_stage("lm_head.weight").unwrap(), 1);
    }

    #[test]
    fn test_by_layer_stage_assignment() {
        let layout = TargetLayout::new(2, 1).with_segment_method(SegmentMethod::Layer);
        let ctx = context(4, &layout);
        assert_eq!(ctx.transformer_layer_num(), 4);
        let groups = ctx.segment_layers(&ctx.layer_names()).unwrap();
        assert_eq!(
            groups,
            vec![
                vec!["ernie.embed_tokens", "ernie.layers.0", "ernie.layers.1"],
                vec!["ernie.layers.2", "ernie.layers.3", "ernie.norm", "lm_head"],
            ]
        );
    }

    #[test]
    fn test_canonical_names_restart_per_stage() {
        let ctx = context(4, &TargetLayout::new(2, 1));
        // stage 1 starts at ernie.layers.2 whose source counters are linear_8..11
        assert_eq!(
            ctx.map_name("ernie.layers.2.self_attn.q_proj.weight", "linear_8.w_0").unwrap(),
            "linear_0.w_0"
        );
        assert_eq!(
            ctx.map_name("ernie.layers.3.self_attn.o_proj.weight", "linear_15.w_0").unwrap(),
            "linear_7.w_0"
        );
        assert_eq!(
            ctx.map_name("ernie.norm.weight", "layer_norm_4.w_0").unwrap(),
            "layer_norm_2.w_0"
        );
        assert_eq!(
            ctx.map_name("lm_head.weight", "create_parameter_0.w_0").unwrap(),
            "create_parameter_0.w_0"
        );
        // stage 0
        assert_eq!(
            ctx.map_name("ernie.embed_tokens.weight", "embedding_0.w_0").unwrap(),
            "embedding_0.w_0"
        );
        assert_eq!(
            ctx.map_name("ernie.layers.1.input_layernorm.weight", "layer_norm_1.w_0").unwrap(),
            "layer_norm_1.w_0"
        );
    }

    #[test]
    fn test_source_invariance() {
        // Same model, saved from a 2-stage source: stage-local counters and a shuffled catalogue.
        let mut shifted = Vec::new();
        for (raw, tensor) in ernie_catalogue(4) {
            let (head, tail) = tensor.split_once('.').unwrap();
            let (role, idx) = head.rsplit_once('_').unwrap();
            let idx: usize = idx.parse().unwrap();
            let local = if raw.starts_with("ernie.layers.2")
                || raw.starts_with("ernie.layers.3")
                || raw.starts_with("ernie.norm")
            {
                match role {
                    "linear" => idx - 8,
                    "layer_norm" => idx - 2,
                    _ => idx,
                }
            } else {
                idx
            };
            shifted.push((raw, format!("{}_{}.{}", role, local, tail)));
        }
        shifted.reverse();

        let layout = TargetLayout::new(2, 2);
        let reference = context(4, &layout);
        let grouped = ParamNamesByLayer::from_catalogue(&LayerClassifier::default(), shifted.clone())
            .unwrap();
        let other = SegmentContext::new(&layout, LayerClassifier::default(), &grouped).unwrap();

        let unshifted: HashMap<String, String> = ernie_catalogue(4).into_iter().collect();
        for (raw, tensor) in &shifted {
            assert_eq!(
                reference.map_name(raw, &unshifted[raw]).unwrap(),
                other.map_name(raw, tensor).unwrap(),
                "{}",
                raw
            );
            assert_eq!(
                reference.map_name_to_stage(raw).unwrap(),
                other.map_name_to_stage(raw).unwrap()
            );
        }
    }

    #[test]
    fn test_stage_ownership_partition() {
        for (pp, vpp) in [(1, 1), (2, 1), (3, 1), (2, 2), (4, 2)] {
            let ctx = context(8, &TargetLayout::new(pp, vpp));
            let layers = ctx.layer_names();
            assert_eq!(layers.len(), 11);
            let groups = ctx.segment_layers(&layers).unwrap();
            assert_eq!(groups.len(), pp);
            let mut all: Vec<String> = groups.into_iter().flatten().collect();
            all.sort();
            let mut expected = layers.clone();
            expected.sort();
            assert_eq!(all, expected);

            for (raw, _) in ernie_catalogue(8) {
                assert!(ctx.map_name_to_stage(&raw).unwrap() < pp);
            }
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let grouped =
            ParamNamesByLayer::from_catalogue(&LayerClassifier::default(), ernie_catalogue(4))
                .unwrap();
        let layout = TargetLayout::new(2, 1).with_transformer_layer_num(6);
        let err = SegmentContext::new(&layout, LayerClassifier::default(), &grouped).unwrap_err();
        assert!(matches!(
            err,
            crate::ReshardError::ShapeMismatch { expected: 9, found: 7 }
        ));
    }

    #[test]
    fn test_gap_in_blocks_is_rejected() {
        let catalogue = vec![
            ("ernie.embed_tokens.weight", "embedding_0.w_0"),
            ("ernie.layers.0.mlp.up_proj.weight", "linear_0.w_0"),
            ("ernie.layers.2.mlp.up_proj.weight", "linear_1.w_0"),
            ("ernie.norm.weight", "layer_norm_0.w_0"),
            ("lm_head.weight", "create_parameter_0.w_0"),
        ];
        let grouped =
            ParamNamesByLayer::from_catalogue(&LayerClassifier::default(), catalogue).unwrap();
        let err = SegmentContext::new(&TargetLayout::new(1, 1), LayerClassifier::default(), &grouped)
            .unwrap_err();
        assert!(matches!(err, crate::ReshardError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_ordinal_is_rejected() {
        // "01" and "1" name different layers but the same block
        let catalogue = vec![
            ("ernie.embed_tokens.weight", "embedding_0.w_0"),
            ("ernie.layers.0.mlp.up_proj.weight", "linear_0.w_0"),
            ("ernie.layers.1.mlp.up_proj.weight", "linear_1.w_0"),
            ("ernie.layers.01.mlp.up_proj.weight", "linear_2.w_0"),
            ("ernie.norm.weight", "layer_norm_0.w_0"),
            ("lm_head.weight", "create_parameter_0.w_0"),
        ];
        let grouped =
            ParamNamesByLayer::from_catalogue(&LayerClassifier::default(), catalogue).unwrap();
        assert_eq!(grouped.len(), 6);
        let err = SegmentContext::new(&TargetLayout::new(1, 1), LayerClassifier::default(), &grouped)
            .unwrap_err();
        assert!(matches!(err, crate::ReshardError::Sequencing(_)));
    }

    #[test]
    fn test_huge_block_index_is_an_error() {
        let huge = "ernie.layers.18446744073709551615.mlp.weight";
        let mut catalogue = ernie_catalogue(1);
        catalogue.push((huge.to_string(), "linear_9.w_0".to_string()));
        assert!(matches!(
            ParamNamesByLayer::from_catalogue(&LayerClassifier::default(), catalogue),
            Err(crate::ReshardError::Classification(_))
        ));

        // a catalogue assembled without classification still fails cleanly
        let mut grouped =
            ParamNamesByLayer::from_catalogue(&LayerClassifier::default(), ernie_catalogue(1))
                .unwrap();
        grouped.push(
            "ernie.layers.18446744073709551615",
            huge.to_string(),
            "linear_9.w_0".to_string(),
        );
        let err = SegmentContext::new(&TargetLayout::new(1, 1), LayerClassifier::default(), &grouped)
            .unwrap_err();
        assert!(matches!(err, crate::ReshardError::Classification(_)));

        // the largest accepted index is out of range, not a panic
        let mut grouped =
            ParamNamesByLayer::from_catalogue(&LayerClassifier::default(), ernie_catalogue(1))
                .unwrap();
        grouped.push(
            "ernie.layers.18446744073709551614",
            "ernie.layers.18446744073709551614.mlp.weight".to_string(),
            "linear_9.w_0".to_string(),
        );
        let err = SegmentContext::new(&TargetLayout::new(1, 1), LayerClassifier::default(), &grouped)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::ReshardError::ShapeMismatch { expected: 2, found: usize::MAX }
        ));
    }

    #[test]
    fn test_unknown_lookups() {
        let ctx = context(2, &TargetLayout::new(2, 1));
        assert!(matches!(
            ctx.map_name_to_stage("ernie.layers.7.mlp.weight"),
            Err(crate::ReshardError::Sequencing(_))
        ));
        assert!(matches!(
            ctx.map_name_to_stage("encoder.weight"),
            Err(crate::ReshardError::Classification(_))
        ));
        assert!(matches!(
            ctx.map_name("ernie.norm.weight", "layer_norm_9.w_0"),
            Err(crate::ReshardError::NameConsistency(_))
        ));
        assert!(ctx.segment_layers(&["ernie.layers.9"]).is_err());
        assert!(ctx.name_mapping(2).is_err());
    }

    #[test]
    fn test_build_from_meta_llama() {
        let meta: CheckpointMeta = serde_json::from_value(serde_json::json!({
            "parallel_config": {"pp_degree": 1},
            "sharding_metas": {"tp00_pp00": {"structure_name_mapping": {
                "model.embed_tokens.weight": "embedding_0.w_0",
                "model.layers.0.mlp.up_proj.weight": "linear_0.w_0",
                "model.layers.1.mlp.up_proj.weight": "linear_1.w_0",
                "model.norm.weight": "layer_norm_0.w_0",
                "lm_head.weight": "linear_2.w_0"
            }}}
        }))
        .unwrap();
        let ctx = build_pipeline_context(
            &meta,
            &TargetLayout::new(2, 1),
            LayerClassifier::new(LayerPatterns::llama()),
            0,
        )
        .unwrap();
        assert_eq!(ctx.transformer_layer_num(), 2);
        assert_eq!(ctx.map_name_to_stage("model.layers.1.mlp.up_proj.weight").unwrap(), 1);
        assert_eq!(
            ctx.map_name("lm_head.weight", "linear_2.w_0").unwrap(),
            "linear_1.w_0"
        );
        let mapping: Vec<_> = ctx.name_mapping(1).unwrap().collect();
        assert_eq!(mapping.len(), 3);
    }
}
