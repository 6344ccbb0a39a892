//! Pipeline stages, their segments and the layers inside them.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::Range;

use super::naming::LayerRenamer;

/// A logical layer with its (raw name, tensor name) pairs sorted by tensor name.
#[derive(Debug, Clone)]
pub struct PipelineLayer {
    name: String,
    params: Vec<(String, String)>,
}

impl PipelineLayer {
    pub fn new(name: impl Into<String>, params: &[(String, String)]) -> Self {
        let mut params = params.to_vec();
        // sub-layers of the same type must come out in creation order
        params.sort_by(|a, b| tensor_name_cmp(&a.1, &b.1));
        Self {
            name: name.into(),
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

/// Orders tensor names by their digit runs numerically, so `linear_9.w_0`
/// precedes `linear_10.w_0`.
fn tensor_name_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        let a_digit = a.as_bytes()[0].is_ascii_digit();
        let b_digit = b.as_bytes()[0].is_ascii_digit();
        let a_len = chunk_len(a, a_digit);
        let b_len = chunk_len(b, b_digit);
        let (a_chunk, b_chunk) = (&a[..a_len], &b[..b_len]);

        let ord = if a_digit && b_digit {
            let a_num = a_chunk.trim_start_matches('0');
            let b_num = b_chunk.trim_start_matches('0');
            a_num
                .len()
                .cmp(&b_num.len())
                .then_with(|| a_num.cmp(b_num))
                .then_with(|| a_chunk.len().cmp(&b_chunk.len()))
        } else {
            a_chunk.cmp(b_chunk)
        };
        if ord != Ordering::Equal {
            return ord;
        }
        a = &a[a_len..];
        b = &b[b_len..];
    }
}

fn chunk_len(s: &str, digit: bool) -> usize {
    s.char_indices()
        .find(|(_, c)| c.is_ascii_digit() != digit)
        .map_or(s.len(), |(i, _)| i)
}

/// Half-open ordinal range filled with exactly `end - start` layers.
#[derive(Debug)]
pub struct PipelineSegment {
    range: Range<usize>,
    layers: Vec<PipelineLayer>,
}

impl PipelineSegment {
    pub fn new(range: Range<usize>) -> Self {
        Self {
            range,
            layers: Vec::new(),
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    fn add_layer(&mut self, layer: PipelineLayer) -> crate::Result<()> {
        if self.range.start + self.layers.len() >= self.range.end {
            return Err(crate::ReshardError::Sequencing(format!(
                "segment {:?} is already full, cannot add {}",
                self.range,
                layer.name()
            )));
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Layers in ordinal order; fails until the segment is full.
    pub fn layers(&self) -> crate::Result<&[PipelineLayer]> {
        if self.range.start + self.layers.len() != self.range.end {
            return Err(crate::ReshardError::Sequencing(format!(
                "segment {:?} holds {} layers, expected {}",
                self.range,
                self.layers.len(),
                self.range.len()
            )));
        }
        Ok(&self.layers)
    }
}

/// One physical pipeline stage with its private renaming tree.
#[derive(Debug, Default)]
pub struct PipelineStage {
    renamer: LayerRenamer,
    segments: Vec<PipelineSegment>,
    /// layer ordinal -> position in `segments`
    layer_to_segment: HashMap<usize, usize>,
    /// raw parameter name -> (tensor name, canonical name)
    param_to_tname: HashMap<String, (String, String)>,
    mapping_order: Vec<String>,
    built: bool,
}

impl PipelineStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_segment(&mut self, range: Range<usize>) {
        let position = self.segments.len();
        for ordinal in range.clone() {
            self.layer_to_segment.insert(ordinal, position);
        }
        self.segments.push(PipelineSegment::new(range));
    }

    pub fn add_layer(
        &mut self,
        ordinal: usize,
        layer_name: &str,
        params: &[(String, String)],
    ) -> crate::Result<()> {
        let position = *self.layer_to_segment.get(&ordinal).ok_or_else(|| {
            crate::ReshardError::Sequencing(format!(
                "layer {} (ordinal {}) falls in no segment of this stage",
                layer_name, ordinal
            ))
        })?;
        self.segments[position].add_layer(PipelineLayer::new(layer_name, params))
    }

    pub fn segments(&self) -> &[PipelineSegment] {
        &self.segments
    }

    /// Rename every parameter on the stage, segment by segment and layer by layer.
    pub fn build_name_mapping(&mut self) -> crate::Result<()> {
        if self.built {
            return Err(crate::ReshardError::Sequencing(
                "name mapping of a stage can only be built once".to_string(),
            ));
        }

        for segment in &self.segments {
            for layer in segment.layers()? {
                for (param_name, tensor_name) in layer.params() {
                    let n_name = self.renamer.new_param_name(layer.name(), tensor_name)?;
                    tracing::debug!("{} {} => {}", param_name, tensor_name, n_name);
                    if self
                        .param_to_tname
                        .insert(param_name.clone(), (tensor_name.clone(), n_name))
                        .is_none()
                    {
                        self.mapping_order.push(param_name.clone());
                    }
                }
            }
        }
        self.built = true;
        Ok(())
    }

    /// Canonical name of `param_name`, checked against the tensor name recorded at build time.
    pub fn map_name(&self, param_name: &str, t_name: &str) -> crate::Result<&str> {
        if !self.built {
            return Err(crate::ReshardError::Sequencing(
                "stage name mapping queried before it was built".to_string(),
            ));
        }
        let (tensor_name, n_name) = self.param_to_tname.get(param_name).ok_or_else(|| {
            crate::ReshardError::NameConsistency(format!("{} is unknown to this stage", param_name))
        })?;
        if tensor_name != t_name {
            return Err(crate::ReshardError::NameConsistency(format!(
                "{} was recorded as {}, got {}",
                param_name, tensor_name, t_name
            )));
        }
        Ok(n_name)
    }

    /// (raw name, tensor name, canonical name) in the order they were assigned
    pub fn name_mapping(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.mapping_order.iter().filter_map(|name| {
            self.param_to_tname
                .get(name)
                .map(|(t, n)| (name.as_str(), t.as_str(), n.as_str()))
        })
    }

    pub fn param_count(&self) -> usize {
        self.mapping_order.len()
    }
}
