//! Partitioning of layer ordinals into pipeline segments.

use std::ops::Range;

use crate::config::SegmentMethod;

/// Splits `[0, layer_num)` into `pp_degree * vpp_degree` contiguous ranges
/// and deals them out to physical stages round-robin.
#[derive(Debug, Clone)]
pub struct SegmentPlanner {
    layer_num: usize,
    pp_degree: usize,
    vpp_degree: usize,
    method: SegmentMethod,
}

impl SegmentPlanner {
    pub fn new(layer_num: usize, pp_degree: usize, vpp_degree: usize, method: SegmentMethod) -> Self {
        Self {
            layer_num,
            pp_degree,
            vpp_degree,
            method,
        }
    }

    pub fn stage_num(&self) -> usize {
        self.pp_degree * self.vpp_degree
    }

    /// `stage_num + 1` cut points; segment `i` is `[b[i], b[i + 1])`.
    pub fn boundaries(&self) -> crate::Result<Vec<usize>> {
        if self.stage_num() == 0 {
            return Err(crate::ReshardError::Config(
                "pp_degree and vpp_degree must be at least 1".to_string(),
            ));
        }

        let boundaries = match self.method {
            SegmentMethod::Uniform => self.segment_uniform(),
            SegmentMethod::Layer => self.segment_by_layer()?,
        };

        if boundaries.windows(2).any(|w| w[0] > w[1]) {
            return Err(crate::ReshardError::Sequencing(format!(
                "segment boundaries {:?} are not ordered",
                boundaries
            )));
        }
        Ok(boundaries)
    }

    fn segment_uniform(&self) -> Vec<usize> {
        let stage_num = self.stage_num();
        let part_size = self.layer_num / stage_num;
        let extra_layers = self.layer_num % stage_num;

        let mut result = vec![0; stage_num + 1];
        for i in 1..stage_num {
            // the last `extra_layers` parts take one more layer
            let offset = usize::from(i > stage_num - extra_layers);
            result[i] = (result[i - 1] + part_size + offset).min(self.layer_num);
        }
        result[stage_num] = self.layer_num;
        result
    }

    fn segment_by_layer(&self) -> crate::Result<Vec<usize>> {
        let stage_num = self.stage_num();
        // embedding and the two output layers carry no weight
        let weights: Vec<usize> = (0..self.layer_num)
            .map(|i| usize::from(i >= 1 && i + 2 < self.layer_num))
            .collect();
        let part_size = weights.iter().sum::<usize>() / stage_num;

        let mut result = vec![0; stage_num + 1];
        let mut memory_counter = 0;
        let mut result_idx = 1;
        for (idx, weight) in weights.iter().enumerate() {
            memory_counter += weight;
            if memory_counter == part_size {
                if result_idx > stage_num {
                    return Err(crate::ReshardError::Sequencing(format!(
                        "layer weighting of {} layers yields more than {} segments",
                        self.layer_num, stage_num
                    )));
                }
                result[result_idx] = idx + 1;
                result_idx += 1;
                memory_counter = 0;
            }
        }
        result[stage_num] = self.layer_num;
        Ok(result)
    }

    /// Segment ranges owned by each physical stage; range `i` goes to stage `i % pp_degree`.
    pub fn plan(&self) -> crate::Result<Vec<Vec<Range<usize>>>> {
        let boundaries = self.boundaries()?;
        let mut index_segments = vec![Vec::new(); self.pp_degree];
        for (i, w) in boundaries.windows(2).enumerate() {
            index_segments[i % self.pp_degree].push(w[0]..w[1]);
        }
        tracing::info!(
            "Segment results ({}, pp={}, vpp={}): {:?}",
            self.method,
            self.pp_degree,
            self.vpp_degree,
            index_segments
        );
        Ok(index_segments)
    }
}
