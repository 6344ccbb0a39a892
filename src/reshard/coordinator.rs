//! Pipeline regrouping of one sharding group's states onto the target stages.

use std::collections::BTreeMap;

use super::cache::StateCache;
use super::collective::{CollectiveGroup, Topology};
use super::state::NodeModelState;
use crate::pipeline::SegmentContext;

/// Convert the source pipeline states of `sharding_rank` into the target layout.
///
/// This rank first merges the cached source stages `p` with
/// `p % pp_degree == stage_id`, then exchanges state across the pipeline group
/// keeping only what its target stage owns, renames every parameter through
/// `context`, and finally splits the result by target stage.
pub fn convert_pp_in_group<T>(
    topology: &T,
    sharding_rank: usize,
    src_stage_num: usize,
    context: &SegmentContext,
    state_cache: &mut StateCache,
) -> crate::Result<BTreeMap<usize, NodeModelState>>
where
    T: Topology + ?Sized,
{
    let pp_degree = topology.pipe_parallel_world_size();
    let pp_rank = topology.stage_id();

    let merged = merge_source_stages(
        pp_degree,
        pp_rank,
        sharding_rank,
        src_stage_num,
        context,
        state_cache,
    );
    let mut node_model_state = match merged {
        Ok(state) => state,
        Err(err) => {
            // peers are about to block in the exchange
            topology.pipe_parallel_group().abort(&err.to_string());
            return Err(err);
        }
    };

    let stage_of = |name: &str| -> crate::Result<usize> {
        let stage_id = context.map_name_to_stage(name)?;
        if stage_id >= pp_degree {
            return Err(crate::ReshardError::Sequencing(format!(
                "{} maps to stage {} outside pp_degree {}",
                name, stage_id, pp_degree
            )));
        }
        Ok(stage_id)
    };

    node_model_state.reshard(topology.pipe_parallel_group(), |name| {
        Ok(stage_of(name)? == pp_rank)
    })?;

    node_model_state.map_name(|structure_name, p_name| context.map_name(structure_name, p_name))?;

    let parts = node_model_state.split_state(stage_of)?;
    tracing::info!(
        "Rank {} holds {} target stage(s) after resharding",
        pp_rank,
        parts.len()
    );
    Ok(parts)
}

/// Merge the cached source stages this rank is responsible for.
fn merge_source_stages(
    pp_degree: usize,
    pp_rank: usize,
    sharding_rank: usize,
    src_stage_num: usize,
    context: &SegmentContext,
    state_cache: &mut StateCache,
) -> crate::Result<NodeModelState> {
    if pp_degree != context.pp_degree() {
        return Err(crate::ReshardError::Config(format!(
            "pipeline group has {} ranks but the target layout has {} stages",
            pp_degree,
            context.pp_degree()
        )));
    }

    let mut node_model_state = NodeModelState::new();
    for p in (pp_rank..src_stage_num).step_by(pp_degree) {
        node_model_state.merge_from(state_cache.take(sharding_rank, p)?);
    }
    tracing::info!(
        "Rank {} merged {} tensors from source stages of sharding rank {}",
        pp_rank,
        node_model_state.tensor_count(),
        sharding_rank
    );
    Ok(node_model_state)
}
