//! Process-topology and collective-communication seams used by the resharding pass.
//!
//! The real transport (NCCL, gloo, ...) lives outside this crate. [`LocalGroup`]
//! is an in-process implementation where every rank is a thread.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::state::NodeModelState;

/// Collective operations over the pipeline-parallel group.
pub trait CollectiveGroup: Send + Sync {
    /// Number of ranks in the group
    fn world_size(&self) -> usize;

    /// Contribute `local` and receive every rank's contribution, ordered by rank.
    ///
    /// Every rank of the group must call this; it does not return before all
    /// of them have, or before the group is aborted.
    fn all_gather(&self, local: NodeModelState) -> crate::Result<Vec<NodeModelState>>;

    /// Announce that this rank will not join the pending exchange.
    ///
    /// Peers blocked in (or later entering) [`all_gather`](Self::all_gather)
    /// fail with [`ReshardError::Collective`](crate::ReshardError::Collective).
    fn abort(&self, reason: &str);
}

/// The parts of the rank topology the resharding pass needs.
pub trait Topology {
    type Group: CollectiveGroup + ?Sized;

    /// Number of target pipeline stages
    fn pipe_parallel_world_size(&self) -> usize;

    /// Pipeline stage of this rank
    fn stage_id(&self) -> usize;

    fn pipe_parallel_group(&self) -> &Self::Group;
}

struct Exchange {
    slots: Vec<Option<NodeModelState>>,
    /// ranks waiting at the current rendezvous
    arrived: usize,
    generation: u64,
    /// sticky once set
    aborted: Option<String>,
}

struct GroupState {
    exchange: Mutex<Exchange>,
    turn: Condvar,
}

/// Thread-backed collective group; clone one handle per rank.
#[derive(Clone)]
pub struct LocalGroup {
    world_size: usize,
    rank: usize,
    shared: Arc<GroupState>,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("world_size", &self.world_size)
            .field("rank", &self.rank)
            .finish()
    }
}

impl LocalGroup {
    /// One handle per rank, index `i` belonging to rank `i`
    pub fn new(world_size: usize) -> crate::Result<Vec<LocalGroup>> {
        if world_size == 0 {
            return Err(crate::ReshardError::Config(
                "collective group needs at least one rank".to_string(),
            ));
        }
        let shared = Arc::new(GroupState {
            exchange: Mutex::new(Exchange {
                slots: (0..world_size).map(|_| None).collect(),
                arrived: 0,
                generation: 0,
                aborted: None,
            }),
            turn: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| LocalGroup {
                world_size,
                rank,
                shared: shared.clone(),
            })
            .collect())
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    fn poisoned(&self) -> crate::ReshardError {
        crate::ReshardError::Collective(format!(
            "rank {}: a peer panicked during the exchange",
            self.rank
        ))
    }

    fn lock_exchange(&self) -> crate::Result<MutexGuard<'_, Exchange>> {
        self.shared.exchange.lock().map_err(|_| self.poisoned())
    }

    fn check_aborted(&self, exchange: &Exchange) -> crate::Result<()> {
        match &exchange.aborted {
            Some(reason) => Err(crate::ReshardError::Collective(format!(
                "rank {}: group aborted ({})",
                self.rank, reason
            ))),
            None => Ok(()),
        }
    }

    /// Wait until every rank has arrived; the last one runs `on_release` first.
    fn rendezvous<'a>(
        &'a self,
        mut exchange: MutexGuard<'a, Exchange>,
        on_release: impl FnOnce(&mut Exchange),
    ) -> crate::Result<MutexGuard<'a, Exchange>> {
        exchange.arrived += 1;
        if exchange.arrived == self.world_size {
            exchange.arrived = 0;
            exchange.generation = exchange.generation.wrapping_add(1);
            on_release(&mut *exchange);
            self.shared.turn.notify_all();
            return Ok(exchange);
        }

        let generation = exchange.generation;
        let exchange = self
            .shared
            .turn
            .wait_while(exchange, |e| e.generation == generation && e.aborted.is_none())
            .map_err(|_| self.poisoned())?;
        if exchange.generation == generation {
            self.check_aborted(&exchange)?;
        }
        Ok(exchange)
    }
}

impl CollectiveGroup for LocalGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, local: NodeModelState) -> crate::Result<Vec<NodeModelState>> {
        let mut exchange = self.lock_exchange()?;
        self.check_aborted(&exchange)?;
        exchange.slots[self.rank] = Some(local);

        // every rank has deposited
        let exchange = self.rendezvous(exchange, |_| {})?;
        let gathered = exchange
            .slots
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.clone().ok_or_else(|| {
                    crate::ReshardError::Collective(format!("rank {} contributed nothing", rank))
                })
            })
            .collect::<crate::Result<Vec<_>>>();

        // every rank has read
        drop(self.rendezvous(exchange, |e| e.slots.iter_mut().for_each(|slot| *slot = None))?);

        tracing::debug!("Rank {} gathered {} states", self.rank, self.world_size);
        gathered
    }

    fn abort(&self, reason: &str) {
        // a poisoned lock still has to release the waiters
        let mut exchange = match self.shared.exchange.lock() {
            Ok(exchange) => exchange,
            Err(poisoned) => poisoned.into_inner(),
        };
        if exchange.aborted.is_none() {
            tracing::warn!("Rank {} aborts the collective group: {}", self.rank, reason);
            exchange.aborted = Some(format!("rank {}: {}", self.rank, reason));
        }
        drop(exchange);
        self.shared.turn.notify_all();
    }
}

/// Topology of one rank in a single-process conversion.
#[derive(Debug, Clone)]
pub struct LocalTopology {
    group: LocalGroup,
}

impl LocalTopology {
    pub fn new(group: LocalGroup) -> Self {
        Self { group }
    }

    /// Topologies for every rank of a `pp_degree`-stage pipeline
    pub fn pipeline(pp_degree: usize) -> crate::Result<Vec<LocalTopology>> {
        Ok(LocalGroup::new(pp_degree)?
            .into_iter()
            .map(LocalTopology::new)
            .collect())
    }
}

impl Topology for LocalTopology {
    type Group = LocalGroup;

    fn pipe_parallel_world_size(&self) -> usize {
        self.group.world_size
    }

    fn stage_id(&self) -> usize {
        self.group.rank
    }

    fn pipe_parallel_group(&self) -> &LocalGroup {
        &self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reshard::ParamKey;
    use candle_core::{Device, Tensor};

    #[test]
    fn test_single_rank_gather() {
        let group = LocalGroup::new(1).unwrap().remove(0);
        let mut state = NodeModelState::new();
        state.add_weights([(
            ParamKey::new("lm_head.weight", "linear_0.w_0"),
            Tensor::new(&[1f32], &Device::Cpu).unwrap(),
        )]);
        let gathered = group.all_gather(state).unwrap();
        assert_eq!(gathered.len(), 1);
        assert_eq!(gathered[0].tensor_count(), 1);
    }

    #[test]
    fn test_threads_gather_in_rank_order() {
        let groups = LocalGroup::new(3).unwrap();
        let results: Vec<Vec<usize>> = std::thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    s.spawn(move || {
                        let mut state = NodeModelState::new();
                        for i in 0..=group.rank() {
                            state.add_weights([(
                                ParamKey::new(format!("ernie.layers.{}.w", i), "linear_0.w_0"),
                                Tensor::new(&[i as f32], &Device::Cpu).unwrap(),
                            )]);
                        }
                        // two rounds on the same group
                        group.all_gather(state.clone()).unwrap();
                        group
                            .all_gather(state)
                            .unwrap()
                            .iter()
                            .map(|s| s.tensor_count())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for counts in results {
            assert_eq!(counts, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_abort_releases_waiting_peer() {
        let mut groups = LocalGroup::new(2).unwrap();
        let failing = groups.remove(1);
        let waiting = groups.remove(0);
        let (waited, retried) = std::thread::scope(|s| {
            let handle = s.spawn(move || waiting.all_gather(NodeModelState::new()));
            failing.abort("source state unavailable");
            let waited = handle.join().unwrap();
            (waited, failing.all_gather(NodeModelState::new()))
        });
        assert!(matches!(waited, Err(crate::ReshardError::Collective(_))));
        // the abort is sticky
        assert!(matches!(retried, Err(crate::ReshardError::Collective(_))));
    }

    #[test]
    fn test_empty_group_rejected() {
        assert!(LocalGroup::new(0).is_err());
    }

    #[test]
    fn test_local_topology() {
        let topologies = LocalTopology::pipeline(2).unwrap();
        assert_eq!(topologies[1].stage_id(), 1);
        assert_eq!(topologies[1].pipe_parallel_world_size(), 2);
        assert_eq!(topologies[0].pipe_parallel_group().world_size(), 2);
    }
}
