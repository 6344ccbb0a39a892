//! Resharding of node states onto the target pipeline layout.
//!
//! This module provides:
//! - `NodeModelState`: Weights, optimizer slots, master weights and LR scheduler of a node
//! - `StateCache`: Source-shard states, each consumed at most once
//! - `CollectiveGroup` / `Topology`: Seams to the rank topology and its transport
//! - `convert_pp_in_group`: The per-rank conversion pass

mod cache;
mod collective;
mod coordinator;
mod state;

pub use cache::StateCache;
pub use collective::{CollectiveGroup, LocalGroup, LocalTopology, Topology};
pub use coordinator::convert_pp_in_group;
pub use state::{NodeModelState, OptKey, ParamKey};
