//! Model state of one node: weights, optimizer slots, master weights and LR scheduler.

use std::collections::BTreeMap;

use candle_core::Tensor;

use super::collective::CollectiveGroup;

/// Identity of a parameter: structure name plus the framework tensor name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamKey {
    pub structure_name: String,
    pub tensor_name: String,
}

impl ParamKey {
    pub fn new(structure_name: impl Into<String>, tensor_name: impl Into<String>) -> Self {
        Self {
            structure_name: structure_name.into(),
            tensor_name: tensor_name.into(),
        }
    }
}

/// One optimizer slot (e.g. `moment1`) of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptKey {
    pub param: ParamKey,
    pub slot: String,
}

impl OptKey {
    pub fn new(param: ParamKey, slot: impl Into<String>) -> Self {
        Self {
            param,
            slot: slot.into(),
        }
    }
}

/// Tensors held by one rank during conversion, keyed by parameter.
#[derive(Debug, Clone, Default)]
pub struct NodeModelState {
    model_weights: BTreeMap<ParamKey, Tensor>,
    opt_state: BTreeMap<OptKey, Tensor>,
    master_weights: BTreeMap<ParamKey, Tensor>,
    lr_scheduler: Option<serde_json::Value>,
}

impl NodeModelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_weights(&self) -> &BTreeMap<ParamKey, Tensor> {
        &self.model_weights
    }

    pub fn opt_state(&self) -> &BTreeMap<OptKey, Tensor> {
        &self.opt_state
    }

    pub fn master_weights(&self) -> &BTreeMap<ParamKey, Tensor> {
        &self.master_weights
    }

    pub fn lr_scheduler(&self) -> Option<&serde_json::Value> {
        self.lr_scheduler.as_ref()
    }

    pub fn add_weights(&mut self, weights: impl IntoIterator<Item = (ParamKey, Tensor)>) {
        merge(&mut self.model_weights, weights, "weight");
    }

    pub fn add_opts(&mut self, opts: impl IntoIterator<Item = (OptKey, Tensor)>) {
        for (key, tensor) in opts {
            if self.opt_state.insert(key.clone(), tensor).is_some() {
                tracing::warn!(
                    "Duplicate optimizer state {} ({}) replaced",
                    key.param.structure_name,
                    key.slot
                );
            }
        }
    }

    pub fn add_master_weights(&mut self, weights: impl IntoIterator<Item = (ParamKey, Tensor)>) {
        merge(&mut self.master_weights, weights, "master weight");
    }

    /// Keep the incoming scheduler state; `None` leaves the current one untouched
    pub fn set_lr_scheduler(&mut self, lr_scheduler: Option<serde_json::Value>) {
        if lr_scheduler.is_some() {
            self.lr_scheduler = lr_scheduler;
        }
    }

    /// Move every entry of `other` into `self`
    pub fn merge_from(&mut self, other: NodeModelState) {
        self.add_weights(other.model_weights);
        self.add_opts(other.opt_state);
        self.add_master_weights(other.master_weights);
        self.set_lr_scheduler(other.lr_scheduler);
    }

    pub fn is_empty(&self) -> bool {
        self.model_weights.is_empty() && self.opt_state.is_empty() && self.master_weights.is_empty()
    }

    /// Total number of tensors across all three maps
    pub fn tensor_count(&self) -> usize {
        self.model_weights.len() + self.opt_state.len() + self.master_weights.len()
    }

    /// Drop every entry whose structure name fails `keep`.
    fn retain<F>(&mut self, keep: F) -> crate::Result<()>
    where
        F: Fn(&str) -> crate::Result<bool>,
    {
        self.model_weights = filter_map(std::mem::take(&mut self.model_weights), |k| {
            keep(&k.structure_name)
        })?;
        self.opt_state = filter_map(std::mem::take(&mut self.opt_state), |k| {
            keep(&k.param.structure_name)
        })?;
        self.master_weights = filter_map(std::mem::take(&mut self.master_weights), |k| {
            keep(&k.structure_name)
        })?;
        Ok(())
    }

    /// Exchange state with every rank of `group` and keep what `keep` selects.
    ///
    /// Blocks until the whole group has contributed.
    pub fn reshard<G, F>(&mut self, group: &G, keep: F) -> crate::Result<()>
    where
        G: CollectiveGroup + ?Sized,
        F: Fn(&str) -> crate::Result<bool>,
    {
        let local = std::mem::take(self);
        let gathered = group.all_gather(local)?;

        let mut merged = NodeModelState::new();
        for mut state in gathered {
            state.retain(&keep)?;
            merged.merge_from(state);
        }
        *self = merged;
        Ok(())
    }

    /// Rewrite the tensor name of every key with `name_map(structure_name, tensor_name)`.
    pub fn map_name<F>(&mut self, name_map: F) -> crate::Result<()>
    where
        F: Fn(&str, &str) -> crate::Result<String>,
    {
        let rename = |key: &ParamKey| -> crate::Result<ParamKey> {
            Ok(ParamKey::new(
                key.structure_name.clone(),
                name_map(&key.structure_name, &key.tensor_name)?,
            ))
        };

        let mut model_weights = BTreeMap::new();
        for (key, tensor) in std::mem::take(&mut self.model_weights) {
            model_weights.insert(rename(&key)?, tensor);
        }
        let mut opt_state = BTreeMap::new();
        for (key, tensor) in std::mem::take(&mut self.opt_state) {
            opt_state.insert(OptKey::new(rename(&key.param)?, key.slot), tensor);
        }
        let mut master_weights = BTreeMap::new();
        for (key, tensor) in std::mem::take(&mut self.master_weights) {
            master_weights.insert(rename(&key)?, tensor);
        }

        self.model_weights = model_weights;
        self.opt_state = opt_state;
        self.master_weights = master_weights;
        Ok(())
    }

    /// Partition the state by `split(structure_name)`; the LR scheduler goes to every part.
    pub fn split_state<F>(self, split: F) -> crate::Result<BTreeMap<usize, NodeModelState>>
    where
        F: Fn(&str) -> crate::Result<usize>,
    {
        let mut parts: BTreeMap<usize, NodeModelState> = BTreeMap::new();
        for (key, tensor) in self.model_weights {
            let part = split(&key.structure_name)?;
            parts.entry(part).or_default().model_weights.insert(key, tensor);
        }
        for (key, tensor) in self.opt_state {
            let part = split(&key.param.structure_name)?;
            parts.entry(part).or_default().opt_state.insert(key, tensor);
        }
        for (key, tensor) in self.master_weights {
            let part = split(&key.structure_name)?;
            parts.entry(part).or_default().master_weights.insert(key, tensor);
        }
        for part in parts.values_mut() {
            part.lr_scheduler = self.lr_scheduler.clone();
        }
        Ok(parts)
    }
}

fn merge<I>(target: &mut BTreeMap<ParamKey, Tensor>, entries: I, kind: &str)
where
    I: IntoIterator<Item = (ParamKey, Tensor)>,
{
    for (key, tensor) in entries {
        if let Some(_replaced) = target.insert(key.clone(), tensor) {
            tracing::warn!("Duplicate {} {} replaced", kind, key.structure_name);
        }
    }
}

fn filter_map<K: Ord, F>(map: BTreeMap<K, Tensor>, keep: F) -> crate::Result<BTreeMap<K, Tensor>>
where
    F: Fn(&K) -> crate::Result<bool>,
{
    let mut kept = BTreeMap::new();
    for (key, tensor) in map {
        if keep(&key)? {
            kept.insert(key, tensor);
        }
    }
    Ok(kept)
}
