//! Canonical parameter naming through a tree of typed occurrence counters.
//!
//! Every stage owns one [`LayerRenamer`]. The renamer keeps an arena of
//! scopes; each scope counts occurrences of one structural role (linear,
//! layer norm, embedding, ...) below its parent. A parameter name such as
//! `linear_17.w_0` seen under logical layer `ernie.layers.2` is rewritten to
//! `linear_<n>.w_0`, where `<n>` only depends on the order in which distinct
//! (layer, sub-layer) pairs were first seen on the stage.

/// Structural role of a top-level sub-module, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerRole {
    ColumnSequenceParallelLinear,
    RowSequenceParallelLinear,
    Linear,
    LayerNorm,
    Embedding,
    CreateParameter,
    ErnieLmHead,
}

impl LayerRole {
    /// Roles in the order they are matched against a sub-layer name.
    pub const ALL: [LayerRole; 7] = [
        LayerRole::ColumnSequenceParallelLinear,
        LayerRole::RowSequenceParallelLinear,
        LayerRole::Linear,
        LayerRole::LayerNorm,
        LayerRole::Embedding,
        LayerRole::CreateParameter,
        LayerRole::ErnieLmHead,
    ];

    /// Name prefix identifying the role
    pub fn prefix(&self) -> &'static str {
        match self {
            LayerRole::ColumnSequenceParallelLinear => "column_sequence_parallel_linear",
            LayerRole::RowSequenceParallelLinear => "row_sequence_parallel_linear",
            LayerRole::Linear => "linear",
            LayerRole::LayerNorm => "layer_norm",
            LayerRole::Embedding => "embedding",
            LayerRole::CreateParameter => "create_parameter",
            LayerRole::ErnieLmHead => "ernie_lm_head",
        }
    }

    /// First role whose prefix starts `sub_layer_name`
    pub fn from_sub_layer(sub_layer_name: &str) -> Option<LayerRole> {
        Self::ALL
            .iter()
            .copied()
            .find(|role| sub_layer_name.starts_with(role.prefix()))
    }

    /// Instantiate the role's `<prefix>_{}` template
    pub fn render(&self, index: usize) -> String {
        format!("{}_{}", self.prefix(), index)
    }
}

type ScopeId = usize;

const ROOT: ScopeId = 0;

#[derive(Debug)]
struct NameScope {
    /// Rendered name of the enclosing scope; empty at the top level
    prefix: String,
    role: Option<LayerRole>,
    /// `None` until the first occurrence is observed
    index: Option<usize>,
    last_layer_id: String,
    last_old_layer_name: String,
    children: Vec<(LayerRole, ScopeId)>,
}

impl NameScope {
    fn new(prefix: String, role: Option<LayerRole>) -> Self {
        Self {
            prefix,
            role,
            index: None,
            last_layer_id: String::new(),
            last_old_layer_name: String::new(),
            children: Vec::new(),
        }
    }

    fn layer_name(&self) -> String {
        let name = match (self.role, self.index) {
            (Some(role), Some(index)) => role.render(index),
            _ => String::new(),
        };
        if self.prefix.is_empty() {
            name
        } else {
            format!("{}_{}", self.prefix, name)
        }
    }
}

/// Arena-backed name-scope tree that produces canonical parameter names.
#[derive(Debug)]
pub struct LayerRenamer {
    scopes: Vec<NameScope>,
}

impl Default for LayerRenamer {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerRenamer {
    pub fn new() -> Self {
        Self {
            scopes: vec![NameScope::new(String::new(), None)],
        }
    }

    /// Get or lazily create the child of `parent` for the role of `sub_layer_name`.
    fn sub_scope(&mut self, parent: ScopeId, sub_layer_name: &str) -> crate::Result<ScopeId> {
        let role = LayerRole::from_sub_layer(sub_layer_name).ok_or_else(|| {
            crate::ReshardError::Classification(format!(
                "{} has no known sub-layer role (scope '{}')",
                sub_layer_name, self.scopes[parent].prefix
            ))
        })?;

        if let Some(&(_, id)) = self.scopes[parent].children.iter().find(|(r, _)| *r == role) {
            return Ok(id);
        }

        let prefix = self.scopes[parent].layer_name();
        let id = self.scopes.len();
        self.scopes.push(NameScope::new(prefix, Some(role)));
        self.scopes[parent].children.push((role, id));
        Ok(id)
    }

    /// Advance the scope's counter when a new (layer, sub-layer) occurrence begins.
    fn next_scope(&mut self, id: ScopeId, layer_id: &str, old_layer_name: &str) -> ScopeId {
        let scope = &mut self.scopes[id];
        if scope.last_old_layer_name != old_layer_name || scope.last_layer_id != layer_id {
            scope.index = Some(scope.index.map_or(0, |i| i + 1));
            scope.last_old_layer_name = old_layer_name.to_string();
            scope.last_layer_id = layer_id.to_string();
            // Detached children stay in the arena but are never reached again.
            scope.children.clear();
        }
        id
    }

    /// The sub-layer path that participates in scoping.
    fn extract_layer_names(full_layer_name: &str) -> Vec<&str> {
        vec![full_layer_name]
    }

    /// Canonical name of a sub-layer (`linear_3`) within logical layer `layer_id`
    pub fn new_layer_name(&mut self, layer_id: &str, old_name: &str) -> crate::Result<String> {
        let mut scope = ROOT;
        for layer in Self::extract_layer_names(old_name) {
            let child = self.sub_scope(scope, layer)?;
            scope = self.next_scope(child, layer_id, layer);
        }
        Ok(self.scopes[scope].layer_name())
    }

    /// Rewrite the first dotted component of `old_name`, keeping the rest verbatim
    pub fn new_param_name(&mut self, layer_id: &str, old_name: &str) -> crate::Result<String> {
        let (head, tail) = match old_name.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (old_name, None),
        };
        let layer_name = self.new_layer_name(layer_id, head)?;
        Ok(match tail {
            Some(tail) => format!("{}.{}", layer_name, tail),
            None => layer_name,
        })
    }
}
