//! Classification of raw parameter names into logical model layers.

/// Name prefixes of the four structural layer types of a causal LM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPatterns {
    pub embed_tokens: &'static str,
    pub layers_prefix: &'static str,
    pub norm: &'static str,
    pub lm_head: &'static str,
}

impl LayerPatterns {
    /// Layer names for ERNIE checkpoints
    pub fn ernie() -> Self {
        Self {
            embed_tokens: "ernie.embed_tokens",
            layers_prefix: "ernie.layers",
            norm: "ernie.norm",
            lm_head: "lm_head",
        }
    }

    /// Layer names for Llama-style checkpoints
    pub fn llama() -> Self {
        Self {
            embed_tokens: "model.embed_tokens",
            layers_prefix: "model.layers",
            norm: "model.norm",
            lm_head: "lm_head",
        }
    }
}

impl Default for LayerPatterns {
    fn default() -> Self {
        Self::ernie()
    }
}

/// Structural position of a logical layer in the model stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Embedding,
    /// Transformer block with its index as written in the checkpoint
    Block(usize),
    Norm,
    Head,
}

impl LayerKind {
    /// Dense ordinal: embedding 0, blocks 1..=N, norm N+1, head N+2
    ///
    /// `None` when the ordinal does not fit in `usize`.
    pub fn ordinal(&self, transformer_layer_num: usize) -> Option<usize> {
        match self {
            LayerKind::Embedding => Some(0),
            LayerKind::Block(idx) => idx.checked_add(1),
            LayerKind::Norm => transformer_layer_num.checked_add(1),
            LayerKind::Head => transformer_layer_num.checked_add(2),
        }
    }
}

/// A logical layer: the classifier-derived name plus its structural kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalLayer {
    pub name: String,
    pub kind: LayerKind,
}

/// Maps raw parameter names onto logical layers.
#[derive(Debug, Clone, Default)]
pub struct LayerClassifier {
    patterns: LayerPatterns,
}

impl LayerClassifier {
    pub fn new(patterns: LayerPatterns) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &LayerPatterns {
        &self.patterns
    }

    /// Match `raw_name` against block, embedding, norm and head prefixes in that order.
    ///
    /// Returns `None` when no structural prefix matches.
    pub fn classify(&self, raw_name: &str) -> Option<LogicalLayer> {
        // ernie.layers.3.self_attn.q_proj.weight -> ernie.layers.3
        if let Some(rest) = raw_name
            .strip_prefix(self.patterns.layers_prefix)
            .and_then(|rest| rest.strip_prefix('.'))
        {
            let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
            if digits > 0 {
                // the block ordinal idx + 1 must stay representable
                if let Some(idx) = rest[..digits]
                    .parse::<usize>()
                    .ok()
                    .filter(|&idx| idx < usize::MAX)
                {
                    return Some(LogicalLayer {
                        name: format!("{}.{}", self.patterns.layers_prefix, &rest[..digits]),
                        kind: LayerKind::Block(idx),
                    });
                }
            }
        }

        let fixed = [
            (self.patterns.embed_tokens, LayerKind::Embedding),
            (self.patterns.norm, LayerKind::Norm),
            (self.patterns.lm_head, LayerKind::Head),
        ];
        fixed
            .into_iter()
            .find(|(prefix, _)| raw_name.starts_with(*prefix))
            .map(|(prefix, kind)| LogicalLayer {
                name: prefix.to_string(),
                kind,
            })
    }

    /// Like [`classify`](Self::classify), but an unmatched name is an error.
    pub fn classify_required(&self, raw_name: &str) -> crate::Result<LogicalLayer> {
        self.classify(raw_name)
            .ok_or_else(|| crate::ReshardError::Classification(raw_name.to_string()))
    }

    /// Ordinal of the layer a raw parameter name belongs to.
    pub fn ordinal(&self, raw_name: &str, transformer_layer_num: usize) -> crate::Result<usize> {
        self.classify_required(raw_name)?
            .kind
            .ordinal(transformer_layer_num)
            .ok_or_else(|| {
                crate::ReshardError::Config(format!(
                    "ordinal of {} overflows for {} transformer layers",
                    raw_name, transformer_layer_num
                ))
            })
    }
}
