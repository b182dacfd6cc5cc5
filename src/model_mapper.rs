//! Applies an API key's configured model rewrite, exactly once, and
//! remembers the original name for later phases.

use std::collections::HashMap;

/// A single `{from, to}` rewrite pair from an API key's active profile.
#[derive(Debug, Clone)]
pub struct ModelMapping {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModelMapper {
    mappings: HashMap<String, String>,
}

impl ModelMapper {
    pub fn new(mappings: Vec<ModelMapping>) -> Self {
        Self {
            mappings: mappings.into_iter().map(|m| (m.from, m.to)).collect(),
        }
    }

    /// Returns `(mapped_model, original_model)`. `original_model` is
    /// `None` when no rewrite applied, so callers can tell whether
    /// `PipelineState.original_model` needs to be set.
    pub fn apply(&self, requested_model: &str) -> (String, Option<String>) {
        match self.mappings.get(requested_model) {
            Some(mapped) => (mapped.clone(), Some(requested_model.to_string())),
            None => (requested_model.to_string(), None),
        }
    }
}
