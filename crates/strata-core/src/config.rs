//! # Merge Configuration
//!
//! Runtime switches for a single merge. The binary loads these from TOML;
//! library callers usually start from `MergeConfig::default()`.

use crate::primitives::MAX_ENTITY_DEPENDENCY_DEPTH;
use serde::{Deserialize, Serialize};

/// Options controlling how a merge is planned and executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MergeConfig {
    /// Copy a lone upstream stream through unchanged (header rewritten)
    /// when no derived or inherited values are needed.
    pub pass_through: bool,
    /// Fail fast when rows are not grouped contiguously by parent id.
    pub validate_sort_order: bool,
    /// Maximum depth of the entity node tree.
    pub max_entity_depth: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            pass_through: true,
            validate_sort_order: false,
            max_entity_depth: MAX_ENTITY_DEPENDENCY_DEPTH,
        }
    }
}

impl MergeConfig {
    /// Builder-style toggle for the pass-through fast path.
    #[must_use]
    pub fn with_pass_through(mut self, enabled: bool) -> Self {
        self.pass_through = enabled;
        self
    }

    /// Builder-style toggle for sort-order validation.
    #[must_use]
    pub fn with_sort_validation(mut self, enabled: bool) -> Self {
        self.validate_sort_order = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_pass_through_only() {
        let config = MergeConfig::default();
        assert!(config.pass_through);
        assert!(!config.validate_sort_order);
        assert_eq!(config.max_entity_depth, MAX_ENTITY_DEPENDENCY_DEPTH);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: MergeConfig =
            serde_json::from_str(r#"{ "validate_sort_order": true }"#).expect("parse");
        assert!(config.pass_through);
        assert!(config.validate_sort_order);
    }
}
