//! # Streams
//!
//! Streaming, non-materializing merge of per-entity tabular streams.
//!
//! ## Layers
//! - `EntityStream`: one raw stream with one row of lookahead
//! - `EntityNode`: a stream plus the ancestor, reduction and transform
//!   work needed to finish each of its rows
//! - `RootEntityNode`: the target entity's node, projecting merged rows
//!   onto the output columns
//!
//! ## Precondition
//!
//! Every upstream stream is sorted so that the rows of one entity are
//! grouped contiguously by their ancestor ids, in the same relative order
//! as the ancestor streams. Nothing here re-sorts or buffers beyond one row
//! per stream; `MergeConfig::validate_sort_order` flags violations early.

pub mod entity_stream;
pub mod node;
pub mod root;

pub use entity_stream::EntityStream;
pub use node::EntityNode;
pub use root::RootEntityNode;

use crate::types::{Filter, MergeError, Row, VariableSpec};
use serde::Serialize;
use std::io::Read;

/// A raw upstream byte stream.
pub type DataStream = Box<dyn Read + Send>;

/// Identifies one raw tabular stream the node tree needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    /// Unique within one request.
    pub name: String,
    pub entity_id: String,
    /// Non-id variables, in stream order after the id columns.
    pub variables: Vec<VariableSpec>,
    /// Filters narrowing the request subset for this stream only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters_override: Option<Vec<Filter>>,
}

impl StreamSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_id: entity_id.into(),
            variables: Vec::new(),
            filters_override: None,
        }
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Vec<VariableSpec>) -> Self {
        self.variables = variables;
        self
    }

    #[must_use]
    pub fn with_filters_override(mut self, filters: Option<Vec<Filter>>) -> Self {
        self.filters_override = filters;
        self
    }
}

/// Splices derived values into a row before the stream yields it.
pub trait RowHook {
    fn apply_derived_vars(&mut self, row: &mut Row) -> Result<(), MergeError>;
}

/// Identity hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDerivedVars;

impl RowHook for NoDerivedVars {
    fn apply_derived_vars(&mut self, _row: &mut Row) -> Result<(), MergeError> {
        Ok(())
    }
}
