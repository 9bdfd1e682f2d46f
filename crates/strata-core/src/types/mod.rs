//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the merge engine:
//! - Variable addressing (`VariableSpec`, dot notation)
//! - Merged rows (`Row`)
//! - Derived variable requests (`DerivedVariableSpec`)
//! - Subset filters (`Filter`)
//! - Error types (`MergeError`, `ErrorKind`)
//!
//! ## Determinism Guarantees
//!
//! Rows are `BTreeMap`s and every identifier implements `Ord`, so any
//! iteration over request state happens in a stable order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// VARIABLE ADDRESSING
// =============================================================================

/// Composite key of a variable: the entity it lives on plus its id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableSpec {
    /// Entity the variable belongs to.
    pub entity_id: String,
    /// Variable id, unique within its entity.
    pub variable_id: String,
}

impl VariableSpec {
    /// Create a new variable spec.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, variable_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            variable_id: variable_id.into(),
        }
    }

    /// Column name used in merged output: `entity.variable`.
    #[must_use]
    pub fn dot_notation(&self) -> String {
        format!("{}.{}", self.entity_id, self.variable_id)
    }
}

impl fmt::Display for VariableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity_id, self.variable_id)
    }
}

/// One merged row, keyed by dot-notation column name.
pub type Row = BTreeMap<String, String>;

// =============================================================================
// DERIVED VARIABLE REQUEST
// =============================================================================

/// A derived variable as it arrives in a request.
///
/// `config` is opaque here; each plugin binds it into its own typed config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedVariableSpec {
    pub entity_id: String,
    pub variable_id: String,
    pub function_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl DerivedVariableSpec {
    /// Key of the variable this spec produces.
    #[must_use]
    pub fn key(&self) -> VariableSpec {
        VariableSpec::new(self.entity_id.as_str(), self.variable_id.as_str())
    }
}

// =============================================================================
// FILTERS
// =============================================================================

/// A subset filter. The engine never evaluates filters; it routes them to
/// the stream provider together with each stream request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Filter {
    /// Keep rows whose value is one of `string_set`.
    StringSet {
        entity_id: String,
        variable_id: String,
        string_set: Vec<String>,
    },
    /// Keep rows whose numeric value lies in `[min, max]`; a missing bound is open.
    NumberRange {
        entity_id: String,
        variable_id: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
}

impl Filter {
    /// The variable this filter reads.
    #[must_use]
    pub fn variable(&self) -> VariableSpec {
        match self {
            Self::StringSet {
                entity_id,
                variable_id,
                ..
            }
            | Self::NumberRange {
                entity_id,
                variable_id,
                ..
            } => VariableSpec::new(entity_id.as_str(), variable_id.as_str()),
        }
    }

    /// Entity the filter applies to.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::StringSet { entity_id, .. } | Self::NumberRange { entity_id, .. } => entity_id,
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Broad classification of a [`MergeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Bad request: raised before any stream is opened, never retried.
    Request,
    /// A collaborator broke its contract (headers, stream delivery, row data).
    Integrity,
    /// Reading or writing a byte stream failed; the response is abandoned.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Integrity => "integrity",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while planning or running a merge.
///
/// - No silent failures
/// - Every variant names the entity, variable, function or stream involved
/// - The engine never panics; all errors are returned
#[derive(Debug, Error)]
pub enum MergeError {
    // -------------------------------------------------------------------------
    // Request validation
    // -------------------------------------------------------------------------
    /// No transform or reduction is registered under this name.
    #[error("Unknown derived variable function '{function_name}' for {entity_id}.{variable_id}")]
    UnknownFunction {
        entity_id: String,
        variable_id: String,
        function_name: String,
    },

    /// The plugin config payload could not be bound or failed plugin checks.
    #[error("Invalid config for '{function_name}' derived variable {entity_id}.{variable_id}: {reason}")]
    InvalidConfig {
        entity_id: String,
        variable_id: String,
        function_name: String,
        reason: String,
    },

    /// Two derived variables share the same key.
    #[error("Derived variable {entity_id}.{variable_id} is declared more than once")]
    DuplicateDerivedVariable {
        entity_id: String,
        variable_id: String,
    },

    /// The entity is not part of the study.
    #[error("Entity '{0}' does not exist")]
    UnknownEntity(String),

    /// The variable is not part of its entity's catalog.
    #[error("Variable {entity_id}.{variable_id} does not exist")]
    UnknownVariable {
        entity_id: String,
        variable_id: String,
    },

    /// A transform reads a variable that is not on its entity or an ancestor.
    #[error(
        "Transform '{function_name}' ({entity_id}.{variable_id}) cannot read {input}: \
         inputs must be on entity '{entity_id}' or one of its ancestors"
    )]
    TransformInputLocation {
        entity_id: String,
        variable_id: String,
        function_name: String,
        input: String,
    },

    /// A reduction reads variables on two unrelated branches of the entity tree.
    #[error(
        "Reduction '{function_name}' ({entity_id}.{variable_id}) has inputs on unrelated \
         branches: '{first}' and '{second}'"
    )]
    ReductionBranchMismatch {
        entity_id: String,
        variable_id: String,
        function_name: String,
        first: String,
        second: String,
    },

    /// A reduction's inputs are not on its entity or a descendant.
    #[error(
        "Reduction '{function_name}' ({entity_id}.{variable_id}) operates on entity \
         '{operating_entity}', which is neither '{entity_id}' nor one of its descendants"
    )]
    ReductionInputLocation {
        entity_id: String,
        variable_id: String,
        function_name: String,
        operating_entity: String,
    },

    /// The derived variable dependency graph contains a cycle.
    #[error("Cyclic dependency among derived variables: {}", keys.join(", "))]
    CyclicDependency { keys: Vec<String> },

    /// The merged output would contain the same column twice.
    #[error("Column '{0}' appears more than once in the merged output")]
    DuplicateOutputColumn(String),

    /// The request is malformed in a way no more specific variant covers.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The metadata provider does not know the study.
    #[error("Study '{0}' not found")]
    StudyNotFound(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Configuration(String),

    // -------------------------------------------------------------------------
    // Setup / integrity
    // -------------------------------------------------------------------------
    /// The upstream header differs from the expected column list.
    #[error("Header mismatch on stream '{stream}': expected {expected:?}, found {found:?}")]
    HeaderMismatch {
        stream: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// The upstream stream ended before its header line.
    #[error("Stream '{0}' is empty; a header line is required")]
    EmptyStream(String),

    /// A required stream was never handed to the node tree.
    #[error("Stream '{stream}' for entity '{entity_id}' was not distributed")]
    StreamNotDistributed { stream: String, entity_id: String },

    /// Streams were delivered that no node claimed.
    #[error("Streams delivered but never claimed: {}", .0.join(", "))]
    UnclaimedStreams(Vec<String>),

    /// An operation was called in the wrong stream lifecycle state.
    #[error("Stream '{stream}' used out of order: {reason}")]
    StreamState { stream: String, reason: String },

    /// A data line has a different number of fields than the header.
    #[error("Stream '{stream}' line {line}: expected {expected} fields, found {found}")]
    RowWidth {
        stream: String,
        line: u64,
        expected: usize,
        found: usize,
    },

    /// A row is missing a column some consumer needs.
    #[error("Row is missing column '{0}'")]
    MissingColumn(String),

    /// No ancestor row exists for a descendant row.
    #[error("No row of entity '{ancestor_id}' matches {entity_id} row with {column} = '{id}'")]
    AncestorRowMissing {
        entity_id: String,
        ancestor_id: String,
        column: String,
        id: String,
    },

    /// The computed variable stream is out of step with the target stream.
    #[error("Computed variable row mismatch: expected id '{expected}', found '{found}'")]
    ComputeRowMismatch { expected: String, found: String },

    /// Rows are not grouped contiguously by their parent id.
    #[error("Stream '{stream}' is not sorted: rows for {column} = '{id}' are not contiguous")]
    OutOfOrder {
        stream: String,
        column: String,
        id: String,
    },

    /// A plugin could not interpret a value.
    #[error("Function '{function_name}' cannot use value '{value}' of {variable}")]
    InvalidValue {
        function_name: String,
        variable: String,
        value: String,
    },

    // -------------------------------------------------------------------------
    // I/O
    // -------------------------------------------------------------------------
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tabular reader or writer failed.
    #[error("Tabular data error: {0}")]
    Tabular(#[from] csv::Error),
}

impl MergeError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownFunction { .. }
            | Self::InvalidConfig { .. }
            | Self::DuplicateDerivedVariable { .. }
            | Self::UnknownEntity(_)
            | Self::UnknownVariable { .. }
            | Self::TransformInputLocation { .. }
            | Self::ReductionBranchMismatch { .. }
            | Self::ReductionInputLocation { .. }
            | Self::CyclicDependency { .. }
            | Self::DuplicateOutputColumn(_)
            | Self::InvalidRequest(_)
            | Self::StudyNotFound(_)
            | Self::Configuration(_) => ErrorKind::Request,
            Self::HeaderMismatch { .. }
            | Self::EmptyStream(_)
            | Self::StreamNotDistributed { .. }
            | Self::UnclaimedStreams(_)
            | Self::StreamState { .. }
            | Self::RowWidth { .. }
            | Self::MissingColumn(_)
            | Self::AncestorRowMissing { .. }
            | Self::ComputeRowMismatch { .. }
            | Self::OutOfOrder { .. }
            | Self::InvalidValue { .. } => ErrorKind::Integrity,
            Self::Io(_) | Self::Tabular(_) => ErrorKind::Io,
        }
    }

    /// True for bad-request failures.
    #[must_use]
    pub fn is_request_error(&self) -> bool {
        self.kind() == ErrorKind::Request
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_notation_joins_entity_and_variable() {
        let spec = VariableSpec::new("household", "region");
        assert_eq!(spec.dot_notation(), "household.region");
        assert_eq!(spec.to_string(), "household.region");
    }

    #[test]
    fn variable_specs_order_by_entity_then_variable() {
        let mut specs = vec![
            VariableSpec::new("b", "a"),
            VariableSpec::new("a", "z"),
            VariableSpec::new("a", "b"),
        ];
        specs.sort();
        let names: Vec<_> = specs.iter().map(VariableSpec::dot_notation).collect();
        assert_eq!(names, vec!["a.b", "a.z", "b.a"]);
    }

    #[test]
    fn derived_spec_parses_camel_case() {
        let json = r#"{
            "entityId": "household",
            "variableId": "total",
            "functionName": "sum",
            "displayName": "Total",
            "config": { "inputVariable": { "entityId": "person", "variableId": "income" } }
        }"#;
        let spec: DerivedVariableSpec = serde_json::from_str(json).expect("parse");
        assert_eq!(spec.key(), VariableSpec::new("household", "total"));
        assert_eq!(spec.function_name, "sum");
        assert!(spec.config.is_object());
    }

    #[test]
    fn filters_parse_with_type_tag() {
        let json = r#"[
            { "type": "stringSet", "entityId": "person", "variableId": "sex", "stringSet": ["F"] },
            { "type": "numberRange", "entityId": "person", "variableId": "age", "min": 18 }
        ]"#;
        let filters: Vec<Filter> = serde_json::from_str(json).expect("parse");
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].variable(), VariableSpec::new("person", "sex"));
        assert!(matches!(
            filters[1],
            Filter::NumberRange {
                min: Some(_),
                max: None,
                ..
            }
        ));
        assert_eq!(filters[1].entity_id(), "person");
    }

    #[test]
    fn error_kinds_classify_variants() {
        let request = MergeError::CyclicDependency {
            keys: vec!["a.x".to_string(), "a.y".to_string()],
        };
        assert_eq!(request.kind(), ErrorKind::Request);
        assert!(request.is_request_error());
        assert_eq!(
            request.to_string(),
            "Cyclic dependency among derived variables: a.x, a.y"
        );

        let integrity = MergeError::StreamNotDistributed {
            stream: "B".to_string(),
            entity_id: "child".to_string(),
        };
        assert_eq!(integrity.kind(), ErrorKind::Integrity);
        assert!(integrity.to_string().contains("'B'"));

        let io = MergeError::from(std::io::Error::other("closed"));
        assert_eq!(io.kind(), ErrorKind::Io);
    }
}
