//! # Derived Variables
//!
//! Contracts for computed columns that are absent from native data.
//!
//! There are two kinds of derived variable, sharing one validation and
//! metadata contract (`DerivedVariablePlugin`):
//! - **Transform**: a pure function of one merged row. Inputs must live on
//!   the declaring entity or one of its ancestors.
//! - **Reduction**: folds every matching descendant row under one row of
//!   the declaring entity into a single value, through a fresh `Reducer`
//!   per output row. Inputs must lie on one branch whose lowest entity is
//!   the declaring entity or a descendant of it.
//!
//! Plugin instances are built from a `DerivedVariableSpec` by the
//! `PluginRegistry` and are immutable afterwards. The `DerivedVariable`
//! wrapper adds what every kind shares: key, cached column name, placement
//! checks and the lazily built reduction input.

pub mod factory;

pub use factory::{DerivedVariableFactory, PluginRegistry, ReductionBuilder, TransformBuilder};

use crate::metadata::{DataShape, ReferenceMetadata, VariableDef, VariableSource, VariableType};
use crate::types::{DerivedVariableSpec, Filter, MergeError, Row, VariableSpec};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::OnceLock;

// =============================================================================
// PLUGIN CONTRACTS
// =============================================================================

/// Validation and metadata contract shared by transforms and reductions.
pub trait DerivedVariablePlugin: fmt::Debug + Send + Sync {
    /// Variables this plugin reads, in a stable order.
    fn required_input_vars(&self) -> Vec<VariableSpec>;

    /// Derived variables this plugin generates for its own use.
    fn depended_derived_var_specs(&self) -> Vec<DerivedVariableSpec> {
        Vec::new()
    }

    /// Plugin-specific input checks. The default only requires every input
    /// to exist.
    fn validate_inputs(&self, ctx: &ValidationContext<'_>) -> Result<(), MergeError> {
        for input in self.required_input_vars() {
            ctx.variable(&input)?;
        }
        Ok(())
    }

    fn variable_type(&self) -> VariableType;

    fn data_shape(&self) -> DataShape;

    fn vocabulary(&self) -> Option<Vec<String>> {
        None
    }

    fn units(&self) -> Option<String> {
        None
    }
}

/// Row-local derived variable.
pub trait Transform: DerivedVariablePlugin {
    /// Compute this variable's value from a merged row. Must not mutate.
    fn value(&self, row: &Row) -> Result<String, MergeError>;
}

/// Derived variable aggregating descendant rows.
pub trait Reduction: DerivedVariablePlugin {
    /// Filters restricting which descendant rows are visible, replacing any
    /// override inherited from the enclosing stream.
    fn filters_override(&self) -> Option<Vec<Filter>> {
        None
    }

    /// A fresh reducer for one output row.
    fn create_reducer(&self) -> Box<dyn Reducer>;
}

/// Per-output-row accumulator of a reduction.
///
/// `add_row` is called zero or more times, then `resulting_value` exactly
/// once. Every implementation defines an explicit zero-row value.
pub trait Reducer {
    fn add_row(&mut self, row: &Row) -> Result<(), MergeError>;

    fn resulting_value(self: Box<Self>) -> String;
}

/// A constructed plugin of either kind.
#[derive(Debug)]
pub enum Derivation {
    Transform(Box<dyn Transform>),
    Reduction(Box<dyn Reduction>),
}

impl Derivation {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        match self {
            Self::Transform(t) => t.required_input_vars(),
            Self::Reduction(r) => r.required_input_vars(),
        }
    }

    fn depended_derived_var_specs(&self) -> Vec<DerivedVariableSpec> {
        match self {
            Self::Transform(t) => t.depended_derived_var_specs(),
            Self::Reduction(r) => r.depended_derived_var_specs(),
        }
    }

    fn validate_inputs(&self, ctx: &ValidationContext<'_>) -> Result<(), MergeError> {
        match self {
            Self::Transform(t) => t.validate_inputs(ctx),
            Self::Reduction(r) => r.validate_inputs(ctx),
        }
    }

    fn variable_def_parts(&self) -> (VariableType, DataShape, Option<Vec<String>>, Option<String>) {
        match self {
            Self::Transform(t) => (t.variable_type(), t.data_shape(), t.vocabulary(), t.units()),
            Self::Reduction(r) => (r.variable_type(), r.data_shape(), r.vocabulary(), r.units()),
        }
    }

    /// Source recorded in the metadata catalog.
    #[must_use]
    pub const fn source(&self) -> VariableSource {
        match self {
            Self::Transform(_) => VariableSource::DerivedTransform,
            Self::Reduction(_) => VariableSource::DerivedReduction,
        }
    }

    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Transform(_) => "transform",
            Self::Reduction(_) => "reduction",
        }
    }
}

// =============================================================================
// CONFIG BINDING & VALIDATION HELPERS
// =============================================================================

/// Build an `InvalidConfig` error for `spec`.
pub fn invalid_config(spec: &DerivedVariableSpec, reason: impl Into<String>) -> MergeError {
    MergeError::InvalidConfig {
        entity_id: spec.entity_id.clone(),
        variable_id: spec.variable_id.clone(),
        function_name: spec.function_name.clone(),
        reason: reason.into(),
    }
}

/// Bind the opaque config payload of `spec` into a plugin config type.
///
/// The payload must be a JSON object.
pub fn bind_config<T: DeserializeOwned>(spec: &DerivedVariableSpec) -> Result<T, MergeError> {
    if !spec.config.is_object() {
        return Err(invalid_config(spec, "config must be a JSON object"));
    }
    tracing::debug!(
        function = %spec.function_name,
        variable = %spec.key(),
        config = %spec.config,
        "binding derived variable config"
    );
    serde_json::from_value(spec.config.clone()).map_err(|e| invalid_config(spec, e.to_string()))
}

/// Read a column a plugin depends on.
pub fn column<'r>(row: &'r Row, column_name: &str) -> Result<&'r str, MergeError> {
    row.get(column_name)
        .map(String::as_str)
        .ok_or_else(|| MergeError::MissingColumn(column_name.to_string()))
}

/// Metadata view handed to `validate_inputs`.
pub struct ValidationContext<'a> {
    metadata: &'a ReferenceMetadata,
    owner: &'a DerivedVariableSpec,
}

impl<'a> ValidationContext<'a> {
    #[must_use]
    pub fn new(metadata: &'a ReferenceMetadata, owner: &'a DerivedVariableSpec) -> Self {
        Self { metadata, owner }
    }

    #[must_use]
    pub fn metadata(&self) -> &'a ReferenceMetadata {
        self.metadata
    }

    /// Require a variable to exist.
    pub fn variable(&self, spec: &VariableSpec) -> Result<&'a VariableDef, MergeError> {
        self.metadata.variable(spec)
    }

    /// Require a variable to exist and, when `allowed` is non-empty, to
    /// have one of the listed types.
    pub fn check_variable(
        &self,
        label: &str,
        spec: &VariableSpec,
        allowed: &[VariableType],
    ) -> Result<&'a VariableDef, MergeError> {
        let def = self.variable(spec)?;
        if !allowed.is_empty() && !allowed.contains(&def.variable_type) {
            return Err(self.invalid(format!(
                "{} variable {} must have type {:?}, found {:?}",
                label, spec, allowed, def.variable_type
            )));
        }
        Ok(def)
    }

    /// Build an `InvalidConfig` error for the plugin being validated.
    #[must_use]
    pub fn invalid(&self, reason: impl Into<String>) -> MergeError {
        invalid_config(self.owner, reason)
    }
}

// =============================================================================
// DERIVED VARIABLE
// =============================================================================

/// What a reduction's child stream must carry.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionInput {
    /// Lowest entity among the inputs; the child stream's entity.
    pub operating_entity: String,
    /// Inputs minus id columns the stream supplies on its own.
    pub stream_variables: Vec<VariableSpec>,
    pub filters_override: Option<Vec<Filter>>,
}

/// A resolved derived variable: its request spec plus its plugin.
#[derive(Debug)]
pub struct DerivedVariable {
    spec: DerivedVariableSpec,
    key: VariableSpec,
    column_name: String,
    derivation: Derivation,
    reduction_input: OnceLock<ReductionInput>,
}

impl DerivedVariable {
    #[must_use]
    pub fn new(spec: DerivedVariableSpec, derivation: Derivation) -> Self {
        let key = spec.key();
        let column_name = key.dot_notation();
        Self {
            spec,
            key,
            column_name,
            derivation,
            reduction_input: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &DerivedVariableSpec {
        &self.spec
    }

    #[must_use]
    pub fn key(&self) -> &VariableSpec {
        &self.key
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.key.entity_id
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.spec.function_name
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.spec.display_name.is_empty() {
            &self.key.variable_id
        } else {
            &self.spec.display_name
        }
    }

    /// Cached dot-notation column name.
    #[must_use]
    pub fn column_name(&self) -> &str {
        &self.column_name
    }

    #[must_use]
    pub fn derivation(&self) -> &Derivation {
        &self.derivation
    }

    #[must_use]
    pub fn as_transform(&self) -> Option<&dyn Transform> {
        match &self.derivation {
            Derivation::Transform(t) => Some(t.as_ref()),
            Derivation::Reduction(_) => None,
        }
    }

    #[must_use]
    pub fn as_reduction(&self) -> Option<&dyn Reduction> {
        match &self.derivation {
            Derivation::Reduction(r) => Some(r.as_ref()),
            Derivation::Transform(_) => None,
        }
    }

    #[must_use]
    pub fn required_input_vars(&self) -> Vec<VariableSpec> {
        self.derivation.required_input_vars()
    }

    #[must_use]
    pub fn depended_derived_var_specs(&self) -> Vec<DerivedVariableSpec> {
        self.derivation.depended_derived_var_specs()
    }

    /// Full request-time validation: entity, plugin inputs, placement.
    pub fn validate(&self, metadata: &ReferenceMetadata) -> Result<(), MergeError> {
        metadata.entity(self.entity_id())?;
        self.derivation
            .validate_inputs(&ValidationContext::new(metadata, &self.spec))?;
        self.validate_location(metadata)
    }

    /// Check the inputs sit where this kind of derived variable may read them.
    pub fn validate_location(&self, metadata: &ReferenceMetadata) -> Result<(), MergeError> {
        match &self.derivation {
            Derivation::Transform(transform) => {
                for input in transform.required_input_vars() {
                    metadata.variable(&input)?;
                    if input.entity_id != self.key.entity_id
                        && !metadata.is_entity_ancestor_of(&input.entity_id, &self.key.entity_id)
                    {
                        return Err(MergeError::TransformInputLocation {
                            entity_id: self.key.entity_id.clone(),
                            variable_id: self.key.variable_id.clone(),
                            function_name: self.spec.function_name.clone(),
                            input: input.dot_notation(),
                        });
                    }
                }
                Ok(())
            }
            Derivation::Reduction(_) => {
                let operating = &self.reduction_input(metadata)?.operating_entity;
                if *operating != self.key.entity_id
                    && !metadata.is_entity_ancestor_of(&self.key.entity_id, operating)
                {
                    return Err(MergeError::ReductionInputLocation {
                        entity_id: self.key.entity_id.clone(),
                        variable_id: self.key.variable_id.clone(),
                        function_name: self.spec.function_name.clone(),
                        operating_entity: operating.clone(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Child stream description for a reduction, built on first use.
    pub fn reduction_input(
        &self,
        metadata: &ReferenceMetadata,
    ) -> Result<&ReductionInput, MergeError> {
        if let Some(input) = self.reduction_input.get() {
            return Ok(input);
        }
        let Derivation::Reduction(reduction) = &self.derivation else {
            return Err(MergeError::InvalidRequest(format!(
                "Derived variable {} is a transform and has no reduction input",
                self.key
            )));
        };

        let operating_entity = self.operating_entity(metadata)?;
        let mut supplied = vec![metadata.entity(&operating_entity)?.id_variable()];
        supplied.extend(
            metadata
                .ancestors(&operating_entity)?
                .iter()
                .map(|a| a.id_variable()),
        );

        let mut stream_variables: Vec<VariableSpec> = Vec::new();
        for input in reduction.required_input_vars() {
            if !supplied.contains(&input) && !stream_variables.contains(&input) {
                stream_variables.push(input);
            }
        }

        let built = ReductionInput {
            operating_entity,
            stream_variables,
            filters_override: reduction.filters_override(),
        };
        Ok(self.reduction_input.get_or_init(|| built))
    }

    /// Lowest entity among the inputs; all inputs must share one branch.
    fn operating_entity(&self, metadata: &ReferenceMetadata) -> Result<String, MergeError> {
        let inputs = self.required_input_vars();
        let mut lowest: Option<&str> = None;
        for input in &inputs {
            metadata.entity(&input.entity_id)?;
            let candidate = input.entity_id.as_str();
            lowest = Some(match lowest {
                None => candidate,
                Some(current) if current == candidate => current,
                Some(current) if metadata.is_entity_ancestor_of(current, candidate) => candidate,
                Some(current) if metadata.is_entity_ancestor_of(candidate, current) => current,
                Some(current) => {
                    return Err(MergeError::ReductionBranchMismatch {
                        entity_id: self.key.entity_id.clone(),
                        variable_id: self.key.variable_id.clone(),
                        function_name: self.spec.function_name.clone(),
                        first: current.to_string(),
                        second: candidate.to_string(),
                    });
                }
            });
        }
        lowest
            .map(str::to_string)
            .ok_or_else(|| invalid_config(&self.spec, "a reduction needs at least one input"))
    }

    /// Catalog entry added to the metadata once validated.
    #[must_use]
    pub fn to_variable_def(&self) -> VariableDef {
        let (variable_type, data_shape, vocabulary, units) = self.derivation.variable_def_parts();
        VariableDef {
            spec: self.key.clone(),
            display_name: self.display_name().to_string(),
            variable_type,
            data_shape,
            vocabulary,
            units,
            impute_zero: false,
            source: self.derivation.source(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
