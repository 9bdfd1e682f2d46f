//! # Merge Requests
//!
//! The incoming request and everything resolved from it before any stream
//! is opened.
//!
//! `RequestResources::new` performs every request-level check:
//! 1. the study must exist
//! 2. derived variables are built, ordered and validated producers first;
//!    each is added to the metadata once it validates, so later variables
//!    can read it
//! 3. a referenced compute job must have results, and its entity must be
//!    the target entity or an ancestor of it
//! 4. output variables and filter variables must exist; output variables
//!    must be readable on the target entity and must not be computed
//!
//! Errors raised here are all `ErrorKind::Request`.

use crate::derived::{DerivedVariableFactory, PluginRegistry};
use crate::metadata::{
    DataShape, ReferenceMetadata, StudyDetail, VariableDef, VariableSource, VariableType,
};
use crate::stream::DataStream;
use crate::stream::root::ComputedColumns;
use crate::types::{DerivedVariableSpec, Filter, MergeError, VariableSpec};
use serde::{Deserialize, Serialize};

// =============================================================================
// REQUEST PAYLOAD
// =============================================================================

/// A merged tabular request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub study_id: String,
    /// Target entity; one output line per row of this entity.
    pub entity_id: String,
    #[serde(default)]
    pub output_variables: Vec<VariableSpec>,
    /// Subset filters applied to every stream.
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub derived_variables: Vec<DerivedVariableSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_spec: Option<ComputeSpec>,
}

/// Reference to a compute job whose results are merged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeSpec {
    pub compute_name: String,
    #[serde(default)]
    pub compute_config: serde_json::Value,
}

/// Variables produced by a compute job, as reported by its collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedVariableMetadata {
    pub variables: Vec<ComputedVariableDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedVariableDetail {
    pub variable_spec: VariableSpec,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "type", default)]
    pub variable_type: VariableType,
    #[serde(default)]
    pub data_shape: DataShape,
    #[serde(default)]
    pub vocabulary: Option<Vec<String>>,
    #[serde(default)]
    pub units: Option<String>,
    /// A collection contributes one column per member instead of its own.
    #[serde(default)]
    pub is_collection: bool,
    #[serde(default)]
    pub members: Vec<VariableSpec>,
}

impl ComputedVariableDetail {
    fn column_defs(&self) -> Vec<VariableDef> {
        let specs = if self.is_collection {
            self.members.clone()
        } else {
            vec![self.variable_spec.clone()]
        };
        specs
            .into_iter()
            .map(|spec| VariableDef {
                display_name: if self.display_name.is_empty() || self.is_collection {
                    spec.variable_id.clone()
                } else {
                    self.display_name.clone()
                },
                spec,
                variable_type: self.variable_type,
                data_shape: self.data_shape,
                vocabulary: self.vocabulary.clone(),
                units: self.units.clone(),
                impute_zero: false,
                source: VariableSource::Computed,
            })
            .collect()
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Source of study metadata.
pub trait MetadataProvider {
    /// `None` when the study does not exist.
    fn study(&self, study_id: &str) -> Result<Option<StudyDetail>, MergeError>;
}

/// Source of compute job results.
pub trait ComputeProvider {
    fn results_available(&self, study_id: &str, spec: &ComputeSpec) -> Result<bool, MergeError>;

    fn computed_variables(
        &self,
        study_id: &str,
        spec: &ComputeSpec,
    ) -> Result<ComputedVariableMetadata, MergeError>;

    /// Tabular results: header of raw ids, then one row per compute entity
    /// row, sorted like the entity's own stream.
    fn computed_stream(&self, study_id: &str, spec: &ComputeSpec)
    -> Result<DataStream, MergeError>;
}

// =============================================================================
// RESOURCES
// =============================================================================

/// A validated request, ready for planning.
#[derive(Debug)]
pub struct RequestResources {
    request: MergeRequest,
    metadata: ReferenceMetadata,
    factory: DerivedVariableFactory,
    computed: Option<ComputedColumns>,
}

impl RequestResources {
    pub fn new(
        request: MergeRequest,
        metadata_provider: &dyn MetadataProvider,
        compute_provider: Option<&dyn ComputeProvider>,
        registry: &PluginRegistry,
    ) -> Result<Self, MergeError> {
        tracing::info!(
            study = %request.study_id,
            entity = %request.entity_id,
            outputs = request.output_variables.len(),
            derived = request.derived_variables.len(),
            filters = request.filters.len(),
            compute = request.compute_spec.is_some(),
            "received merge request"
        );

        let study = metadata_provider
            .study(&request.study_id)?
            .ok_or_else(|| MergeError::StudyNotFound(request.study_id.clone()))?;
        let mut metadata = ReferenceMetadata::new(study)?;

        let factory =
            DerivedVariableFactory::build(registry, &metadata, &request.derived_variables)?;
        for derived in factory.ordered() {
            tracing::debug!(
                variable = %derived.column_name(),
                function = %derived.function_name(),
                "validating derived variable"
            );
            derived.validate(&metadata)?;
            metadata.incorporate_derived_variable(derived.to_variable_def())?;
        }

        metadata.entity(&request.entity_id)?;
        let computed = match &request.compute_spec {
            Some(spec) => Some(incorporate_compute(
                &mut metadata,
                compute_provider,
                &request.study_id,
                &request.entity_id,
                spec,
            )?),
            None => None,
        };

        validate_outputs(&metadata, &request)?;
        for filter in &request.filters {
            metadata.variable(&filter.variable())?;
        }

        Ok(Self {
            request,
            metadata,
            factory,
            computed,
        })
    }

    #[must_use]
    pub fn study_id(&self) -> &str {
        &self.request.study_id
    }

    #[must_use]
    pub fn target_entity_id(&self) -> &str {
        &self.request.entity_id
    }

    #[must_use]
    pub fn output_variables(&self) -> &[VariableSpec] {
        &self.request.output_variables
    }

    #[must_use]
    pub fn subset_filters(&self) -> &[Filter] {
        &self.request.filters
    }

    #[must_use]
    pub fn compute_spec(&self) -> Option<&ComputeSpec> {
        self.request.compute_spec.as_ref()
    }

    #[must_use]
    pub fn computed_columns(&self) -> Option<&ComputedColumns> {
        self.computed.as_ref()
    }

    #[must_use]
    pub fn metadata(&self) -> &ReferenceMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn factory(&self) -> &DerivedVariableFactory {
        &self.factory
    }
}

fn incorporate_compute(
    metadata: &mut ReferenceMetadata,
    provider: Option<&dyn ComputeProvider>,
    study_id: &str,
    target_entity: &str,
    spec: &ComputeSpec,
) -> Result<ComputedColumns, MergeError> {
    let provider = provider.ok_or_else(|| {
        MergeError::InvalidRequest(format!(
            "Compute '{}' was requested but no compute provider is configured",
            spec.compute_name
        ))
    })?;
    if !provider.results_available(study_id, spec)? {
        return Err(MergeError::InvalidRequest(format!(
            "Compute results are not available for job '{}'",
            spec.compute_name
        )));
    }

    let reported = provider.computed_variables(study_id, spec)?;
    let defs: Vec<VariableDef> = reported
        .variables
        .iter()
        .flat_map(ComputedVariableDetail::column_defs)
        .collect();
    let entity_id = match defs.first() {
        Some(def) => def.spec.entity_id.clone(),
        None => {
            return Err(MergeError::InvalidRequest(format!(
                "Compute '{}' reported no variables",
                spec.compute_name
            )));
        }
    };
    if let Some(stray) = defs.iter().find(|d| d.spec.entity_id != entity_id) {
        return Err(MergeError::InvalidRequest(format!(
            "Computed variables of '{}' span entities '{}' and '{}'",
            spec.compute_name, entity_id, stray.spec.entity_id
        )));
    }
    if entity_id != target_entity && !metadata.is_entity_ancestor_of(&entity_id, target_entity) {
        return Err(MergeError::InvalidRequest(format!(
            "Entity of computed variables '{}' must be the target entity '{}' or one of its ancestors",
            entity_id, target_entity
        )));
    }

    let variables = defs.iter().map(|d| d.spec.clone()).collect();
    metadata.incorporate_computed_variables(&entity_id, defs)?;
    tracing::info!(
        compute = %spec.compute_name,
        entity = %entity_id,
        "computed variables incorporated"
    );
    Ok(ComputedColumns {
        entity_id,
        variables,
    })
}

fn validate_outputs(metadata: &ReferenceMetadata, request: &MergeRequest) -> Result<(), MergeError> {
    let target = &request.entity_id;
    for output in &request.output_variables {
        let def = metadata.variable(output)?;
        if def.source == VariableSource::Computed {
            return Err(MergeError::InvalidRequest(format!(
                "Computed variable {} is returned automatically and cannot be requested",
                output
            )));
        }
        if output.entity_id != *target && !metadata.is_entity_ancestor_of(&output.entity_id, target)
        {
            return Err(MergeError::InvalidRequest(format!(
                "Output variable {} must be on entity '{}' or one of its ancestors",
                output, target
            )));
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
