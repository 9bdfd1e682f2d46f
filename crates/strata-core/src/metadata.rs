//! # Reference Metadata
//!
//! The entity tree and variable catalog of one study, as seen by one request.
//!
//! A `ReferenceMetadata` starts from the collaborator-supplied `StudyDetail`
//! and grows as the request is validated: each derived variable is
//! incorporated once its placement checks pass, and computed variables are
//! added when a compute job is referenced. It is discarded with the request.
//!
//! Every entity carries an implicit id variable named by its
//! `idColumnName`. Tabular streams always lead with the entity's id column
//! followed by its ancestors' id columns, parent first.

use crate::types::{MergeError, VariableSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// COLLABORATOR PAYLOAD
// =============================================================================

/// Study metadata as delivered by the metadata provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyDetail {
    pub id: String,
    pub root_entity: EntityDetail,
}

/// One entity of the study tree, with its native variables and children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDetail {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub id_column_name: String,
    #[serde(default)]
    pub variables: Vec<VariableDetail>,
    #[serde(default)]
    pub children: Vec<EntityDetail>,
}

/// One native variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDetail {
    pub id: String,
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
    #[serde(default)]
    pub impute_zero: bool,
}

// =============================================================================
// VARIABLE DEFINITIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableType {
    #[default]
    String,
    Number,
    Integer,
    Date,
}

impl VariableType {
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Number | Self::Integer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataShape {
    #[default]
    Continuous,
    Categorical,
    Ordinal,
    Binary,
}

/// Where a variable's values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableSource {
    /// The entity's id column; supplied automatically on every stream.
    Id,
    /// Read directly from the entity's tabular stream.
    Native,
    /// Read from the compute collaborator's stream.
    Computed,
    /// Produced row-locally by a transform.
    DerivedTransform,
    /// Produced by aggregating descendant rows.
    DerivedReduction,
}

impl VariableSource {
    #[must_use]
    pub const fn is_derived(self) -> bool {
        matches!(self, Self::DerivedTransform | Self::DerivedReduction)
    }
}

/// A resolved variable of any source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDef {
    pub spec: VariableSpec,
    pub display_name: String,
    pub variable_type: VariableType,
    pub data_shape: DataShape,
    pub vocabulary: Option<Vec<String>>,
    pub units: Option<String>,
    pub impute_zero: bool,
    pub source: VariableSource,
}

impl VariableDef {
    /// Implicit id variable of an entity.
    #[must_use]
    pub fn id_column(entity_id: &str, id_column_name: &str) -> Self {
        Self {
            spec: VariableSpec::new(entity_id, id_column_name),
            display_name: id_column_name.to_string(),
            variable_type: VariableType::String,
            data_shape: DataShape::Categorical,
            vocabulary: None,
            units: None,
            impute_zero: false,
            source: VariableSource::Id,
        }
    }

    fn native(entity_id: &str, detail: VariableDetail) -> Self {
        let display_name = if detail.display_name.is_empty() {
            detail.id.clone()
        } else {
            detail.display_name
        };
        Self {
            spec: VariableSpec::new(entity_id, detail.id),
            display_name,
            variable_type: detail.variable_type,
            data_shape: detail.data_shape,
            vocabulary: detail.vocabulary,
            units: detail.units,
            impute_zero: detail.impute_zero,
            source: VariableSource::Native,
        }
    }

    /// Dot-notation column name.
    #[must_use]
    pub fn column_name(&self) -> String {
        self.spec.dot_notation()
    }
}

// =============================================================================
// ENTITY DEFINITIONS
// =============================================================================

/// One entity of the resolved tree.
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub id: String,
    pub display_name: String,
    pub id_column_name: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    variables: BTreeMap<String, VariableDef>,
}

impl EntityDef {
    /// Spec of this entity's id variable.
    #[must_use]
    pub fn id_variable(&self) -> VariableSpec {
        VariableSpec::new(self.id.as_str(), self.id_column_name.as_str())
    }

    /// Dot-notation name of this entity's id column.
    #[must_use]
    pub fn id_column(&self) -> String {
        self.id_variable().dot_notation()
    }

    #[must_use]
    pub fn variable(&self, variable_id: &str) -> Option<&VariableDef> {
        self.variables.get(variable_id)
    }

    /// All variables, ordered by id.
    pub fn variables(&self) -> impl Iterator<Item = &VariableDef> {
        self.variables.values()
    }
}

// =============================================================================
// REFERENCE METADATA
// =============================================================================

/// Entity tree plus variable catalog for one request.
#[derive(Debug, Clone)]
pub struct ReferenceMetadata {
    study_id: String,
    root_id: String,
    entities: BTreeMap<String, EntityDef>,
}

impl ReferenceMetadata {
    /// Resolve a study payload into a lookup-friendly tree.
    pub fn new(study: StudyDetail) -> Result<Self, MergeError> {
        let root_id = study.root_entity.id.clone();
        let mut entities = BTreeMap::new();
        let mut pending: Vec<(EntityDetail, Option<String>)> = vec![(study.root_entity, None)];

        while let Some((detail, parent)) = pending.pop() {
            if entities.contains_key(&detail.id) {
                return Err(MergeError::InvalidRequest(format!(
                    "Entity '{}' appears more than once in study '{}'",
                    detail.id, study.id
                )));
            }

            let mut variables = BTreeMap::new();
            variables.insert(
                detail.id_column_name.clone(),
                VariableDef::id_column(&detail.id, &detail.id_column_name),
            );
            for var in detail.variables {
                if variables.contains_key(&var.id) {
                    return Err(MergeError::InvalidRequest(format!(
                        "Variable {}.{} is declared more than once",
                        detail.id, var.id
                    )));
                }
                let def = VariableDef::native(&detail.id, var);
                variables.insert(def.spec.variable_id.clone(), def);
            }

            let children = detail.children.iter().map(|c| c.id.clone()).collect();
            for child in detail.children.into_iter().rev() {
                pending.push((child, Some(detail.id.clone())));
            }

            let display_name = if detail.display_name.is_empty() {
                detail.id.clone()
            } else {
                detail.display_name
            };
            entities.insert(
                detail.id.clone(),
                EntityDef {
                    id: detail.id,
                    display_name,
                    id_column_name: detail.id_column_name,
                    parent,
                    children,
                    variables,
                },
            );
        }

        Ok(Self {
            study_id: study.id,
            root_id,
            entities,
        })
    }

    #[must_use]
    pub fn study_id(&self) -> &str {
        &self.study_id
    }

    #[must_use]
    pub fn root_entity_id(&self) -> &str {
        &self.root_id
    }

    /// Look up an entity by id.
    pub fn entity(&self, entity_id: &str) -> Result<&EntityDef, MergeError> {
        self.entities
            .get(entity_id)
            .ok_or_else(|| MergeError::UnknownEntity(entity_id.to_string()))
    }

    /// All entities, ordered by id.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    /// Ancestors of an entity, parent first, root last.
    pub fn ancestors(&self, entity_id: &str) -> Result<Vec<&EntityDef>, MergeError> {
        let mut ancestors = Vec::new();
        let mut current = self.entity(entity_id)?;
        while let Some(parent_id) = current.parent.as_deref() {
            current = self.entity(parent_id)?;
            ancestors.push(current);
        }
        Ok(ancestors)
    }

    /// True if `ancestor_id` is a strict ancestor of `descendant_id`.
    #[must_use]
    pub fn is_entity_ancestor_of(&self, ancestor_id: &str, descendant_id: &str) -> bool {
        let mut current = self.entities.get(descendant_id);
        while let Some(entity) = current {
            match entity.parent.as_deref() {
                Some(parent_id) if parent_id == ancestor_id => return true,
                Some(parent_id) => current = self.entities.get(parent_id),
                None => return false,
            }
        }
        false
    }

    /// Look up a variable of any source.
    pub fn variable(&self, spec: &VariableSpec) -> Result<&VariableDef, MergeError> {
        self.entity(&spec.entity_id)?
            .variable(&spec.variable_id)
            .ok_or_else(|| MergeError::UnknownVariable {
                entity_id: spec.entity_id.clone(),
                variable_id: spec.variable_id.clone(),
            })
    }

    /// Columns of a tabular stream for `entity_id`: its id column, its
    /// ancestors' id columns (parent first), then `vars` in order.
    pub fn tabular_columns(
        &self,
        entity_id: &str,
        vars: &[VariableSpec],
    ) -> Result<Vec<VariableSpec>, MergeError> {
        let entity = self.entity(entity_id)?;
        let ancestors = self.ancestors(entity_id)?;
        let mut columns = Vec::with_capacity(1 + ancestors.len() + vars.len());
        columns.push(entity.id_variable());
        columns.extend(ancestors.iter().map(|a| a.id_variable()));
        columns.extend(vars.iter().cloned());
        Ok(columns)
    }

    /// Add a validated derived variable to its entity's catalog.
    pub fn incorporate_derived_variable(&mut self, def: VariableDef) -> Result<(), MergeError> {
        let study_id = self.study_id.clone();
        let entity = self
            .entities
            .get_mut(&def.spec.entity_id)
            .ok_or_else(|| MergeError::UnknownEntity(def.spec.entity_id.clone()))?;
        if let Some(existing) = entity.variables.get(&def.spec.variable_id) {
            return Err(if existing.source.is_derived() {
                MergeError::DuplicateDerivedVariable {
                    entity_id: def.spec.entity_id.clone(),
                    variable_id: def.spec.variable_id.clone(),
                }
            } else {
                MergeError::InvalidRequest(format!(
                    "Derived variable {} collides with an existing variable of study '{}'",
                    def.spec, study_id
                ))
            });
        }
        entity.variables.insert(def.spec.variable_id.clone(), def);
        Ok(())
    }

    /// Add computed variables; all must live on `entity_id`.
    pub fn incorporate_computed_variables(
        &mut self,
        entity_id: &str,
        defs: Vec<VariableDef>,
    ) -> Result<(), MergeError> {
        let entity = self
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| MergeError::UnknownEntity(entity_id.to_string()))?;
        for def in defs {
            if def.spec.entity_id != entity_id {
                return Err(MergeError::InvalidRequest(format!(
                    "Computed variable {} is not on compute entity '{}'",
                    def.spec, entity_id
                )));
            }
            if entity.variables.contains_key(&def.spec.variable_id) {
                return Err(MergeError::InvalidRequest(format!(
                    "Computed variable {} collides with an existing variable",
                    def.spec
                )));
            }
            entity.variables.insert(def.spec.variable_id.clone(), def);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
