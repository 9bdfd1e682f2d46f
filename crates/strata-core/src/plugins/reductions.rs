//! Standard reductions.
//!
//! Zero-row results, per function:
//! - `sum` → `0`
//! - `mean`, `min`, `max` → empty
//! - `subsetMembership` → `0`
//! - `relativeObservationAggregator` → `[]`

use super::{format_number, parse_number};
use crate::derived::{
    DerivedVariablePlugin, Reducer, Reduction, ValidationContext, bind_config, column,
    invalid_config,
};
use crate::metadata::{DataShape, ReferenceMetadata, VariableType};
use crate::primitives::EMPTY_VALUE;
use crate::types::{DerivedVariableSpec, Filter, MergeError, Row, VariableSpec};
use serde::{Deserialize, Serialize};

pub const SUM: &str = "sum";
pub const MEAN: &str = "mean";
pub const MIN: &str = "min";
pub const MAX: &str = "max";
pub const SUBSET_MEMBERSHIP: &str = "subsetMembership";
pub const RELATIVE_OBSERVATION_AGGREGATOR: &str = "relativeObservationAggregator";

// =============================================================================
// SINGLE NUMERIC VARIABLE REDUCTIONS
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleNumericVarConfig {
    input_variable: VariableSpec,
    #[serde(default)]
    impute_zero: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumericFold {
    Sum,
    Mean,
    Min,
    Max,
}

impl NumericFold {
    const fn function_name(self) -> &'static str {
        match self {
            Self::Sum => SUM,
            Self::Mean => MEAN,
            Self::Min => MIN,
            Self::Max => MAX,
        }
    }
}

/// `sum`, `mean`, `min` or `max` over one numeric input.
///
/// Blank values are skipped unless `imputeZero` is set.
#[derive(Debug)]
struct SingleNumericVarReduction {
    fold: NumericFold,
    input: VariableSpec,
    input_column: String,
    impute_zero: bool,
}

impl DerivedVariablePlugin for SingleNumericVarReduction {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.input.clone()]
    }

    fn validate_inputs(&self, ctx: &ValidationContext<'_>) -> Result<(), MergeError> {
        ctx.check_variable(
            "Input",
            &self.input,
            &[VariableType::Integer, VariableType::Number],
        )?;
        Ok(())
    }

    fn variable_type(&self) -> VariableType {
        VariableType::Number
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Continuous
    }
}

impl Reduction for SingleNumericVarReduction {
    fn create_reducer(&self) -> Box<dyn Reducer> {
        Box::new(NumericReducer {
            fold: self.fold,
            input: self.input.clone(),
            input_column: self.input_column.clone(),
            impute_zero: self.impute_zero,
            count: 0,
            acc: 0.0,
        })
    }
}

struct NumericReducer {
    fold: NumericFold,
    input: VariableSpec,
    input_column: String,
    impute_zero: bool,
    count: usize,
    acc: f64,
}

impl Reducer for NumericReducer {
    fn add_row(&mut self, row: &Row) -> Result<(), MergeError> {
        let raw = column(row, &self.input_column)?;
        let value = match parse_number(self.fold.function_name(), &self.input, raw)? {
            Some(v) => v,
            None if self.impute_zero => 0.0,
            None => return Ok(()),
        };
        self.acc = match (self.fold, self.count) {
            (_, 0) => value,
            (NumericFold::Sum | NumericFold::Mean, _) => self.acc + value,
            (NumericFold::Min, _) => self.acc.min(value),
            (NumericFold::Max, _) => self.acc.max(value),
        };
        self.count += 1;
        Ok(())
    }

    fn resulting_value(self: Box<Self>) -> String {
        match (self.fold, self.count) {
            (NumericFold::Sum, 0) => "0".to_string(),
            (_, 0) => EMPTY_VALUE.to_string(),
            (NumericFold::Mean, n) => format_number(self.acc / n as f64),
            _ => format_number(self.acc),
        }
    }
}

fn numeric(
    fold: NumericFold,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Reduction>, MergeError> {
    let config: SingleNumericVarConfig = bind_config(spec)?;
    Ok(Box::new(SingleNumericVarReduction {
        fold,
        input_column: config.input_variable.dot_notation(),
        input: config.input_variable,
        impute_zero: config.impute_zero,
    }))
}

pub fn sum(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Reduction>, MergeError> {
    numeric(NumericFold::Sum, spec)
}

pub fn mean(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Reduction>, MergeError> {
    numeric(NumericFold::Mean, spec)
}

pub fn min(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Reduction>, MergeError> {
    numeric(NumericFold::Min, spec)
}

pub fn max(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Reduction>, MergeError> {
    numeric(NumericFold::Max, spec)
}

// =============================================================================
// SUBSET MEMBERSHIP
// =============================================================================

pub const MEMBER: &str = "1";
pub const NOT_MEMBER: &str = "0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsetMembershipConfig {
    #[serde(default)]
    subset_filters: Vec<Filter>,
}

/// `1` if the entity's own row survives the subset filters, else `0`.
#[derive(Debug)]
struct SubsetMembership {
    id_variable: VariableSpec,
    subset_filters: Vec<Filter>,
}

impl DerivedVariablePlugin for SubsetMembership {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.id_variable.clone()]
    }

    fn variable_type(&self) -> VariableType {
        VariableType::Integer
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Binary
    }

    fn vocabulary(&self) -> Option<Vec<String>> {
        Some(vec![MEMBER.to_string(), NOT_MEMBER.to_string()])
    }
}

impl Reduction for SubsetMembership {
    fn filters_override(&self) -> Option<Vec<Filter>> {
        Some(self.subset_filters.clone())
    }

    fn create_reducer(&self) -> Box<dyn Reducer> {
        Box::new(MembershipReducer(false))
    }
}

struct MembershipReducer(bool);

impl Reducer for MembershipReducer {
    fn add_row(&mut self, _row: &Row) -> Result<(), MergeError> {
        self.0 = true;
        Ok(())
    }

    fn resulting_value(self: Box<Self>) -> String {
        (if self.0 { MEMBER } else { NOT_MEMBER }).to_string()
    }
}

pub fn subset_membership(
    metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Reduction>, MergeError> {
    let config: SubsetMembershipConfig = bind_config(spec)?;
    let id_variable = metadata.entity(&spec.entity_id)?.id_variable();
    Ok(Box::new(SubsetMembership {
        id_variable,
        subset_filters: config.subset_filters,
    }))
}

// =============================================================================
// RELATIVE OBSERVATION AGGREGATOR
// =============================================================================

/// Config of the aggregator; normally generated by the relative
/// observation calculator rather than written by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelativeObservationAggregatorConfig {
    pub var_description: String,
    pub variable: VariableSpec,
    pub timestamp_variable: VariableSpec,
    pub true_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters_override: Option<Vec<Filter>>,
}

/// Collects `id\ttimestamp` for every row whose value is a true value.
#[derive(Debug)]
struct RelativeObservationAggregator {
    config: RelativeObservationAggregatorConfig,
    variable_column: String,
    timestamp_column: String,
    id_column: String,
}

impl DerivedVariablePlugin for RelativeObservationAggregator {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![
            self.config.variable.clone(),
            self.config.timestamp_variable.clone(),
        ]
    }

    fn validate_inputs(&self, ctx: &ValidationContext<'_>) -> Result<(), MergeError> {
        ctx.variable(&self.config.variable)?;
        ctx.check_variable(
            &format!("{} timestamp", self.config.var_description),
            &self.config.timestamp_variable,
            &[VariableType::Date],
        )?;
        Ok(())
    }

    fn variable_type(&self) -> VariableType {
        VariableType::String
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Continuous
    }
}

impl Reduction for RelativeObservationAggregator {
    fn filters_override(&self) -> Option<Vec<Filter>> {
        self.config.filters_override.clone()
    }

    fn create_reducer(&self) -> Box<dyn Reducer> {
        Box::new(ObservationCollector {
            true_values: self.config.true_values.clone(),
            variable_column: self.variable_column.clone(),
            timestamp_column: self.timestamp_column.clone(),
            id_column: self.id_column.clone(),
            observations: Vec::new(),
        })
    }
}

struct ObservationCollector {
    true_values: Vec<String>,
    variable_column: String,
    timestamp_column: String,
    id_column: String,
    observations: Vec<serde_json::Value>,
}

impl Reducer for ObservationCollector {
    fn add_row(&mut self, row: &Row) -> Result<(), MergeError> {
        let value = column(row, &self.variable_column)?;
        if !self.true_values.iter().any(|t| t == value) {
            return Ok(());
        }
        let timestamp = column(row, &self.timestamp_column)?;
        if timestamp.trim().is_empty() {
            return Ok(());
        }
        let id = column(row, &self.id_column)?;
        self.observations
            .push(serde_json::Value::String(format!("{}\t{}", id, timestamp)));
        Ok(())
    }

    fn resulting_value(self: Box<Self>) -> String {
        serde_json::Value::Array(self.observations).to_string()
    }
}

pub fn relative_observation_aggregator(
    metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Reduction>, MergeError> {
    let config: RelativeObservationAggregatorConfig = bind_config(spec)?;
    if config.variable.entity_id != config.timestamp_variable.entity_id {
        return Err(invalid_config(
            spec,
            format!(
                "{0} variable must have the same entity as {0} timestamp variable",
                config.var_description
            ),
        ));
    }
    let id_column = metadata.entity(&config.variable.entity_id)?.id_column();
    Ok(Box::new(RelativeObservationAggregator {
        variable_column: config.variable.dot_notation(),
        timestamp_column: config.timestamp_variable.dot_notation(),
        id_column,
        config,
    }))
}

// =============================================================================
// TESTS
// =============================================================================
