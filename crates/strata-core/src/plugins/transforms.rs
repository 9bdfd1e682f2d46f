//! Standard transforms.

use super::reductions::{
    MEMBER, NOT_MEMBER, RELATIVE_OBSERVATION_AGGREGATOR, RelativeObservationAggregatorConfig,
};
use super::units::Unit;
use super::{format_number, parse_number};
use crate::derived::{
    DerivedVariablePlugin, Transform, ValidationContext, bind_config, column, invalid_config,
};
use crate::metadata::{DataShape, ReferenceMetadata, VariableType};
use crate::primitives::EMPTY_VALUE;
use crate::types::{DerivedVariableSpec, Filter, MergeError, Row, VariableSpec};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const CONCATENATION: &str = "concatenation";
pub const CATEGORICAL_RECODING: &str = "categoricalRecoding";
pub const CONTINUOUS_TO_ORDINAL: &str = "continuousToOrdinal";
pub const RELATIVE_OBSERVATION_CALCULATOR: &str = "relativeObservationCalculator";
pub const RELATIVE_OBSERVATION_MIN_TIME_INTERVAL: &str = "relativeObservationMinTimeInterval";
pub const BODY_MASS_INDEX: &str = "bodyMassIndex";
pub const UNIT_CONVERSION: &str = "unitConversion";
pub const ADVANCED_SUBSET: &str = "advancedSubset";

// =============================================================================
// CONCATENATION
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConcatenationConfig {
    input_variables: Vec<VariableSpec>,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    suffix: String,
    #[serde(default)]
    delimiter: String,
}

#[derive(Debug)]
struct Concatenation {
    config: ConcatenationConfig,
    input_columns: Vec<String>,
}

impl DerivedVariablePlugin for Concatenation {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        self.config.input_variables.clone()
    }

    fn variable_type(&self) -> VariableType {
        VariableType::String
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Continuous
    }
}

impl Transform for Concatenation {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        let parts = self
            .input_columns
            .iter()
            .map(|c| column(row, c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!(
            "{}{}{}",
            self.config.prefix,
            parts.join(&self.config.delimiter),
            self.config.suffix
        ))
    }
}

pub fn concatenation(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: ConcatenationConfig = bind_config(spec)?;
    if config.input_variables.is_empty() {
        return Err(invalid_config(spec, "at least one input variable is required"));
    }
    let input_columns = config
        .input_variables
        .iter()
        .map(VariableSpec::dot_notation)
        .collect();
    Ok(Box::new(Concatenation {
        config,
        input_columns,
    }))
}

// =============================================================================
// CATEGORICAL RECODING
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecodingRule {
    input_values: Vec<String>,
    output_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategoricalRecodingConfig {
    input_variable: VariableSpec,
    rules: Vec<RecodingRule>,
    #[serde(default)]
    unmapped_value: Option<String>,
}

#[derive(Debug)]
struct CategoricalRecoding {
    input: VariableSpec,
    input_column: String,
    rules: Vec<RecodingRule>,
    unmapped_value: String,
}

impl DerivedVariablePlugin for CategoricalRecoding {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.input.clone()]
    }

    fn validate_inputs(&self, ctx: &ValidationContext<'_>) -> Result<(), MergeError> {
        let def = ctx.variable(&self.input)?;
        if !matches!(def.data_shape, DataShape::Categorical | DataShape::Binary) {
            return Err(ctx.invalid(format!(
                "Input variable {} must be categorical or binary, found {:?}",
                self.input, def.data_shape
            )));
        }
        Ok(())
    }

    fn variable_type(&self) -> VariableType {
        VariableType::String
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Categorical
    }

    fn vocabulary(&self) -> Option<Vec<String>> {
        let mut vocabulary: Vec<String> =
            self.rules.iter().map(|r| r.output_value.clone()).collect();
        vocabulary.push(self.unmapped_value.clone());
        Some(vocabulary)
    }
}

impl Transform for CategoricalRecoding {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        let input = column(row, &self.input_column)?;
        let recoded = self
            .rules
            .iter()
            .find(|rule| rule.input_values.iter().any(|v| v == input))
            .map_or(&self.unmapped_value, |rule| &rule.output_value);
        Ok(recoded.clone())
    }
}

pub fn categorical_recoding(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: CategoricalRecodingConfig = bind_config(spec)?;
    Ok(Box::new(CategoricalRecoding {
        input_column: config.input_variable.dot_notation(),
        input: config.input_variable,
        rules: config.rules,
        unmapped_value: config
            .unmapped_value
            .unwrap_or_else(|| EMPTY_VALUE.to_string()),
    }))
}

// =============================================================================
// CONTINUOUS TO ORDINAL
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrdinalRule {
    #[serde(default)]
    min_inclusive: Option<f64>,
    #[serde(default)]
    max_exclusive: Option<f64>,
    output_value: String,
}

impl OrdinalRule {
    fn matches(&self, value: f64) -> bool {
        self.min_inclusive.is_none_or(|min| value >= min)
            && self.max_exclusive.is_none_or(|max| value < max)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContinuousToOrdinalConfig {
    input_variable: VariableSpec,
    rules: Vec<OrdinalRule>,
    #[serde(default)]
    unmapped_value: Option<String>,
}

#[derive(Debug)]
struct ContinuousToOrdinal {
    input: VariableSpec,
    input_column: String,
    rules: Vec<OrdinalRule>,
    unmapped_value: String,
    impute_zero: bool,
}

impl DerivedVariablePlugin for ContinuousToOrdinal {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.input.clone()]
    }

    fn validate_inputs(&self, ctx: &ValidationContext<'_>) -> Result<(), MergeError> {
        let def = ctx.check_variable(
            "Input",
            &self.input,
            &[VariableType::Integer, VariableType::Number],
        )?;
        if def.data_shape != DataShape::Continuous {
            return Err(ctx.invalid(format!(
                "Input variable {} must be continuous, found {:?}",
                self.input, def.data_shape
            )));
        }
        Ok(())
    }

    fn variable_type(&self) -> VariableType {
        VariableType::String
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Ordinal
    }

    fn vocabulary(&self) -> Option<Vec<String>> {
        Some(self.rules.iter().map(|r| r.output_value.clone()).collect())
    }
}

impl Transform for ContinuousToOrdinal {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        let raw = column(row, &self.input_column)?;
        let value = match parse_number(CONTINUOUS_TO_ORDINAL, &self.input, raw)? {
            Some(v) => v,
            None if self.impute_zero => 0.0,
            None => return Ok(EMPTY_VALUE.to_string()),
        };
        let label = self
            .rules
            .iter()
            .find(|rule| rule.matches(value))
            .map_or(&self.unmapped_value, |rule| &rule.output_value);
        Ok(label.clone())
    }
}

pub fn continuous_to_ordinal(
    metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: ContinuousToOrdinalConfig = bind_config(spec)?;
    // Derived inputs are not catalogued yet and never impute.
    let impute_zero = metadata
        .variable(&config.input_variable)
        .map(|def| def.impute_zero)
        .unwrap_or(false);
    Ok(Box::new(ContinuousToOrdinal {
        input_column: config.input_variable.dot_notation(),
        input: config.input_variable,
        rules: config.rules,
        unmapped_value: config
            .unmapped_value
            .unwrap_or_else(|| EMPTY_VALUE.to_string()),
        impute_zero,
    }))
}

// =============================================================================
// BODY MASS INDEX
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodyMassIndexConfig {
    height_variable: VariableSpec,
    weight_variable: VariableSpec,
}

/// kg / m², with height and weight converted from their catalogued units.
#[derive(Debug)]
struct BodyMassIndex {
    spec: DerivedVariableSpec,
    height: VariableSpec,
    height_column: String,
    weight: VariableSpec,
    weight_column: String,
    /// Height and weight units, resolved during validation.
    units: OnceLock<(Unit, Unit)>,
}

impl BodyMassIndex {
    fn unit_of(
        ctx: &ValidationContext<'_>,
        label: &str,
        variable: &VariableSpec,
        compatible_with: Unit,
    ) -> Result<Unit, MergeError> {
        let def = ctx.check_variable(
            label,
            variable,
            &[VariableType::Integer, VariableType::Number],
        )?;
        def.units
            .as_deref()
            .and_then(Unit::find)
            .filter(|unit| unit.is_compatible_with(compatible_with))
            .ok_or_else(|| {
                ctx.invalid(format!(
                    "{} variable {} must have a unit compatible with {}",
                    label, variable, compatible_with
                ))
            })
    }
}

impl DerivedVariablePlugin for BodyMassIndex {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.height.clone(), self.weight.clone()]
    }

    fn validate_inputs(&self, ctx: &ValidationContext<'_>) -> Result<(), MergeError> {
        let height = Self::unit_of(ctx, "Height", &self.height, Unit::Meter)?;
        let weight = Self::unit_of(ctx, "Weight", &self.weight, Unit::Kilogram)?;
        self.units.get_or_init(|| (height, weight));
        Ok(())
    }

    fn variable_type(&self) -> VariableType {
        VariableType::Number
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Continuous
    }
}

impl Transform for BodyMassIndex {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        let &(height_unit, weight_unit) = self
            .units
            .get()
            .ok_or_else(|| invalid_config(&self.spec, "input units were never validated"))?;
        let height = parse_number(BODY_MASS_INDEX, &self.height, column(row, &self.height_column)?)?;
        let weight = parse_number(BODY_MASS_INDEX, &self.weight, column(row, &self.weight_column)?)?;
        let (Some(height), Some(weight)) = (height, weight) else {
            return Ok(EMPTY_VALUE.to_string());
        };
        let meters = height_unit.convert_to(Unit::Meter, height);
        let kilograms = weight_unit.convert_to(Unit::Kilogram, weight);
        let bmi = kilograms / (meters * meters);
        if !bmi.is_finite() {
            return Ok(EMPTY_VALUE.to_string());
        }
        Ok(format_number(bmi))
    }
}

pub fn body_mass_index(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: BodyMassIndexConfig = bind_config(spec)?;
    Ok(Box::new(BodyMassIndex {
        spec: spec.clone(),
        height_column: config.height_variable.dot_notation(),
        height: config.height_variable,
        weight_column: config.weight_variable.dot_notation(),
        weight: config.weight_variable,
        units: OnceLock::new(),
    }))
}

// =============================================================================
// UNIT CONVERSION
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitConversionConfig {
    input_variable: VariableSpec,
    output_units: String,
}

#[derive(Debug)]
struct UnitConversion {
    spec: DerivedVariableSpec,
    input: VariableSpec,
    input_column: String,
    output_label: String,
    output_unit: Unit,
    input_unit: OnceLock<Unit>,
}

impl DerivedVariablePlugin for UnitConversion {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.input.clone()]
    }

    fn validate_inputs(&self, ctx: &ValidationContext<'_>) -> Result<(), MergeError> {
        let def = ctx.check_variable(
            "Input",
            &self.input,
            &[VariableType::Integer, VariableType::Number],
        )?;
        let label = def.units.as_deref().ok_or_else(|| {
            ctx.invalid(format!(
                "Input variable {} has no units to convert from",
                self.input
            ))
        })?;
        let unit = Unit::find(label).ok_or_else(|| {
            ctx.invalid(format!(
                "Input variable {} has unit '{}' which is not convertible",
                self.input, label
            ))
        })?;
        if !unit.is_compatible_with(self.output_unit) {
            return Err(ctx.invalid(format!(
                "Output unit {} is not compatible with input unit {}",
                self.output_unit, unit
            )));
        }
        self.input_unit.get_or_init(|| unit);
        Ok(())
    }

    fn variable_type(&self) -> VariableType {
        VariableType::Number
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Continuous
    }

    fn units(&self) -> Option<String> {
        Some(self.output_label.clone())
    }
}

impl Transform for UnitConversion {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        let input_unit = *self
            .input_unit
            .get()
            .ok_or_else(|| invalid_config(&self.spec, "input unit was never validated"))?;
        let raw = column(row, &self.input_column)?;
        Ok(match parse_number(UNIT_CONVERSION, &self.input, raw)? {
            Some(value) => format_number(input_unit.convert_to(self.output_unit, value)),
            None => EMPTY_VALUE.to_string(),
        })
    }
}

pub fn unit_conversion(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: UnitConversionConfig = bind_config(spec)?;
    let output_unit = Unit::find(&config.output_units).ok_or_else(|| {
        invalid_config(
            spec,
            format!("Output unit '{}' is not a valid unit", config.output_units),
        )
    })?;
    Ok(Box::new(UnitConversion {
        spec: spec.clone(),
        input_column: config.input_variable.dot_notation(),
        input: config.input_variable,
        output_label: config.output_units,
        output_unit,
        input_unit: OnceLock::new(),
    }))
}

// =============================================================================
// ADVANCED SUBSET
// =============================================================================

/// Upper bound on steps in one set-operation tree.
const MAX_SUBSET_STEPS: usize = 256;

const DEFAULT_TRUE_VALUES: [&str; 3] = ["1", "true", "yes"];

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
enum SetOperation {
    Intersect,
    Union,
    Minus,
}

impl SetOperation {
    const fn apply(self, left: bool, right: bool) -> bool {
        match self {
            Self::Intersect => left && right,
            Self::Union => left || right,
            Self::Minus => left && !right,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsetStep {
    key: String,
    operation: SetOperation,
    #[serde(default)]
    left_step_key: Option<String>,
    #[serde(default)]
    left_variable: Option<VariableSpec>,
    #[serde(default)]
    left_variable_true_values: Option<Vec<String>>,
    #[serde(default)]
    right_step_key: Option<String>,
    #[serde(default)]
    right_variable: Option<VariableSpec>,
    #[serde(default)]
    right_variable_true_values: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdvancedSubsetConfig {
    steps: Vec<SubsetStep>,
    root_step_key: String,
}

#[derive(Debug)]
enum SubsetNode {
    Step {
        operation: SetOperation,
        left: Box<SubsetNode>,
        right: Box<SubsetNode>,
    },
    Variable {
        column: String,
        true_values: Vec<String>,
    },
}

impl SubsetNode {
    fn test(&self, row: &Row) -> Result<bool, MergeError> {
        match self {
            Self::Step {
                operation,
                left,
                right,
            } => Ok(operation.apply(left.test(row)?, right.test(row)?)),
            Self::Variable {
                column: name,
                true_values,
            } => {
                let value = column(row, name)?;
                Ok(true_values.iter().any(|v| v == value))
            }
        }
    }
}

/// Builds the tree by taking steps out of `steps`, so each step is used at
/// most once and no cycle can form.
struct SubsetTreeBuilder<'a> {
    spec: &'a DerivedVariableSpec,
    steps: BTreeMap<String, SubsetStep>,
    inputs: BTreeMap<String, VariableSpec>,
}

impl SubsetTreeBuilder<'_> {
    fn step(&mut self, key: &str) -> Result<SubsetNode, MergeError> {
        let step = self.steps.remove(key).ok_or_else(|| {
            invalid_config(
                self.spec,
                format!(
                    "Step key '{}' does not match any step or is referenced more than once",
                    key
                ),
            )
        })?;
        let left = self.child(
            "left",
            step.left_step_key,
            step.left_variable,
            step.left_variable_true_values,
        )?;
        let right = self.child(
            "right",
            step.right_step_key,
            step.right_variable,
            step.right_variable_true_values,
        )?;
        Ok(SubsetNode::Step {
            operation: step.operation,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn child(
        &mut self,
        side: &str,
        step_key: Option<String>,
        variable: Option<VariableSpec>,
        true_values: Option<Vec<String>>,
    ) -> Result<SubsetNode, MergeError> {
        match (step_key, variable) {
            (Some(key), None) => self.step(&key),
            (None, Some(variable)) => {
                let column = variable.dot_notation();
                self.inputs.insert(column.clone(), variable);
                Ok(SubsetNode::Variable {
                    column,
                    true_values: true_values.unwrap_or_else(|| {
                        DEFAULT_TRUE_VALUES.iter().map(ToString::to_string).collect()
                    }),
                })
            }
            _ => Err(invalid_config(
                self.spec,
                format!(
                    "Each step needs exactly one of a {side} step key or a {side} variable"
                ),
            )),
        }
    }
}

/// 1 when the row falls in the set-operation tree, else 0.
#[derive(Debug)]
struct AdvancedSubset {
    root: SubsetNode,
    inputs: Vec<VariableSpec>,
}

impl DerivedVariablePlugin for AdvancedSubset {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        self.inputs.clone()
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

impl Transform for AdvancedSubset {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        let inside = self.root.test(row)?;
        Ok(if inside { MEMBER } else { NOT_MEMBER }.to_string())
    }
}

pub fn advanced_subset(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: AdvancedSubsetConfig = bind_config(spec)?;
    if config.steps.len() > MAX_SUBSET_STEPS {
        return Err(invalid_config(
            spec,
            format!("at most {} steps are allowed", MAX_SUBSET_STEPS),
        ));
    }
    let step_count = config.steps.len();
    let steps: BTreeMap<String, SubsetStep> = config
        .steps
        .into_iter()
        .map(|step| (step.key.clone(), step))
        .collect();
    if steps.len() != step_count {
        return Err(invalid_config(spec, "step keys must be unique"));
    }

    let mut builder = SubsetTreeBuilder {
        spec,
        steps,
        inputs: BTreeMap::new(),
    };
    let root = builder.step(&config.root_step_key)?;
    if !builder.steps.is_empty() {
        return Err(invalid_config(
            spec,
            format!(
                "unused steps: {}",
                builder.steps.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        ));
    }
    Ok(Box::new(AdvancedSubset {
        root,
        inputs: builder.inputs.into_values().collect(),
    }))
}

// =============================================================================
// RELATIVE OBSERVATIONS
// =============================================================================

/// Shared config of the relative observation calculator and its per-row
/// min-time-interval view.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelatedObservationConfig {
    anchor_variable: VariableSpec,
    anchor_timestamp_variable: VariableSpec,
    anchor_variable_true_values: Vec<String>,
    target_variable: VariableSpec,
    target_timestamp_variable: VariableSpec,
    target_variable_true_values: Vec<String>,
    #[serde(default)]
    minimum_time_interval_days: Option<i64>,
    #[serde(default)]
    related_observations_subset: Option<Vec<Filter>>,
}

/// For each anchor observation under one row, the smallest gap in days to
/// a target observation that exceeds the minimum interval.
///
/// Output is a JSON object of anchor id to day gap.
#[derive(Debug)]
struct RelativeObservationCalculator {
    min_interval_days: i64,
    anchor_spec: DerivedVariableSpec,
    anchor_column: String,
    target_spec: DerivedVariableSpec,
    target_column: String,
}

impl DerivedVariablePlugin for RelativeObservationCalculator {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.anchor_spec.key(), self.target_spec.key()]
    }

    fn depended_derived_var_specs(&self) -> Vec<DerivedVariableSpec> {
        vec![self.anchor_spec.clone(), self.target_spec.clone()]
    }

    fn variable_type(&self) -> VariableType {
        VariableType::String
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Continuous
    }
}

impl Transform for RelativeObservationCalculator {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        let mut target_days = observations(&self.target_column, row)?
            .into_iter()
            .map(|(_, days)| days)
            .collect::<Vec<_>>();
        target_days.sort_unstable();

        let mut gaps = serde_json::Map::new();
        for (anchor_id, anchor_days) in observations(&self.anchor_column, row)? {
            if let Some(gap) = target_days
                .iter()
                .map(|target| target - anchor_days)
                .find(|gap| *gap > self.min_interval_days)
            {
                gaps.insert(anchor_id, serde_json::Value::from(gap));
            }
        }
        Ok(serde_json::Value::Object(gaps).to_string())
    }
}

/// Decode an aggregator column into `(id, epoch days)` pairs.
fn observations(column_name: &str, row: &Row) -> Result<Vec<(String, i64)>, MergeError> {
    let raw = column(row, column_name)?;
    let invalid = || MergeError::InvalidValue {
        function_name: RELATIVE_OBSERVATION_CALCULATOR.to_string(),
        variable: column_name.to_string(),
        value: raw.to_string(),
    };
    let entries: Vec<String> = serde_json::from_str(raw).map_err(|_| invalid())?;
    entries
        .iter()
        .map(|entry| {
            let (id, timestamp) = entry.split_once('\t').ok_or_else(invalid)?;
            let days = epoch_days(timestamp).ok_or_else(invalid)?;
            Ok((id.to_string(), days))
        })
        .collect()
}

/// Days since 1970-01-01 for a date or date-time string.
fn epoch_days(raw: &str) -> Option<i64> {
    const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;
    let raw = raw.trim();
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_utc().date())
        })?;
    Some(i64::from(date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE)
}

fn aggregator_spec(
    owner: &DerivedVariableSpec,
    suffix: &str,
    variable: &VariableSpec,
    timestamp_variable: &VariableSpec,
    true_values: &[String],
    filters_override: Option<Vec<Filter>>,
) -> Result<DerivedVariableSpec, MergeError> {
    let variable_id = format!("{}_{}", owner.variable_id, suffix);
    let config = RelativeObservationAggregatorConfig {
        var_description: suffix.to_string(),
        variable: variable.clone(),
        timestamp_variable: timestamp_variable.clone(),
        true_values: true_values.to_vec(),
        filters_override,
    };
    Ok(DerivedVariableSpec {
        entity_id: owner.entity_id.clone(),
        variable_id: variable_id.clone(),
        function_name: RELATIVE_OBSERVATION_AGGREGATOR.to_string(),
        display_name: variable_id,
        config: serde_json::to_value(config).map_err(|e| invalid_config(owner, e.to_string()))?,
    })
}

pub fn relative_observation_calculator(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: RelatedObservationConfig = bind_config(spec)?;
    let anchor_spec = aggregator_spec(
        spec,
        "anchor",
        &config.anchor_variable,
        &config.anchor_timestamp_variable,
        &config.anchor_variable_true_values,
        config.related_observations_subset.clone(),
    )?;
    let target_spec = aggregator_spec(
        spec,
        "target",
        &config.target_variable,
        &config.target_timestamp_variable,
        &config.target_variable_true_values,
        config.related_observations_subset.clone(),
    )?;
    Ok(Box::new(RelativeObservationCalculator {
        min_interval_days: config.minimum_time_interval_days.unwrap_or(0).max(0),
        anchor_column: anchor_spec.key().dot_notation(),
        anchor_spec,
        target_column: target_spec.key().dot_notation(),
        target_spec,
    }))
}

/// Per-anchor-row view of the calculator: the gap recorded for this row's
/// id, or empty when the row is not an anchor or has no qualifying target.
#[derive(Debug)]
struct RelativeObservationMinTimeInterval {
    calculator_spec: DerivedVariableSpec,
    calculator_column: String,
    id_column: String,
}

impl DerivedVariablePlugin for RelativeObservationMinTimeInterval {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.calculator_spec.key()]
    }

    fn depended_derived_var_specs(&self) -> Vec<DerivedVariableSpec> {
        vec![self.calculator_spec.clone()]
    }

    fn variable_type(&self) -> VariableType {
        VariableType::Integer
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Continuous
    }
}

impl Transform for RelativeObservationMinTimeInterval {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        let raw = column(row, &self.calculator_column)?;
        let gaps: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(raw).map_err(|_| MergeError::InvalidValue {
                function_name: RELATIVE_OBSERVATION_MIN_TIME_INTERVAL.to_string(),
                variable: self.calculator_column.clone(),
                value: raw.to_string(),
            })?;
        let id = column(row, &self.id_column)?;
        Ok(gaps
            .get(id)
            .and_then(serde_json::Value::as_i64)
            .map_or_else(|| EMPTY_VALUE.to_string(), |gap| gap.to_string()))
    }
}

pub fn relative_observation_min_time_interval(
    metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: RelatedObservationConfig = bind_config(spec)?;
    if config.anchor_variable.entity_id != spec.entity_id {
        return Err(invalid_config(
            spec,
            "anchor variable must be on the derived variable's entity",
        ));
    }

    let target_ancestors = metadata.ancestors(&config.target_variable.entity_id)?;
    let shared = metadata
        .ancestors(&spec.entity_id)?
        .into_iter()
        .find(|a| target_ancestors.iter().any(|t| t.id == a.id))
        .ok_or_else(|| {
            invalid_config(
                spec,
                "anchor and target variables share no ancestor entity",
            )
        })?;

    let calculator_id = format!("{}_calc", spec.variable_id);
    let calculator_spec = DerivedVariableSpec {
        entity_id: shared.id.clone(),
        variable_id: calculator_id.clone(),
        function_name: RELATIVE_OBSERVATION_CALCULATOR.to_string(),
        display_name: calculator_id,
        config: spec.config.clone(),
    };
    Ok(Box::new(RelativeObservationMinTimeInterval {
        calculator_column: calculator_spec.key().dot_notation(),
        calculator_spec,
        id_column: metadata.entity(&spec.entity_id)?.id_column(),
    }))
}

// =============================================================================
// TESTS
// =============================================================================
