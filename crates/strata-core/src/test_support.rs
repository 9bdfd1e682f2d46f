//! Shared fixtures for unit tests.

use crate::derived::{
    DerivedVariableFactory, DerivedVariablePlugin, PluginRegistry, Reducer, Reduction, Transform,
    bind_config, column, invalid_config,
};
use crate::metadata::{
    DataShape, EntityDetail, ReferenceMetadata, StudyDetail, VariableDetail, VariableType,
};
use crate::plugins::standard_registry;
use crate::stream::DataStream;
use crate::types::{DerivedVariableSpec, MergeError, Row, VariableSpec};
use serde::Deserialize;
use serde_json::json;
use std::io::Cursor;

fn var(id: &str, variable_type: VariableType, data_shape: DataShape) -> VariableDetail {
    VariableDetail {
        id: id.to_string(),
        display_name: String::new(),
        variable_type,
        data_shape,
        vocabulary: None,
        units: None,
        impute_zero: false,
    }
}

fn entity(
    id: &str,
    id_column: &str,
    variables: Vec<VariableDetail>,
    children: Vec<EntityDetail>,
) -> EntityDetail {
    EntityDetail {
        id: id.to_string(),
        display_name: String::new(),
        id_column_name: id_column.to_string(),
        variables,
        children,
    }
}

/// household -> { participant -> sample, dwelling }
pub fn household_study() -> StudyDetail {
    let sample = entity(
        "sample",
        "sample_id",
        vec![
            var("value", VariableType::Number, DataShape::Continuous),
            var("collected", VariableType::Date, DataShape::Continuous),
            var("positive", VariableType::String, DataShape::Binary),
        ],
        vec![],
    );
    let participant = entity(
        "participant",
        "participant_id",
        vec![
            var("age", VariableType::Integer, DataShape::Continuous),
            var("sex", VariableType::String, DataShape::Categorical),
            var("name", VariableType::String, DataShape::Categorical),
        ],
        vec![sample],
    );
    let dwelling = entity(
        "dwelling",
        "dwelling_id",
        vec![var("rooms", VariableType::Integer, DataShape::Continuous)],
        vec![],
    );
    StudyDetail {
        id: "study1".to_string(),
        root_entity: entity(
            "household",
            "household_id",
            vec![
                var("region", VariableType::String, DataShape::Categorical),
                var("income", VariableType::Number, DataShape::Continuous),
            ],
            vec![participant, dwelling],
        ),
    }
}

pub fn spec(entity: &str, variable: &str) -> VariableSpec {
    VariableSpec::new(entity, variable)
}

pub fn derived(
    entity: &str,
    variable: &str,
    function_name: &str,
    config: serde_json::Value,
) -> DerivedVariableSpec {
    DerivedVariableSpec {
        entity_id: entity.to_string(),
        variable_id: variable.to_string(),
        function_name: function_name.to_string(),
        display_name: variable.to_string(),
        config,
    }
}

/// A `concatenation` spec reading the given inputs.
pub fn concat(entity: &str, variable: &str, inputs: &[VariableSpec]) -> DerivedVariableSpec {
    derived(
        entity,
        variable,
        "concatenation",
        json!({ "inputVariables": inputs, "delimiter": "-" }),
    )
}

/// A `sum` spec over one input.
pub fn sum(entity: &str, variable: &str, input: &VariableSpec) -> DerivedVariableSpec {
    derived(entity, variable, "sum", json!({ "inputVariable": input }))
}

// =============================================================================
// FAKE PLUGINS
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputsConfig {
    inputs: Vec<VariableSpec>,
}

/// Reduction counting visible rows, over arbitrary inputs.
#[derive(Debug)]
struct CountRows {
    inputs: Vec<VariableSpec>,
}

struct RowCounter(usize);

impl Reducer for RowCounter {
    fn add_row(&mut self, _row: &Row) -> Result<(), MergeError> {
        self.0 += 1;
        Ok(())
    }

    fn resulting_value(self: Box<Self>) -> String {
        self.0.to_string()
    }
}

impl DerivedVariablePlugin for CountRows {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        self.inputs.clone()
    }

    fn variable_type(&self) -> VariableType {
        VariableType::Integer
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Continuous
    }
}

impl Reduction for CountRows {
    fn create_reducer(&self) -> Box<dyn Reducer> {
        Box::new(RowCounter(0))
    }
}

fn count_rows(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Reduction>, MergeError> {
    let config: InputsConfig = bind_config(spec)?;
    Ok(Box::new(CountRows {
        inputs: config.inputs,
    }))
}

/// Transform upper-casing its single input.
#[derive(Debug)]
struct Upper {
    input: VariableSpec,
    column: String,
}

impl DerivedVariablePlugin for Upper {
    fn required_input_vars(&self) -> Vec<VariableSpec> {
        vec![self.input.clone()]
    }

    fn variable_type(&self) -> VariableType {
        VariableType::String
    }

    fn data_shape(&self) -> DataShape {
        DataShape::Categorical
    }
}

impl Transform for Upper {
    fn value(&self, row: &Row) -> Result<String, MergeError> {
        Ok(column(row, &self.column)?.to_uppercase())
    }
}

fn upper(
    _metadata: &ReferenceMetadata,
    spec: &DerivedVariableSpec,
) -> Result<Box<dyn Transform>, MergeError> {
    let config: InputsConfig = bind_config(spec)?;
    let input = config
        .inputs
        .into_iter()
        .next()
        .ok_or_else(|| invalid_config(spec, "one input required"))?;
    let column = input.dot_notation();
    Ok(Box::new(Upper { input, column }))
}

/// Standard plugins plus `upper` and `countRows`.
pub fn test_registry() -> PluginRegistry {
    standard_registry()
        .with_transform("upper", upper)
        .with_reduction("countRows", count_rows)
}

pub fn upper_spec(entity: &str, variable: &str, input: &VariableSpec) -> DerivedVariableSpec {
    derived(entity, variable, "upper", json!({ "inputs": [input] }))
}

pub fn count_spec(entity: &str, variable: &str, inputs: &[VariableSpec]) -> DerivedVariableSpec {
    derived(entity, variable, "countRows", json!({ "inputs": inputs }))
}

// =============================================================================
// RESOLUTION & DATA
// =============================================================================

/// Household metadata with `specs` built, validated and incorporated.
pub fn resolve(specs: &[DerivedVariableSpec]) -> (ReferenceMetadata, DerivedVariableFactory) {
    let mut md = ReferenceMetadata::new(household_study()).expect("metadata");
    let factory = DerivedVariableFactory::build(&test_registry(), &md, specs).expect("factory");
    for dv in factory.ordered() {
        dv.validate(&md).expect("valid derived variable");
        md.incorporate_derived_variable(dv.to_variable_def())
            .expect("incorporate");
    }
    (md, factory)
}

/// An in-memory upstream stream.
pub fn data(text: &str) -> DataStream {
    Box::new(Cursor::new(text.as_bytes().to_vec()))
}
