//! # Standard Plugins
//!
//! The transforms and reductions available to every request.
//!
//! ## Transforms
//! - `concatenation`: prefix + inputs joined by a delimiter + suffix
//! - `categoricalRecoding`: first matching rule's output, else the unmapped value
//! - `continuousToOrdinal`: numeric `[min, max)` ranges to ordinal labels
//! - `relativeObservationCalculator`: per-anchor day gap to the next target event
//! - `relativeObservationMinTimeInterval`: one anchor row's gap, read from the calculator
//! - `bodyMassIndex`: kg / m² from a height and a weight with catalogued units
//! - `unitConversion`: one numeric input rescaled into a compatible unit
//! - `advancedSubset`: 1/0 from a tree of intersect/union/minus steps over binary inputs
//!
//! ## Reductions
//! - `sum`, `mean`, `min`, `max`: numeric folds over one input
//! - `subsetMembership`: whether any row survives the subset filters
//! - `relativeObservationAggregator`: qualifying `id\ttimestamp` pairs as a JSON array

pub mod reductions;
pub mod transforms;
pub mod units;

use crate::derived::PluginRegistry;
use crate::types::{MergeError, VariableSpec};

/// Registry holding every standard plugin.
#[must_use]
pub fn standard_registry() -> PluginRegistry {
    PluginRegistry::empty()
        .with_transform(transforms::CONCATENATION, transforms::concatenation)
        .with_transform(transforms::CATEGORICAL_RECODING, transforms::categorical_recoding)
        .with_transform(transforms::CONTINUOUS_TO_ORDINAL, transforms::continuous_to_ordinal)
        .with_transform(
            transforms::RELATIVE_OBSERVATION_CALCULATOR,
            transforms::relative_observation_calculator,
        )
        .with_transform(
            transforms::RELATIVE_OBSERVATION_MIN_TIME_INTERVAL,
            transforms::relative_observation_min_time_interval,
        )
        .with_transform(transforms::BODY_MASS_INDEX, transforms::body_mass_index)
        .with_transform(transforms::UNIT_CONVERSION, transforms::unit_conversion)
        .with_transform(transforms::ADVANCED_SUBSET, transforms::advanced_subset)
        .with_reduction(reductions::SUM, reductions::sum)
        .with_reduction(reductions::MEAN, reductions::mean)
        .with_reduction(reductions::MIN, reductions::min)
        .with_reduction(reductions::MAX, reductions::max)
        .with_reduction(reductions::SUBSET_MEMBERSHIP, reductions::subset_membership)
        .with_reduction(
            reductions::RELATIVE_OBSERVATION_AGGREGATOR,
            reductions::relative_observation_aggregator,
        )
}

/// Render a number: integers without a fraction, everything else in the
/// shortest form that round-trips.
#[must_use]
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Parse a numeric cell; blank cells are `None`.
pub fn parse_number(
    function_name: &str,
    variable: &VariableSpec,
    raw: &str,
) -> Result<Option<f64>, MergeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<f64>()
        .map(Some)
        .map_err(|_| MergeError::InvalidValue {
            function_name: function_name.to_string(),
            variable: variable.dot_notation(),
            value: raw.to_string(),
        })
}
