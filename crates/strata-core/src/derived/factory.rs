//! # Derived Variable Factory
//!
//! Turns the derived-variable specs of a request into plugin instances,
//! absorbs the specs plugins generate for their own use, and orders the
//! result so producers always precede consumers.
//!
//! ## Algorithm
//!
//! 1. Worklist over request specs, then generated specs (breadth first).
//!    A repeated key from the request is an error; a generated spec that
//!    repeats an existing key is tolerated only if it is identical.
//! 2. Dependency edges come from generated specs and from inputs that name
//!    another derived variable.
//! 3. Kahn's algorithm, always releasing the earliest-declared ready
//!    variable. Anything left unreleased is reported as a cycle.

use super::{Derivation, DerivedVariable, Reduction, Transform};
use crate::metadata::ReferenceMetadata;
use crate::types::{DerivedVariableSpec, MergeError, VariableSpec};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// PLUGIN REGISTRY
// =============================================================================

/// Constructor of a transform plugin.
pub type TransformBuilder =
    fn(&ReferenceMetadata, &DerivedVariableSpec) -> Result<Box<dyn Transform>, MergeError>;

/// Constructor of a reduction plugin.
pub type ReductionBuilder =
    fn(&ReferenceMetadata, &DerivedVariableSpec) -> Result<Box<dyn Reduction>, MergeError>;

/// Immutable function-name to constructor map.
///
/// Built once at start-up and handed to every factory; tests substitute
/// their own plugin sets.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    transforms: BTreeMap<String, TransformBuilder>,
    reductions: BTreeMap<String, ReductionBuilder>,
}

impl PluginRegistry {
    /// A registry with no plugins.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_transform(mut self, function_name: &str, builder: TransformBuilder) -> Self {
        self.transforms.insert(function_name.to_string(), builder);
        self
    }

    #[must_use]
    pub fn with_reduction(mut self, function_name: &str, builder: ReductionBuilder) -> Self {
        self.reductions.insert(function_name.to_string(), builder);
        self
    }

    pub fn transform_names(&self) -> impl Iterator<Item = &str> {
        self.transforms.keys().map(String::as_str)
    }

    pub fn reduction_names(&self) -> impl Iterator<Item = &str> {
        self.reductions.keys().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, function_name: &str) -> bool {
        self.transforms.contains_key(function_name) || self.reductions.contains_key(function_name)
    }

    /// Construct the plugin named by `spec`. Transforms are looked up first.
    pub fn build(
        &self,
        metadata: &ReferenceMetadata,
        spec: &DerivedVariableSpec,
    ) -> Result<Derivation, MergeError> {
        if let Some(builder) = self.transforms.get(&spec.function_name) {
            return builder(metadata, spec).map(Derivation::Transform);
        }
        if let Some(builder) = self.reductions.get(&spec.function_name) {
            return builder(metadata, spec).map(Derivation::Reduction);
        }
        Err(MergeError::UnknownFunction {
            entity_id: spec.entity_id.clone(),
            variable_id: spec.variable_id.clone(),
            function_name: spec.function_name.clone(),
        })
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .field("reductions", &self.reductions.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// All derived variables of a request, in dependency order.
#[derive(Debug, Default)]
pub struct DerivedVariableFactory {
    ordered: Vec<Arc<DerivedVariable>>,
    index: BTreeMap<VariableSpec, usize>,
}

impl DerivedVariableFactory {
    /// Build, de-duplicate and order the derived variables of a request.
    pub fn build(
        registry: &PluginRegistry,
        metadata: &ReferenceMetadata,
        specs: &[DerivedVariableSpec],
    ) -> Result<Self, MergeError> {
        let instances = Self::instantiate(registry, metadata, specs)?;
        let order = Self::dependency_order(&instances)?;

        let mut slots: Vec<Option<DerivedVariable>> = instances.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(order.len());
        let mut index = BTreeMap::new();
        for position in order {
            if let Some(dv) = slots.get_mut(position).and_then(Option::take) {
                index.insert(dv.key().clone(), ordered.len());
                ordered.push(Arc::new(dv));
            }
        }

        tracing::debug!(
            order = ?ordered.iter().map(|dv| dv.column_name()).collect::<Vec<_>>(),
            "derived variables ordered"
        );
        Ok(Self { ordered, index })
    }

    fn instantiate(
        registry: &PluginRegistry,
        metadata: &ReferenceMetadata,
        specs: &[DerivedVariableSpec],
    ) -> Result<Vec<DerivedVariable>, MergeError> {
        let mut requested = BTreeSet::new();
        for spec in specs {
            if !requested.insert(spec.key()) {
                return Err(MergeError::DuplicateDerivedVariable {
                    entity_id: spec.entity_id.clone(),
                    variable_id: spec.variable_id.clone(),
                });
            }
        }

        let mut worklist: VecDeque<(DerivedVariableSpec, bool)> =
            specs.iter().cloned().map(|spec| (spec, false)).collect();
        let mut instances: Vec<DerivedVariable> = Vec::new();
        let mut seen: BTreeMap<VariableSpec, usize> = BTreeMap::new();

        while let Some((spec, generated)) = worklist.pop_front() {
            let key = spec.key();
            if let Some(&existing) = seen.get(&key) {
                if generated && instances[existing].spec() == &spec {
                    tracing::debug!(variable = %key, "skipping repeated declaration");
                    continue;
                }
                return Err(MergeError::DuplicateDerivedVariable {
                    entity_id: key.entity_id,
                    variable_id: key.variable_id,
                });
            }

            let derivation = registry.build(metadata, &spec)?;
            let dv = DerivedVariable::new(spec, derivation);
            worklist.extend(
                dv.depended_derived_var_specs()
                    .into_iter()
                    .map(|dep| (dep, true)),
            );
            seen.insert(key, instances.len());
            instances.push(dv);
        }
        Ok(instances)
    }

    /// Kahn's algorithm over instance positions.
    fn dependency_order(instances: &[DerivedVariable]) -> Result<Vec<usize>, MergeError> {
        let positions: BTreeMap<&VariableSpec, usize> = instances
            .iter()
            .enumerate()
            .map(|(i, dv)| (dv.key(), i))
            .collect();

        let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); instances.len()];
        let mut in_degree: Vec<usize> = vec![0; instances.len()];
        for (consumer, dv) in instances.iter().enumerate() {
            let producers: BTreeSet<usize> = dv
                .depended_derived_var_specs()
                .iter()
                .map(DerivedVariableSpec::key)
                .chain(dv.required_input_vars())
                .filter_map(|key| positions.get(&key).copied())
                .collect();
            for producer in producers {
                if dependents[producer].insert(consumer) {
                    in_degree[consumer] += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..instances.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(instances.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &consumer in &dependents[next] {
                in_degree[consumer] -= 1;
                if in_degree[consumer] == 0 {
                    ready.insert(consumer);
                }
            }
        }

        if order.len() < instances.len() {
            let keys = (0..instances.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| instances[i].column_name().to_string())
                .collect();
            return Err(MergeError::CyclicDependency { keys });
        }
        Ok(order)
    }

    /// Every derived variable, producers before consumers.
    #[must_use]
    pub fn ordered(&self) -> &[Arc<DerivedVariable>] {
        &self.ordered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &VariableSpec) -> Option<&Arc<DerivedVariable>> {
        self.index.get(key).and_then(|&i| self.ordered.get(i))
    }

    /// The transform with this key, if any.
    #[must_use]
    pub fn transform(&self, key: &VariableSpec) -> Option<&Arc<DerivedVariable>> {
        self.get(key).filter(|dv| dv.as_transform().is_some())
    }

    /// The reduction with this key, if any.
    #[must_use]
    pub fn reduction(&self, key: &VariableSpec) -> Option<&Arc<DerivedVariable>> {
        self.get(key).filter(|dv| dv.as_reduction().is_some())
    }

    /// Transforms declared on `entity_id`, in dependency order.
    pub fn transforms_for<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<DerivedVariable>> + 'a {
        self.ordered
            .iter()
            .filter(move |dv| dv.entity_id() == entity_id && dv.as_transform().is_some())
    }

    /// Reductions declared on `entity_id`, in dependency order.
    pub fn reductions_for<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<DerivedVariable>> + 'a {
        self.ordered
            .iter()
            .filter(move |dv| dv.entity_id() == entity_id && dv.as_reduction().is_some())
    }
}

// =============================================================================
// TESTS
// =============================================================================
