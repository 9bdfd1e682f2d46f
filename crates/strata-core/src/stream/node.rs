//! # Entity Node Tree
//!
//! One node per stream. A node finishes each of its rows before yielding
//! it, in this order:
//!
//! 1. **Inheritance**: every ancestor node is advanced to the row whose id
//!    matches this row's ancestor id column, and that row's values are
//!    copied in. The ancestor row stays cached in the ancestor stream's
//!    lookahead until a descendant row with a different id arrives.
//! 2. **Reductions**: for each reduction, a fresh reducer drains the
//!    contiguous run of child rows carrying this row's id. Child nodes
//!    finish their own rows (nested reductions included) as they are read.
//! 3. **Transforms**: applied in dependency order, after inherited and
//!    reduced values are present.
//!
//! Nodes never buffer more than their stream's lookahead row.

use super::entity_stream::EntityStream;
use super::{DataStream, RowHook, StreamSpec};
use crate::config::MergeConfig;
use crate::derived::{DerivedVariable, DerivedVariableFactory, Reduction, Transform, column};
use crate::metadata::{ReferenceMetadata, VariableSource};
use crate::types::{Filter, MergeError, Row, VariableSpec};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// NODE
// =============================================================================

/// A stream of one entity plus the work that completes its rows.
#[derive(Debug)]
pub struct EntityNode {
    entity_id: String,
    stream: EntityStream,
    derivations: NodeDerivations,
}

#[derive(Debug)]
struct ReductionLink {
    variable: Arc<DerivedVariable>,
    node: EntityNode,
}

/// Row hook of a node: everything spliced into a raw row.
#[derive(Debug)]
struct NodeDerivations {
    entity_id: String,
    id_column: String,
    ancestors: Vec<EntityNode>,
    reductions: Vec<ReductionLink>,
    transforms: Vec<Arc<DerivedVariable>>,
}

impl EntityNode {
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        self.stream.name()
    }

    /// Dot-notation name of this entity's id column.
    #[must_use]
    pub fn id_column(&self) -> &str {
        &self.derivations.id_column
    }

    /// Columns of the raw stream, before derived values are added.
    #[must_use]
    pub fn stream_columns(&self) -> &[String] {
        self.stream.columns()
    }

    /// Header line the upstream stream must carry.
    #[must_use]
    pub fn expected_header(&self) -> &[String] {
        self.stream.expected_header()
    }

    /// Stream specs of this node and every node below it, in pre-order.
    #[must_use]
    pub fn stream_specs(&self) -> Vec<StreamSpec> {
        let mut specs = Vec::new();
        self.collect_stream_specs(&mut specs);
        specs
    }

    fn collect_stream_specs(&self, specs: &mut Vec<StreamSpec>) {
        if let Some(spec) = self.stream.spec() {
            specs.push(spec.clone());
        }
        for ancestor in &self.derivations.ancestors {
            ancestor.collect_stream_specs(specs);
        }
        for link in &self.derivations.reductions {
            link.node.collect_stream_specs(specs);
        }
    }

    /// True when rows leave this node exactly as the stream delivers them.
    #[must_use]
    pub fn requires_no_data_manipulation(&self) -> bool {
        self.derivations.ancestors.is_empty()
            && self.derivations.reductions.is_empty()
            && self.derivations.transforms.is_empty()
    }

    /// Claim streams for every node below this one, then for this node.
    ///
    /// Children are primed first: reading this node's first row already
    /// pulls from them.
    pub fn accept_data_streams(
        &mut self,
        streams: &mut BTreeMap<String, DataStream>,
    ) -> Result<(), MergeError> {
        for ancestor in &mut self.derivations.ancestors {
            ancestor.accept_data_streams(streams)?;
        }
        for link in &mut self.derivations.reductions {
            link.node.accept_data_streams(streams)?;
        }
        self.stream
            .accept_data_streams(streams, &mut self.derivations)
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.stream.has_next()
    }

    /// Next completed row.
    pub fn next_row(&mut self) -> Result<Option<Row>, MergeError> {
        self.stream.next_row(&mut self.derivations)
    }

    pub fn peek_if(&self, predicate: impl FnOnce(&Row) -> bool) -> Option<&Row> {
        self.stream.peek_if(predicate)
    }

    pub fn consume_if(
        &mut self,
        predicate: impl FnOnce(&Row) -> bool,
    ) -> Result<Option<Row>, MergeError> {
        self.stream.consume_if(predicate, &mut self.derivations)
    }

    /// Copy this ancestor's matching row into a descendant row.
    fn inherit_into(&mut self, descendant_entity: &str, row: &mut Row) -> Result<(), MergeError> {
        let id_column = self.derivations.id_column.clone();
        let id = column(row, &id_column)?.to_string();
        if !seek(&mut self.stream, &mut self.derivations, &id_column, &id)? {
            return Err(MergeError::AncestorRowMissing {
                entity_id: descendant_entity.to_string(),
                ancestor_id: self.entity_id.clone(),
                column: id_column,
                id,
            });
        }
        if let Some(ancestor_row) = self.stream.peek_if(|_| true) {
            row.extend(
                ancestor_row
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
        }
        Ok(())
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>, depth: usize, role: &str) -> fmt::Result {
        let indent = depth * 2;
        writeln!(
            f,
            "{:indent$}{}{} [{}]: {}",
            "",
            role,
            self.entity_id,
            self.stream_name(),
            self.stream.columns().join(", "),
        )?;
        for ancestor in &self.derivations.ancestors {
            ancestor.describe(f, depth + 1, "inherit ")?;
        }
        for link in &self.derivations.reductions {
            writeln!(
                f,
                "{:indent$}  reduce {} ({})",
                "",
                link.variable.column_name(),
                link.variable.function_name(),
            )?;
            link.node.describe(f, depth + 2, "")?;
        }
        for transform in &self.derivations.transforms {
            writeln!(
                f,
                "{:indent$}  transform {} ({})",
                "",
                transform.column_name(),
                transform.function_name(),
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for EntityNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(f, 0, "")
    }
}

/// Advance `stream` until its lookahead row has `column == id`.
///
/// Returns false when the stream runs out first.
pub(crate) fn seek<H: RowHook + ?Sized>(
    stream: &mut EntityStream,
    hook: &mut H,
    column: &str,
    id: &str,
) -> Result<bool, MergeError> {
    let matches = |row: &Row| row.get(column).is_some_and(|value| value == id);
    while stream.peek_if(matches).is_none() {
        if stream.next_row(hook)?.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

// =============================================================================
// ROW COMPLETION
// =============================================================================

impl ReductionLink {
    fn reduce(&mut self, id_column: &str, id: &str) -> Result<String, MergeError> {
        let reduction = reduction_of(&self.variable)?;
        let mut reducer = reduction.create_reducer();
        let belongs = |row: &Row| row.get(id_column).is_some_and(|value| value == id);
        while let Some(child) = self.node.consume_if(belongs)? {
            reducer.add_row(&child)?;
        }
        Ok(reducer.resulting_value())
    }
}

impl RowHook for NodeDerivations {
    fn apply_derived_vars(&mut self, row: &mut Row) -> Result<(), MergeError> {
        for ancestor in &mut self.ancestors {
            ancestor.inherit_into(&self.entity_id, row)?;
        }

        if !self.reductions.is_empty() {
            let id = column(row, &self.id_column)?.to_string();
            for link in &mut self.reductions {
                let value = link.reduce(&self.id_column, &id)?;
                row.insert(link.variable.column_name().to_string(), value);
            }
        }

        for variable in &self.transforms {
            let value = transform_of(variable)?.value(row)?;
            row.insert(variable.column_name().to_string(), value);
        }
        Ok(())
    }
}

fn transform_of(variable: &DerivedVariable) -> Result<&dyn Transform, MergeError> {
    variable.as_transform().ok_or_else(|| {
        MergeError::InvalidRequest(format!("Derived variable {} is not a transform", variable.key()))
    })
}

fn reduction_of(variable: &DerivedVariable) -> Result<&dyn Reduction, MergeError> {
    variable.as_reduction().ok_or_else(|| {
        MergeError::InvalidRequest(format!("Derived variable {} is not a reduction", variable.key()))
    })
}

// =============================================================================
// TREE CONSTRUCTION
// =============================================================================

/// Builds the node tree for one request, naming streams in pre-order.
pub(crate) struct TreeBuilder<'a> {
    metadata: &'a ReferenceMetadata,
    factory: &'a DerivedVariableFactory,
    config: &'a MergeConfig,
    streams: usize,
}

impl<'a> TreeBuilder<'a> {
    pub(crate) fn new(
        metadata: &'a ReferenceMetadata,
        factory: &'a DerivedVariableFactory,
        config: &'a MergeConfig,
    ) -> Self {
        Self {
            metadata,
            factory,
            config,
            streams: 0,
        }
    }

    /// Node for `entity_id` producing `variables` on each of its rows.
    pub(crate) fn build(
        &mut self,
        entity_id: &str,
        variables: &[VariableSpec],
        filters_override: Option<Vec<Filter>>,
        depth: usize,
    ) -> Result<EntityNode, MergeError> {
        if depth > self.config.max_entity_depth {
            return Err(MergeError::InvalidRequest(format!(
                "Entity node tree exceeds {} levels at entity '{}'",
                self.config.max_entity_depth, entity_id
            )));
        }
        let metadata = self.metadata;
        let entity = metadata.entity(entity_id)?;
        let ancestors = metadata.ancestors(entity_id)?;

        let mut pending: VecDeque<VariableSpec> = variables.iter().cloned().collect();
        let mut handled: BTreeSet<VariableSpec> = BTreeSet::new();
        let mut stream_variables = Vec::new();
        let mut ancestor_variables: BTreeMap<String, Vec<VariableSpec>> = BTreeMap::new();
        let mut reductions = Vec::new();

        while let Some(variable) = pending.pop_front() {
            if !handled.insert(variable.clone()) {
                continue;
            }
            let def = metadata.variable(&variable)?;
            if variable.entity_id == entity_id {
                match def.source {
                    VariableSource::Id => {}
                    VariableSource::Native => stream_variables.push(variable),
                    VariableSource::DerivedTransform => {
                        pending.extend(self.derived(&variable)?.required_input_vars());
                    }
                    VariableSource::DerivedReduction => {
                        reductions.push(Arc::clone(self.derived(&variable)?));
                    }
                    VariableSource::Computed => {
                        return Err(MergeError::InvalidRequest(format!(
                            "Computed variable {} can only be read on merged target rows",
                            variable
                        )));
                    }
                }
            } else if metadata.is_entity_ancestor_of(&variable.entity_id, entity_id) {
                if def.source != VariableSource::Id {
                    ancestor_variables
                        .entry(variable.entity_id.clone())
                        .or_default()
                        .push(variable);
                }
            } else {
                return Err(MergeError::InvalidRequest(format!(
                    "Variable {} cannot be returned on a stream of entity '{}'",
                    variable, entity_id
                )));
            }
        }

        self.streams += 1;
        let name = format!("{}#{}", entity_id, self.streams);
        let columns = metadata.tabular_columns(entity_id, &stream_variables)?;
        let mut stream = EntityStream::new();
        stream.bind(
            StreamSpec::new(name.as_str(), entity_id)
                .with_variables(stream_variables)
                .with_filters_override(filters_override.clone()),
            &columns,
        )?;
        if let Some(parent) = ancestors
            .first()
            .filter(|_| self.config.validate_sort_order)
        {
            stream.validate_grouping(parent.id_column());
        }

        let mut ancestor_nodes = Vec::new();
        for ancestor in &ancestors {
            if let Some(vars) = ancestor_variables.remove(&ancestor.id) {
                ancestor_nodes.push(self.build(
                    &ancestor.id,
                    &vars,
                    filters_override.clone(),
                    depth + 1,
                )?);
            }
        }

        let mut reduction_links = Vec::with_capacity(reductions.len());
        for variable in reductions {
            let input = variable.reduction_input(metadata)?;
            let child_filters = input
                .filters_override
                .clone()
                .or_else(|| filters_override.clone());
            let node = self.build(
                &input.operating_entity,
                &input.stream_variables,
                child_filters,
                depth + 1,
            )?;
            reduction_links.push(ReductionLink { variable, node });
        }

        let transforms: Vec<Arc<DerivedVariable>> = self
            .factory
            .transforms_for(entity_id)
            .filter(|dv| handled.contains(dv.key()))
            .cloned()
            .collect();

        tracing::info!(
            entity = %entity_id,
            stream = %name,
            depth,
            inherited = ancestor_nodes.len(),
            reductions = reduction_links.len(),
            transforms = transforms.len(),
            "entity node built"
        );

        Ok(EntityNode {
            entity_id: entity_id.to_string(),
            stream,
            derivations: NodeDerivations {
                entity_id: entity_id.to_string(),
                id_column: entity.id_column(),
                ancestors: ancestor_nodes,
                reductions: reduction_links,
                transforms,
            },
        })
    }

    fn derived(&self, key: &VariableSpec) -> Result<&'a Arc<DerivedVariable>, MergeError> {
        self.factory.get(key).ok_or_else(|| {
            MergeError::InvalidRequest(format!("Derived variable {} was never resolved", key))
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
