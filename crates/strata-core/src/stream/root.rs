//! # Root Node
//!
//! The target entity's node. Yields one output line per target row, in the
//! target stream's order, projected onto the output columns: the target's
//! id columns, the requested variables, then computed variables.
//!
//! When a compute job is referenced, the root also owns the computed
//! variable stream. On the target entity it advances in lockstep with the
//! target stream; on an ancestor entity its rows are inherited.

use super::entity_stream::EntityStream;
use super::node::{EntityNode, TreeBuilder, seek};
use super::{DataStream, NoDerivedVars, StreamSpec};
use crate::config::MergeConfig;
use crate::derived::{DerivedVariableFactory, column};
use crate::metadata::ReferenceMetadata;
use crate::primitives::COMPUTED_VAR_STREAM_NAME;
use crate::types::{MergeError, Row, VariableSpec};
use std::collections::{BTreeMap, BTreeSet};

/// Computed variables to splice into target rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedColumns {
    pub entity_id: String,
    pub variables: Vec<VariableSpec>,
}

#[derive(Debug)]
struct ComputeLink {
    target_entity: String,
    entity_id: String,
    id_column: String,
    inherited: bool,
    stream: EntityStream,
}

impl ComputeLink {
    fn splice(&mut self, row: &mut Row) -> Result<(), MergeError> {
        let id = column(row, &self.id_column)?.to_string();
        if self.inherited {
            if !seek(&mut self.stream, &mut NoDerivedVars, &self.id_column, &id)? {
                return Err(MergeError::AncestorRowMissing {
                    entity_id: self.target_entity.clone(),
                    ancestor_id: self.entity_id.clone(),
                    column: self.id_column.clone(),
                    id,
                });
            }
            if let Some(computed) = self.stream.peek_if(|_| true) {
                row.extend(computed.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            return Ok(());
        }

        match self.stream.next_row(&mut NoDerivedVars)? {
            Some(computed) if computed.get(&self.id_column) == Some(&id) => {
                row.extend(computed);
                Ok(())
            }
            Some(computed) => Err(MergeError::ComputeRowMismatch {
                expected: id,
                found: computed
                    .get(&self.id_column)
                    .cloned()
                    .unwrap_or_default(),
            }),
            None => Err(MergeError::ComputeRowMismatch {
                expected: id,
                found: "<end of stream>".to_string(),
            }),
        }
    }

    /// Lockstep compute rows left over after the target stream ended.
    fn check_drained(&self) -> Result<(), MergeError> {
        if self.inherited {
            return Ok(());
        }
        match self.stream.peek_if(|_| true) {
            Some(extra) => Err(MergeError::ComputeRowMismatch {
                expected: "<end of stream>".to_string(),
                found: extra.get(&self.id_column).cloned().unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }
}

/// Root of the node tree; iterates merged output lines.
#[derive(Debug)]
pub struct RootEntityNode {
    node: EntityNode,
    output_columns: Vec<String>,
    compute: Option<ComputeLink>,
    done: bool,
}

impl RootEntityNode {
    /// Plan the node tree for `output_variables` on `entity_id`.
    pub fn new(
        metadata: &ReferenceMetadata,
        factory: &DerivedVariableFactory,
        config: &MergeConfig,
        entity_id: &str,
        output_variables: &[VariableSpec],
        computed: Option<&ComputedColumns>,
    ) -> Result<Self, MergeError> {
        let node = TreeBuilder::new(metadata, factory, config).build(
            entity_id,
            output_variables,
            None,
            0,
        )?;

        let mut output_columns: Vec<String> = metadata
            .tabular_columns(entity_id, output_variables)?
            .iter()
            .map(VariableSpec::dot_notation)
            .collect();

        let compute = match computed {
            Some(computed) => {
                if computed.entity_id != entity_id
                    && !metadata.is_entity_ancestor_of(&computed.entity_id, entity_id)
                {
                    return Err(MergeError::InvalidRequest(format!(
                        "Computed entity '{}' is neither the target entity '{}' nor one of its ancestors",
                        computed.entity_id, entity_id
                    )));
                }
                let columns = metadata.tabular_columns(&computed.entity_id, &computed.variables)?;
                let mut stream = EntityStream::new();
                stream.bind(
                    StreamSpec::new(COMPUTED_VAR_STREAM_NAME, computed.entity_id.as_str())
                        .with_variables(computed.variables.clone()),
                    &columns,
                )?;
                output_columns.extend(computed.variables.iter().map(VariableSpec::dot_notation));
                Some(ComputeLink {
                    target_entity: entity_id.to_string(),
                    entity_id: computed.entity_id.clone(),
                    id_column: metadata.entity(&computed.entity_id)?.id_column(),
                    inherited: computed.entity_id != entity_id,
                    stream,
                })
            }
            None => None,
        };

        let mut seen = BTreeSet::new();
        for column in &output_columns {
            if !seen.insert(column.as_str()) {
                return Err(MergeError::DuplicateOutputColumn(column.clone()));
            }
        }

        tracing::info!(
            entity = %entity_id,
            columns = output_columns.len(),
            streams = node.stream_specs().len(),
            computed = compute.is_some(),
            "merge plan ready"
        );

        Ok(Self {
            node,
            output_columns,
            compute,
            done: false,
        })
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        self.node.entity_id()
    }

    /// The tree below the root, for inspection.
    #[must_use]
    pub fn node(&self) -> &EntityNode {
        &self.node
    }

    /// Dot-notation header of the merged output.
    #[must_use]
    pub fn output_columns(&self) -> &[String] {
        &self.output_columns
    }

    /// Entity streams the tree needs, in pre-order; names are unique.
    #[must_use]
    pub fn required_stream_specs(&self) -> Vec<StreamSpec> {
        self.node.stream_specs()
    }

    /// The computed variable stream, when a compute job is referenced.
    #[must_use]
    pub fn compute_stream_spec(&self) -> Option<StreamSpec> {
        self.compute
            .as_ref()
            .and_then(|c| c.stream.spec().cloned())
    }

    /// True when the single target stream can be copied through unchanged.
    #[must_use]
    pub fn requires_no_data_manipulation(&self) -> bool {
        self.compute.is_none() && self.node.requires_no_data_manipulation()
    }

    /// Hand every fetched stream to the tree. Streams left in `streams`
    /// afterwards were not claimed.
    pub fn accept_data_streams(
        &mut self,
        streams: &mut BTreeMap<String, DataStream>,
    ) -> Result<(), MergeError> {
        if let Some(compute) = self.compute.as_mut() {
            compute
                .stream
                .accept_data_streams(streams, &mut NoDerivedVars)?;
        }
        self.node.accept_data_streams(streams)
    }

    fn next_line(&mut self) -> Result<Option<Vec<String>>, MergeError> {
        let Some(mut row) = self.node.next_row()? else {
            if let Some(compute) = &self.compute {
                compute.check_drained()?;
            }
            return Ok(None);
        };
        if let Some(compute) = self.compute.as_mut() {
            compute.splice(&mut row)?;
        }
        self.output_columns
            .iter()
            .map(|name| column(&row, name).map(str::to_string))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

impl Iterator for RootEntityNode {
    type Item = Result<Vec<String>, MergeError>;

    /// Stops after the first error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_line() {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{VariableDef, VariableSource};
    use crate::test_support::{data, resolve, spec};

    fn computed(entity: &str) -> ComputedColumns {
        ComputedColumns {
            entity_id: entity.to_string(),
            variables: vec![VariableSpec::new(entity, "score")],
        }
    }

    fn with_score(entity: &str) -> ReferenceMetadata {
        let (mut md, _) = resolve(&[]);
        let mut def = VariableDef::id_column(entity, "score");
        def.source = VariableSource::Computed;
        md.incorporate_computed_variables(entity, vec![def])
            .expect("computed");
        md
    }

    #[test]
    fn output_columns_lead_with_ids_then_computed() {
        let md = with_score("participant");
        let (_, factory) = resolve(&[]);
        let root = RootEntityNode::new(
            &md,
            &factory,
            &MergeConfig::default(),
            "participant",
            &[spec("participant", "age")],
            Some(&computed("participant")),
        )
        .expect("root");
        assert_eq!(
            root.output_columns(),
            [
                "participant.participant_id",
                "household.household_id",
                "participant.age",
                "participant.score"
            ]
        );
        assert!(!root.requires_no_data_manipulation());
        assert_eq!(
            root.compute_stream_spec().map(|s| s.name),
            Some(COMPUTED_VAR_STREAM_NAME.to_string())
        );
    }

    #[test]
    fn lockstep_compute_rows_must_match() {
        let md = with_score("participant");
        let (_, factory) = resolve(&[]);
        let mut root = RootEntityNode::new(
            &md,
            &factory,
            &MergeConfig::default(),
            "participant",
            &[],
            Some(&computed("participant")),
        )
        .expect("root");
        let mut streams = BTreeMap::new();
        streams.insert(
            "participant#1".to_string(),
            data("participant_id\thousehold_id\np1\th1\np2\th1\n"),
        );
        streams.insert(
            COMPUTED_VAR_STREAM_NAME.to_string(),
            data("participant_id\thousehold_id\tscore\np1\th1\t0.5\np3\th1\t0.7\n"),
        );
        root.accept_data_streams(&mut streams).expect("accept");
        let first = root.next().expect("line").expect("p1");
        assert_eq!(first, vec!["p1", "h1", "0.5"]);
        let err = root.next().expect("line").expect_err("p2 vs p3");
        assert!(matches!(
            err,
            MergeError::ComputeRowMismatch { ref expected, ref found } if expected == "p2" && found == "p3"
        ));
        assert!(root.next().is_none());
    }

    #[test]
    fn ancestor_compute_rows_are_inherited() {
        let md = with_score("household");
        let (_, factory) = resolve(&[]);
        let mut root = RootEntityNode::new(
            &md,
            &factory,
            &MergeConfig::default(),
            "participant",
            &[],
            Some(&computed("household")),
        )
        .expect("root");
        let mut streams = BTreeMap::new();
        streams.insert(
            "participant#1".to_string(),
            data("participant_id\thousehold_id\np1\th1\np2\th1\np3\th2\n"),
        );
        streams.insert(
            COMPUTED_VAR_STREAM_NAME.to_string(),
            data("household_id\tscore\nh1\t1\nh2\t2\n"),
        );
        root.accept_data_streams(&mut streams).expect("accept");
        let scores: Vec<String> = root
            .map(|line| line.expect("line")[2].clone())
            .collect();
        assert_eq!(scores, vec!["1", "1", "2"]);
    }

    #[test]
    fn compute_entity_must_be_target_or_ancestor() {
        let md = with_score("sample");
        let (_, factory) = resolve(&[]);
        let err = RootEntityNode::new(
            &md,
            &factory,
            &MergeConfig::default(),
            "participant",
            &[],
            Some(&computed("sample")),
        )
        .expect_err("descendant compute entity");
        assert!(matches!(err, MergeError::InvalidRequest(_)));
    }

    #[test]
    fn duplicate_output_columns_rejected() {
        let (md, factory) = resolve(&[]);
        let err = RootEntityNode::new(
            &md,
            &factory,
            &MergeConfig::default(),
            "participant",
            &[spec("participant", "age"), spec("participant", "age")],
            None,
        )
        .expect_err("duplicate");
        assert!(matches!(err, MergeError::DuplicateOutputColumn(ref c) if c == "participant.age"));
    }
}
