//! # Merge Request Processor
//!
//! Top-level orchestration of one merge, in execution order:
//!
//! 1. plan the entity node tree from validated request resources
//! 2. report the streams the tree needs, with their effective filters
//! 3. fetch the streams (callers may do this concurrently)
//! 4. hand the streams to the tree and require every one to be claimed
//! 5. write the dot-notation header and one line per target row
//!
//! When exactly one stream is needed and nothing is derived, inherited or
//! computed, the stream is copied through with only its header rewritten.

use crate::config::MergeConfig;
use crate::primitives::{FIELD_DELIMITER, RECORD_TERMINATOR};
use crate::request::{ComputeProvider, RequestResources};
use crate::stream::{DataStream, RootEntityNode, StreamSpec};
use crate::types::{Filter, MergeError};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};

/// Source of raw entity streams.
///
/// # Precondition
///
/// The returned stream starts with a header line of raw variable ids in
/// `tabular_columns` order, and its rows are grouped contiguously by their
/// ancestor ids, with groups in the same relative order as the ancestor
/// entity's own stream. Streams for the same entity with different filters
/// must share one row order.
pub trait TabularStreamProvider {
    fn tabular_stream(
        &self,
        study_id: &str,
        spec: &StreamSpec,
        filters: &[Filter],
    ) -> Result<DataStream, MergeError>;
}

/// Plans merges for one validated request.
#[derive(Debug)]
pub struct MergeRequestProcessor {
    resources: RequestResources,
    config: MergeConfig,
}

impl MergeRequestProcessor {
    #[must_use]
    pub fn new(resources: RequestResources, config: MergeConfig) -> Self {
        Self { resources, config }
    }

    /// Build the node tree and collect the streams it needs.
    pub fn create_merged_response_supplier(self) -> Result<MergedResponseSupplier, MergeError> {
        let root = RootEntityNode::new(
            self.resources.metadata(),
            self.resources.factory(),
            &self.config,
            self.resources.target_entity_id(),
            self.resources.output_variables(),
            self.resources.computed_columns(),
        )?;
        tracing::info!("created entity node tree:\n{}", root.node());

        let mut required: Vec<StreamSpec> = Vec::new();
        for spec in root.required_stream_specs() {
            if !required.iter().any(|s| s.name == spec.name) {
                required.push(spec);
            }
        }
        for spec in &required {
            tracing::info!(
                stream = %spec.name,
                entity = %spec.entity_id,
                variables = spec.variables.len(),
                filtered = spec.filters_override.is_some(),
                "stream required"
            );
        }

        Ok(MergedResponseSupplier {
            resources: self.resources,
            config: self.config,
            root,
            required,
        })
    }
}

/// How a response was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    pub pass_through: bool,
    /// Data lines written, header excluded.
    pub rows: u64,
}

/// A planned merge, waiting for its streams.
#[derive(Debug)]
pub struct MergedResponseSupplier {
    resources: RequestResources,
    config: MergeConfig,
    root: RootEntityNode,
    required: Vec<StreamSpec>,
}

impl MergedResponseSupplier {
    #[must_use]
    pub fn resources(&self) -> &RequestResources {
        &self.resources
    }

    #[must_use]
    pub fn root(&self) -> &RootEntityNode {
        &self.root
    }

    /// Entity streams to fetch from the tabular provider.
    #[must_use]
    pub fn required_streams(&self) -> &[StreamSpec] {
        &self.required
    }

    /// The computed variable stream to fetch from the compute provider.
    #[must_use]
    pub fn compute_stream(&self) -> Option<StreamSpec> {
        self.root.compute_stream_spec()
    }

    /// Request subset filters, narrowed by the stream's override if any.
    #[must_use]
    pub fn effective_filters(&self, spec: &StreamSpec) -> Vec<Filter> {
        let mut filters = self.resources.subset_filters().to_vec();
        if let Some(overrides) = &spec.filters_override {
            filters.extend(overrides.iter().cloned());
        }
        filters
    }

    #[must_use]
    pub fn output_columns(&self) -> &[String] {
        self.root.output_columns()
    }

    /// True when the response will be a header-rewritten copy of one stream.
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        self.config.pass_through
            && self.required.len() == 1
            && self.root.requires_no_data_manipulation()
    }

    /// Fetch every needed stream, one after another.
    pub fn fetch_streams(
        &self,
        tabular: &dyn TabularStreamProvider,
        compute: Option<&dyn ComputeProvider>,
    ) -> Result<BTreeMap<String, DataStream>, MergeError> {
        let study_id = self.resources.study_id();
        let mut streams = BTreeMap::new();
        for spec in &self.required {
            let filters = self.effective_filters(spec);
            streams.insert(
                spec.name.clone(),
                tabular.tabular_stream(study_id, spec, &filters)?,
            );
        }
        if let (Some(spec), Some(compute_spec)) =
            (self.compute_stream(), self.resources.compute_spec())
        {
            let provider = compute.ok_or_else(|| {
                MergeError::InvalidRequest(format!(
                    "Compute '{}' was requested but no compute provider is configured",
                    compute_spec.compute_name
                ))
            })?;
            streams.insert(spec.name, provider.computed_stream(study_id, compute_spec)?);
        }
        Ok(streams)
    }

    /// Distribute `streams` and write the merged response to `out`.
    pub fn write<W: Write>(
        mut self,
        mut streams: BTreeMap<String, DataStream>,
        out: W,
    ) -> Result<MergeSummary, MergeError> {
        tracing::info!(streams = streams.len(), "all requested streams ready for consumption");
        if self.is_pass_through() {
            return self.write_pass_through(streams, out);
        }

        self.root.accept_data_streams(&mut streams)?;
        reject_unclaimed(&streams)?;

        let mut writer = WriterBuilder::new()
            .delimiter(FIELD_DELIMITER)
            .quote_style(QuoteStyle::Never)
            .terminator(Terminator::Any(RECORD_TERMINATOR))
            .from_writer(out);
        tracing::info!(header = %self.root.output_columns().join("\t"), "writing header row");
        writer.write_record(self.root.output_columns())?;

        let mut rows = 0u64;
        for line in &mut self.root {
            writer.write_record(&line?)?;
            rows += 1;
        }
        writer.flush()?;
        tracing::info!(rows, "merged response written");
        Ok(MergeSummary {
            pass_through: false,
            rows,
        })
    }

    fn write_pass_through<W: Write>(
        self,
        mut streams: BTreeMap<String, DataStream>,
        mut out: W,
    ) -> Result<MergeSummary, MergeError> {
        let node = self.root.node();
        let source = streams.remove(node.stream_name()).ok_or_else(|| {
            MergeError::StreamNotDistributed {
                stream: node.stream_name().to_string(),
                entity_id: node.entity_id().to_string(),
            }
        })?;
        reject_unclaimed(&streams)?;

        let mut reader = BufReader::new(source);
        let mut line = Vec::new();
        if reader.read_until(RECORD_TERMINATOR, &mut line)? == 0 {
            return Err(MergeError::EmptyStream(node.stream_name().to_string()));
        }
        let header = String::from_utf8_lossy(&line);
        let found: Vec<&str> = header
            .trim_end_matches(['\n', '\r'])
            .split(char::from(FIELD_DELIMITER))
            .collect();
        if found.iter().ne(node.expected_header().iter()) {
            return Err(MergeError::HeaderMismatch {
                stream: node.stream_name().to_string(),
                expected: node.expected_header().to_vec(),
                found: found.iter().map(|s| (*s).to_string()).collect(),
            });
        }

        tracing::info!(
            stream = %node.stream_name(),
            "transferring single stream to output; header rewritten only"
        );
        out.write_all(self.root.output_columns().join("\t").as_bytes())?;
        out.write_all(&[RECORD_TERMINATOR])?;

        let mut rows = 0u64;
        loop {
            line.clear();
            if reader.read_until(RECORD_TERMINATOR, &mut line)? == 0 {
                break;
            }
            // Blank lines carry no record; the row merge skips them too.
            if line.iter().all(|b| *b == RECORD_TERMINATOR || *b == b'\r') {
                continue;
            }
            out.write_all(&line)?;
            if line.last() != Some(&RECORD_TERMINATOR) {
                out.write_all(&[RECORD_TERMINATOR])?;
            }
            rows += 1;
        }
        out.flush()?;
        Ok(MergeSummary {
            pass_through: true,
            rows,
        })
    }

    /// Serializable description of this merge.
    #[must_use]
    pub fn plan(&self) -> MergePlan {
        let mut streams: Vec<PlannedStream> = self
            .required
            .iter()
            .map(|spec| PlannedStream {
                filters: self.effective_filters(spec),
                spec: spec.clone(),
            })
            .collect();
        if let Some(spec) = self.compute_stream() {
            streams.push(PlannedStream {
                spec,
                filters: Vec::new(),
            });
        }
        MergePlan {
            study_id: self.resources.study_id().to_string(),
            entity_id: self.resources.target_entity_id().to_string(),
            derived_variables: self
                .resources
                .factory()
                .ordered()
                .iter()
                .map(|dv| PlannedDerivedVariable {
                    column: dv.column_name().to_string(),
                    function_name: dv.function_name().to_string(),
                    kind: dv.derivation().kind_name(),
                })
                .collect(),
            streams,
            output_columns: self.output_columns().to_vec(),
            pass_through: self.is_pass_through(),
            tree: self.root.node().to_string(),
        }
    }
}

fn reject_unclaimed(streams: &BTreeMap<String, DataStream>) -> Result<(), MergeError> {
    if streams.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = streams.keys().cloned().collect();
    tracing::warn!(streams = ?names, "delivered streams were not claimed by the node tree");
    Err(MergeError::UnclaimedStreams(names))
}

// =============================================================================
// PLAN
// =============================================================================

/// What a merge will read and write, without reading anything.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePlan {
    pub study_id: String,
    pub entity_id: String,
    /// Producers before consumers.
    pub derived_variables: Vec<PlannedDerivedVariable>,
    pub streams: Vec<PlannedStream>,
    pub output_columns: Vec<String>,
    pub pass_through: bool,
    /// Human-readable node tree.
    pub tree: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedDerivedVariable {
    pub column: String,
    pub function_name: String,
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStream {
    #[serde(flatten)]
    pub spec: StreamSpec,
    pub filters: Vec<Filter>,
}

// =============================================================================
// TESTS
// =============================================================================
