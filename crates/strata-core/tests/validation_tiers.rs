//! # Validation Tier Tests (T0-T4)
//!
//! If ANY tier fails, the merge engine is INVALID.
//!
//! ## Tiers
//! - T0: Stream Integrity
//! - T1: Request Validation
//! - T2: Single-Hop Merge
//! - T3: Multi-Hop Merge
//! - T4: Determinism

use serde_json::json;
use std::collections::BTreeMap;
use std::io::Cursor;
use strata_core::{
    ComputeProvider, ComputeSpec, ComputedVariableMetadata, DataStream, DerivedVariableSpec,
    ErrorKind, Filter, MergeConfig, MergeError, MergeRequest, MergeRequestProcessor,
    MergedResponseSupplier, MetadataProvider, PluginRegistry, RequestResources, StreamSpec,
    StudyDetail, TabularStreamProvider, VariableSpec, standard_registry,
};

// =============================================================================
// FIXTURES
// =============================================================================

/// household -> { participant -> sample, dwelling }
struct Studies;

impl MetadataProvider for Studies {
    fn study(&self, study_id: &str) -> Result<Option<StudyDetail>, MergeError> {
        if study_id != "study1" {
            return Ok(None);
        }
        let study = serde_json::from_value(json!({
            "id": "study1",
            "rootEntity": {
                "id": "household",
                "idColumnName": "household_id",
                "variables": [
                    { "id": "region", "type": "string", "dataShape": "categorical" },
                    { "id": "income", "type": "number" }
                ],
                "children": [
                    {
                        "id": "participant",
                        "idColumnName": "participant_id",
                        "variables": [
                            { "id": "age", "type": "integer" },
                            { "id": "sex", "type": "string", "dataShape": "categorical" }
                        ],
                        "children": [{
                            "id": "sample",
                            "idColumnName": "sample_id",
                            "variables": [{ "id": "value", "type": "number" }]
                        }]
                    },
                    {
                        "id": "dwelling",
                        "idColumnName": "dwelling_id",
                        "variables": [{ "id": "rooms", "type": "integer" }]
                    }
                ]
            }
        }))
        .map_err(|e| MergeError::InvalidRequest(e.to_string()))?;
        Ok(Some(study))
    }
}

const HOUSEHOLDS: &str = "household_id\tregion\tincome\n\
                          h1\tnorth\t100\n\
                          h2\tsouth\t200\n";

const PARTICIPANTS: &str = "participant_id\thousehold_id\tage\tsex\n\
                            p1\th1\t30\tF\n\
                            p2\th1\t41\tM\n\
                            p3\th2\t25\tF\n";

const SAMPLES: &str = "sample_id\tparticipant_id\thousehold_id\tvalue\n\
                       s1\tp1\th1\t10\n\
                       s2\tp1\th1\t20\n\
                       s3\tp2\th1\t5\n\
                       s4\tp3\th2\t7.5\n";

/// In-memory entity tables. Projects each requested stream out of the full
/// table and applies string-set filters on the stream's own entity.
struct Tables;

impl Tables {
    fn table(entity_id: &str) -> (&'static [&'static str], &'static str) {
        match entity_id {
            "household" => (&["household_id"], HOUSEHOLDS),
            "participant" => (&["participant_id", "household_id"], PARTICIPANTS),
            _ => (&["sample_id", "participant_id", "household_id"], SAMPLES),
        }
    }
}

impl TabularStreamProvider for Tables {
    fn tabular_stream(
        &self,
        _study_id: &str,
        spec: &StreamSpec,
        filters: &[Filter],
    ) -> Result<DataStream, MergeError> {
        let (ids, text) = Self::table(&spec.entity_id);
        let mut lines = text.lines().map(|l| l.split('\t').collect::<Vec<_>>());
        let header = lines.next().unwrap_or_default();
        let position = |name: &str| header.iter().position(|h| *h == name);

        let wanted: Vec<String> = ids
            .iter()
            .map(|id| (*id).to_string())
            .chain(spec.variables.iter().map(|v| v.variable_id.clone()))
            .collect();
        let mut out = wanted.join("\t") + "\n";
        for fields in lines {
            let keep = filters.iter().all(|filter| match filter {
                Filter::StringSet {
                    entity_id,
                    variable_id,
                    string_set,
                } if *entity_id == spec.entity_id => position(variable_id.as_str())
                    .and_then(|i| fields.get(i))
                    .is_some_and(|v| string_set.iter().any(|s| s == v)),
                _ => true,
            });
            if !keep {
                continue;
            }
            let projected: Vec<&str> = wanted
                .iter()
                .map(|name| {
                    position(name.as_str())
                        .and_then(|i| fields.get(i))
                        .copied()
                        .unwrap_or("")
                })
                .collect();
            out.push_str(&projected.join("\t"));
            out.push('\n');
        }
        Ok(Box::new(Cursor::new(out.into_bytes())))
    }
}

/// Compute job with one `score` column on participant.
struct Scores {
    stream: &'static str,
}

impl ComputeProvider for Scores {
    fn results_available(&self, _: &str, _: &ComputeSpec) -> Result<bool, MergeError> {
        Ok(true)
    }

    fn computed_variables(
        &self,
        _: &str,
        _: &ComputeSpec,
    ) -> Result<ComputedVariableMetadata, MergeError> {
        serde_json::from_value(json!({
            "variables": [{
                "variableSpec": { "entityId": "participant", "variableId": "score" },
                "type": "number"
            }]
        }))
        .map_err(|e| MergeError::InvalidRequest(e.to_string()))
    }

    fn computed_stream(&self, _: &str, _: &ComputeSpec) -> Result<DataStream, MergeError> {
        Ok(Box::new(Cursor::new(self.stream.as_bytes().to_vec())))
    }
}

fn spec(entity: &str, variable: &str) -> VariableSpec {
    VariableSpec::new(entity, variable)
}

fn derived(
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

fn request(
    entity: &str,
    outputs: Vec<VariableSpec>,
    derived_variables: Vec<DerivedVariableSpec>,
) -> MergeRequest {
    MergeRequest {
        study_id: "study1".to_string(),
        entity_id: entity.to_string(),
        output_variables: outputs,
        filters: vec![],
        derived_variables,
        compute_spec: None,
    }
}

fn plan(
    request: MergeRequest,
    compute: Option<&dyn ComputeProvider>,
    config: MergeConfig,
) -> Result<MergedResponseSupplier, MergeError> {
    let resources = RequestResources::new(request, &Studies, compute, &standard_registry())?;
    MergeRequestProcessor::new(resources, config).create_merged_response_supplier()
}

/// Plan, fetch from `Tables`, and write; returns the response text.
fn run(
    request: MergeRequest,
    compute: Option<&dyn ComputeProvider>,
    config: MergeConfig,
) -> Result<String, MergeError> {
    let supplier = plan(request, compute, config)?;
    let streams = supplier.fetch_streams(&Tables, compute)?;
    let mut out = Vec::new();
    supplier.write(streams, &mut out)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn text(body: &str) -> DataStream {
    Box::new(Cursor::new(body.as_bytes().to_vec()))
}

fn row_merge() -> MergeConfig {
    MergeConfig::default().with_pass_through(false)
}

// =============================================================================
// TIER T0: STREAM INTEGRITY
// =============================================================================

mod t0_stream_integrity {
    use super::*;

    fn participant_ages() -> MergedResponseSupplier {
        plan(
            request("participant", vec![spec("participant", "age")], vec![]),
            None,
            row_merge(),
        )
        .expect("plan")
    }

    /// T0.1: A required stream that never arrives is fatal.
    #[test]
    fn missing_stream_rejected() {
        let err = participant_ages()
            .write(BTreeMap::new(), Vec::new())
            .expect_err("missing");
        assert!(matches!(
            err,
            MergeError::StreamNotDistributed { ref stream, .. } if stream == "participant#1"
        ));
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    /// T0.2: The header must list the expected raw ids in order.
    #[test]
    fn header_mismatch_rejected() {
        let mut streams = BTreeMap::new();
        streams.insert(
            "participant#1".to_string(),
            text("household_id\tparticipant_id\tage\nh1\tp1\t30\n"),
        );
        let err = participant_ages()
            .write(streams, Vec::new())
            .expect_err("mismatch");
        assert!(matches!(
            err,
            MergeError::HeaderMismatch { ref expected, ref found, .. }
                if expected == &["participant_id", "household_id", "age"]
                    && found == &["household_id", "participant_id", "age"]
        ));
    }

    /// T0.3: A stream without a header line is fatal.
    #[test]
    fn empty_stream_rejected() {
        let mut streams = BTreeMap::new();
        streams.insert("participant#1".to_string(), text(""));
        let err = participant_ages()
            .write(streams, Vec::new())
            .expect_err("empty");
        assert!(matches!(err, MergeError::EmptyStream(_)));
    }

    /// T0.4: A header-only stream is a valid empty response.
    #[test]
    fn header_only_stream_yields_header_only() {
        let mut streams = BTreeMap::new();
        streams.insert(
            "participant#1".to_string(),
            text("participant_id\thousehold_id\tage\n"),
        );
        let mut out = Vec::new();
        let summary = participant_ages()
            .write(streams, &mut out)
            .expect("write");
        assert_eq!(summary.rows, 0);
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "participant.participant_id\thousehold.household_id\tparticipant.age\n"
        );
    }

    /// T0.5: Rows must be as wide as the header.
    #[test]
    fn short_row_rejected() {
        let mut streams = BTreeMap::new();
        streams.insert(
            "participant#1".to_string(),
            text("participant_id\thousehold_id\tage\np1\th1\t30\np2\th1\n"),
        );
        let supplier = participant_ages();
        let err = supplier.write(streams, Vec::new()).expect_err("short row");
        assert!(matches!(err, MergeError::RowWidth { line: 3, found: 2, .. }));
    }

    /// T0.6: Streams nobody asked for are fatal.
    #[test]
    fn unclaimed_stream_rejected() {
        let mut streams = BTreeMap::new();
        streams.insert(
            "participant#1".to_string(),
            text("participant_id\thousehold_id\tage\n"),
        );
        streams.insert("sample#9".to_string(), text("sample_id\n"));
        let err = participant_ages()
            .write(streams, Vec::new())
            .expect_err("unclaimed");
        assert!(matches!(err, MergeError::UnclaimedStreams(ref names) if names == &["sample#9"]));
    }
}

// =============================================================================
// TIER T1: REQUEST VALIDATION
// =============================================================================

mod t1_request_validation {
    use super::*;
    use strata_core::derived::bind_config;
    use strata_core::{
        DataShape, DerivedVariablePlugin, ReferenceMetadata, Reducer, Reduction, Row,
        VariableType,
    };

    #[derive(serde::Deserialize)]
    struct InputsConfig {
        inputs: Vec<VariableSpec>,
    }

    /// Counts visible rows over arbitrary inputs.
    #[derive(Debug)]
    struct CountRows(Vec<VariableSpec>);

    struct Counter(u64);

    impl Reducer for Counter {
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
            self.0.clone()
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
            Box::new(Counter(0))
        }
    }

    fn count_rows(
        _metadata: &ReferenceMetadata,
        spec: &DerivedVariableSpec,
    ) -> Result<Box<dyn Reduction>, MergeError> {
        let config: InputsConfig = bind_config(spec)?;
        Ok(Box::new(CountRows(config.inputs)))
    }

    fn validate(request: MergeRequest, registry: &PluginRegistry) -> Result<(), MergeError> {
        RequestResources::new(request, &Studies, None, registry).map(|_| ())
    }

    /// T1.1: Derived variables reading each other in a loop are rejected.
    #[test]
    fn cycle_rejected() {
        let a = derived(
            "participant",
            "a",
            "concatenation",
            json!({ "inputVariables": [spec("participant", "b")] }),
        );
        let b = derived(
            "participant",
            "b",
            "concatenation",
            json!({ "inputVariables": [spec("participant", "a")] }),
        );
        let err = validate(request("participant", vec![], vec![a, b]), &standard_registry())
            .expect_err("cycle");
        assert!(matches!(err, MergeError::CyclicDependency { ref keys } if keys.len() == 2));
        assert!(err.is_request_error());
    }

    /// T1.2: Reduction inputs on unrelated branches are rejected.
    #[test]
    fn branch_mismatch_rejected() {
        let registry = standard_registry().with_reduction("countRows", count_rows);
        let count = derived(
            "household",
            "n",
            "countRows",
            json!({ "inputs": [spec("sample", "value"), spec("dwelling", "rooms")] }),
        );
        let err = validate(request("household", vec![], vec![count]), &registry)
            .expect_err("branches");
        assert!(matches!(err, MergeError::ReductionBranchMismatch { .. }));
    }

    /// T1.3: A custom reduction on one branch is accepted.
    #[test]
    fn custom_reduction_accepted() {
        let registry = standard_registry().with_reduction("countRows", count_rows);
        let count = derived(
            "household",
            "n",
            "countRows",
            json!({ "inputs": [spec("participant", "age"), spec("sample", "value")] }),
        );
        let outputs = vec![spec("household", "n")];
        validate(request("household", outputs, vec![count]), &registry).expect("valid");
    }

    /// T1.4: Unregistered functions are rejected.
    #[test]
    fn unknown_function_rejected() {
        let dv = derived("participant", "x", "median", json!({}));
        let err = validate(request("participant", vec![], vec![dv]), &standard_registry())
            .expect_err("unknown");
        assert!(matches!(
            err,
            MergeError::UnknownFunction { ref function_name, .. } if function_name == "median"
        ));
    }

    /// T1.5: Transforms cannot read descendant variables.
    #[test]
    fn transform_reading_descendant_rejected() {
        let dv = derived(
            "participant",
            "label",
            "concatenation",
            json!({ "inputVariables": [spec("sample", "value")] }),
        );
        let err = validate(request("participant", vec![], vec![dv]), &standard_registry())
            .expect_err("descendant input");
        assert!(matches!(err, MergeError::TransformInputLocation { .. }));
    }

    /// T1.6: Outputs must be on the target entity or an ancestor.
    #[test]
    fn descendant_output_rejected() {
        let err = validate(
            request("participant", vec![spec("sample", "value")], vec![]),
            &standard_registry(),
        )
        .expect_err("descendant output");
        assert!(matches!(err, MergeError::InvalidRequest(_)));
    }

    /// T1.7: Unknown studies are reported as such.
    #[test]
    fn unknown_study_rejected() {
        let mut req = request("participant", vec![], vec![]);
        req.study_id = "nope".to_string();
        let err = validate(req, &standard_registry()).expect_err("study");
        assert!(matches!(err, MergeError::StudyNotFound(ref id) if id == "nope"));
    }
}

// =============================================================================
// TIER T2: SINGLE-HOP MERGE
// =============================================================================

mod t2_single_hop {
    use super::*;

    /// T2.1: A lone native stream passes through with a dot-notation header.
    #[test]
    fn pass_through() {
        let out = run(
            request("participant", vec![spec("participant", "age")], vec![]),
            None,
            MergeConfig::default(),
        )
        .expect("merge");
        assert_eq!(
            out,
            "participant.participant_id\thousehold.household_id\tparticipant.age\n\
             p1\th1\t30\np2\th1\t41\np3\th2\t25\n"
        );
    }

    /// T2.2: A sum reduction folds each participant's samples.
    #[test]
    fn sum_reduction() {
        let total = derived(
            "participant",
            "total",
            "sum",
            json!({ "inputVariable": spec("sample", "value") }),
        );
        let out = run(
            request("participant", vec![spec("participant", "total")], vec![total]),
            None,
            MergeConfig::default(),
        )
        .expect("merge");
        assert_eq!(
            out,
            "participant.participant_id\thousehold.household_id\tparticipant.total\n\
             p1\th1\t30\np2\th1\t5\np3\th2\t7.5\n"
        );
    }

    /// T2.3: Parent values are repeated on every child row.
    #[test]
    fn inheritance() {
        let out = run(
            request(
                "participant",
                vec![spec("household", "region"), spec("participant", "sex")],
                vec![],
            ),
            None,
            MergeConfig::default(),
        )
        .expect("merge");
        assert_eq!(
            out,
            "participant.participant_id\thousehold.household_id\thousehold.region\tparticipant.sex\n\
             p1\th1\tnorth\tF\np2\th1\tnorth\tM\np3\th2\tsouth\tF\n"
        );
    }

    /// T2.4: Subset membership sees only rows passing its own filters.
    #[test]
    fn subset_membership_uses_filter_override() {
        let female = derived(
            "participant",
            "female",
            "subsetMembership",
            json!({ "subsetFilters": [{
                "type": "stringSet",
                "entityId": "participant",
                "variableId": "sex",
                "stringSet": ["F"]
            }] }),
        );
        let req = request("participant", vec![spec("participant", "female")], vec![female]);
        let supplier = plan(req.clone(), None, MergeConfig::default()).expect("plan");
        let overridden: Vec<_> = supplier
            .required_streams()
            .iter()
            .filter(|s| s.filters_override.is_some())
            .collect();
        assert_eq!(overridden.len(), 1);
        assert_eq!(supplier.effective_filters(overridden[0]).len(), 1);

        let out = run(req, None, MergeConfig::default()).expect("merge");
        let values: Vec<&str> = out
            .lines()
            .skip(1)
            .filter_map(|l| l.rsplit('\t').next())
            .collect();
        assert_eq!(values, ["1", "0", "1"]);
    }

    /// T2.5: Computed values on the target entity are spliced in lockstep.
    #[test]
    fn computed_columns_appended() {
        let scores = Scores {
            stream: "participant_id\thousehold_id\tscore\np1\th1\t0.5\np2\th1\t0.25\np3\th2\t1\n",
        };
        let mut req = request("participant", vec![spec("participant", "age")], vec![]);
        req.compute_spec = Some(ComputeSpec {
            compute_name: "scoring".to_string(),
            compute_config: json!({}),
        });
        let out = run(req, Some(&scores), MergeConfig::default()).expect("merge");
        assert_eq!(
            out,
            "participant.participant_id\thousehold.household_id\tparticipant.age\tparticipant.score\n\
             p1\th1\t30\t0.5\np2\th1\t41\t0.25\np3\th2\t25\t1\n"
        );
    }

    /// T2.6: A compute stream that skips a target row is an integrity error.
    #[test]
    fn computed_rows_out_of_step() {
        let scores = Scores {
            stream: "participant_id\thousehold_id\tscore\np1\th1\t0.5\np3\th2\t1\n",
        };
        let mut req = request("participant", vec![], vec![]);
        req.compute_spec = Some(ComputeSpec {
            compute_name: "scoring".to_string(),
            compute_config: json!({}),
        });
        let err = run(req, Some(&scores), MergeConfig::default()).expect_err("mismatch");
        assert!(matches!(err, MergeError::ComputeRowMismatch { .. }));
    }
}

// =============================================================================
// TIER T3: MULTI-HOP MERGE
// =============================================================================

mod t3_multi_hop {
    use super::*;

    /// T3.1: Reductions reach grandchildren.
    #[test]
    fn reduction_over_grandchildren() {
        let total = derived(
            "household",
            "total",
            "sum",
            json!({ "inputVariable": spec("sample", "value") }),
        );
        let out = run(
            request("household", vec![spec("household", "total")], vec![total]),
            None,
            MergeConfig::default(),
        )
        .expect("merge");
        assert_eq!(
            out,
            "household.household_id\thousehold.total\nh1\t35\nh2\t7.5\n"
        );
    }

    /// T3.2: A transform combines a grandparent value with a parent's reduction.
    #[test]
    fn transform_over_inherited_reduction() {
        let total = derived(
            "participant",
            "total",
            "sum",
            json!({ "inputVariable": spec("sample", "value") }),
        );
        let label = derived(
            "sample",
            "label",
            "concatenation",
            json!({
                "inputVariables": [spec("household", "region"), spec("participant", "total")],
                "delimiter": "-"
            }),
        );
        let out = run(
            request("sample", vec![spec("sample", "label")], vec![label, total]),
            None,
            MergeConfig::default(),
        )
        .expect("merge");
        let labels: Vec<&str> = out
            .lines()
            .skip(1)
            .filter_map(|l| l.rsplit('\t').next())
            .collect();
        assert_eq!(labels, ["north-30", "north-30", "north-5", "south-7.5"]);
    }

    /// T3.3: Samples inherit from both ancestors at once.
    #[test]
    fn inheritance_across_two_levels() {
        let out = run(
            request(
                "sample",
                vec![spec("household", "income"), spec("participant", "age")],
                vec![],
            ),
            None,
            MergeConfig::default(),
        )
        .expect("merge");
        let tails: Vec<String> = out
            .lines()
            .skip(1)
            .map(|l| l.split('\t').skip(3).collect::<Vec<_>>().join(","))
            .collect();
        assert_eq!(tails, ["100,30", "100,30", "100,41", "200,25"]);
    }
}

// =============================================================================
// TIER T4: DETERMINISM
// =============================================================================

mod t4_determinism {
    use super::*;

    fn sample_request() -> MergeRequest {
        let total = derived(
            "participant",
            "total",
            "sum",
            json!({ "inputVariable": spec("sample", "value") }),
        );
        request(
            "participant",
            vec![spec("household", "region"), spec("participant", "total")],
            vec![total],
        )
    }

    /// T4.1: Same streams produce byte-identical responses.
    #[test]
    fn identical_runs_identical_output() {
        let first = run(sample_request(), None, MergeConfig::default()).expect("first");
        let second = run(sample_request(), None, MergeConfig::default()).expect("second");
        assert_eq!(first, second);
    }

    /// T4.2: Pass-through and row-by-row merge agree.
    #[test]
    fn pass_through_matches_row_merge() {
        let req = request("sample", vec![spec("sample", "value")], vec![]);
        let fast = run(req.clone(), None, MergeConfig::default()).expect("fast");
        let slow = run(req, None, row_merge()).expect("slow");
        assert_eq!(fast, slow);
    }

    /// T4.3: Plans are stable across runs.
    #[test]
    fn plans_are_stable() {
        let a = plan(sample_request(), None, MergeConfig::default()).expect("plan");
        let b = plan(sample_request(), None, MergeConfig::default()).expect("plan");
        let a = serde_json::to_string(&a.plan()).expect("json");
        let b = serde_json::to_string(&b.plan()).expect("json");
        assert_eq!(a, b);
    }
}
