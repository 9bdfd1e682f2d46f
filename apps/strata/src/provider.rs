//! # File-Backed Collaborators
//!
//! One study on disk, laid out as:
//!
//! ```text
//! <data-dir>/study.json                 StudyDetail
//! <data-dir>/<entityId>.tsv             one table per entity
//! <data-dir>/compute/<name>.json        ComputedVariableMetadata
//! <data-dir>/compute/<name>.tsv         computed rows
//! ```
//!
//! Entity tables carry a header naming each column by dot notation
//! (`participant.age`) or by raw id (`age`), and must already be sorted the
//! way the engine expects. Streams are projected and filtered row by row;
//! only the id sets needed for cross-entity filters are held in memory.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use strata_core::{
    ComputeProvider, ComputeSpec, ComputedVariableMetadata, DataStream, Filter, MergeError,
    MetadataProvider, ReferenceMetadata, StreamSpec, StudyDetail, TabularStreamProvider,
    VariableSpec,
};

/// Name of the study metadata file.
pub const STUDY_FILE: &str = "study.json";

/// Subdirectory holding compute results.
pub const COMPUTE_DIR: &str = "compute";

/// Maximum size of a JSON metadata file (16 MB).
const MAX_METADATA_FILE_SIZE: u64 = 16 * 1024 * 1024;

// =============================================================================
// STORE
// =============================================================================

/// Study metadata, entity tables and compute results under one directory.
#[derive(Debug)]
pub struct FileStudyStore {
    data_dir: PathBuf,
    study: StudyDetail,
    metadata: ReferenceMetadata,
}

impl FileStudyStore {
    /// Load `study.json` from `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, MergeError> {
        let study: StudyDetail = read_json(&data_dir.join(STUDY_FILE))?;
        let metadata = ReferenceMetadata::new(study.clone())?;
        tracing::info!(
            study = %study.id,
            data_dir = %data_dir.display(),
            entities = metadata.entities().count(),
            "study store opened"
        );
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            study,
            metadata,
        })
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn study_id(&self) -> &str {
        &self.study.id
    }

    fn table_path(&self, entity_id: &str) -> Result<PathBuf, MergeError> {
        Ok(self.data_dir.join(format!("{}.tsv", file_stem(entity_id)?)))
    }

    fn compute_path(&self, spec: &ComputeSpec, extension: &str) -> Result<PathBuf, MergeError> {
        Ok(self
            .data_dir
            .join(COMPUTE_DIR)
            .join(format!("{}.{}", file_stem(&spec.compute_name)?, extension)))
    }

    fn check_study(&self, study_id: &str) -> Result<(), MergeError> {
        if study_id == self.study.id {
            Ok(())
        } else {
            Err(MergeError::StudyNotFound(study_id.to_string()))
        }
    }

    fn open_table(&self, entity_id: &str) -> Result<Table, MergeError> {
        let path = self.table_path(entity_id)?;
        let file = File::open(&path).map_err(|e| {
            io::Error::new(e.kind(), format!("Cannot open '{}': {}", path.display(), e))
        })?;
        Table::new(entity_id, file)
    }

    /// Per-row tests for `filters`, resolved against `entity_id`.
    fn row_tests(&self, entity_id: &str, filters: &[Filter]) -> Result<Vec<RowTest>, MergeError> {
        let own_id = self.metadata.entity(entity_id)?.id_variable();
        let mut tests = Vec::with_capacity(filters.len());
        for filter in filters {
            let filtered = filter.entity_id();
            if filtered == entity_id {
                tests.push(RowTest::Own(filter.clone()));
            } else if self.metadata.is_entity_ancestor_of(filtered, entity_id) {
                let ancestor_id = self.metadata.entity(filtered)?.id_variable();
                let ids = self.passing_values(filter, &ancestor_id)?;
                tests.push(RowTest::IdIn(ancestor_id, ids));
            } else if self.metadata.is_entity_ancestor_of(entity_id, filtered) {
                let ids = self.passing_values(filter, &own_id)?;
                tests.push(RowTest::IdIn(own_id.clone(), ids));
            } else {
                return Err(MergeError::InvalidRequest(format!(
                    "Filter on {} cannot be applied to entity '{}': the entities are on \
                     unrelated branches",
                    filter.variable(),
                    entity_id
                )));
            }
        }
        Ok(tests)
    }

    /// Values of `column` on the filter entity's rows that pass `filter`.
    fn passing_values(
        &self,
        filter: &Filter,
        column: &VariableSpec,
    ) -> Result<BTreeSet<String>, MergeError> {
        let mut table = self.open_table(filter.entity_id())?;
        let value_at = table.position(column)?;
        let test = RowTest::Own(filter.clone()).bind(&table)?;
        let mut values = BTreeSet::new();
        let mut record = csv::StringRecord::new();
        while table.reader.read_record(&mut record)? {
            if test.passes(&record) {
                values.insert(record.get(value_at).unwrap_or_default().to_string());
            }
        }
        tracing::debug!(
            filter = %filter.variable(),
            column = %column,
            passing = values.len(),
            "resolved cross-entity filter"
        );
        Ok(values)
    }
}

/// Entity and compute names become file names; keep them inside the data dir.
fn file_stem(name: &str) -> Result<&str, MergeError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0')
    {
        return Err(MergeError::InvalidRequest(format!(
            "'{}' cannot be used as a file name",
            name
        )));
    }
    Ok(name)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, MergeError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        io::Error::new(e.kind(), format!("Cannot read '{}': {}", path.display(), e))
    })?;
    if metadata.len() > MAX_METADATA_FILE_SIZE {
        return Err(MergeError::Configuration(format!(
            "'{}' exceeds {} bytes",
            path.display(),
            MAX_METADATA_FILE_SIZE
        )));
    }
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| MergeError::Configuration(format!("{}: {}", path.display(), e)))
}

// =============================================================================
// TABLES & FILTERS
// =============================================================================

/// An open entity table with its header.
struct Table {
    entity_id: String,
    header: Vec<String>,
    reader: csv::Reader<File>,
}

impl Table {
    fn new(entity_id: &str, file: File) -> Result<Self, MergeError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .has_headers(true)
            .from_reader(file);
        let header = reader.headers()?.iter().map(str::to_string).collect();
        Ok(Self {
            entity_id: entity_id.to_string(),
            header,
            reader,
        })
    }

    /// Column index of `variable`: dot notation first, then the raw id.
    fn position(&self, variable: &VariableSpec) -> Result<usize, MergeError> {
        let dotted = variable.dot_notation();
        self.header
            .iter()
            .position(|h| *h == dotted)
            .or_else(|| {
                self.header
                    .iter()
                    .position(|h| *h == variable.variable_id)
            })
            .ok_or_else(|| {
                MergeError::InvalidRequest(format!(
                    "Table '{}.tsv' has no column for {}",
                    self.entity_id, dotted
                ))
            })
    }
}

/// A filter as it applies to one stream.
enum RowTest {
    /// Evaluate the filter on the row itself.
    Own(Filter),
    /// Keep rows whose `column` value is in the set.
    IdIn(VariableSpec, BTreeSet<String>),
}

impl RowTest {
    fn bind(self, table: &Table) -> Result<BoundTest, MergeError> {
        Ok(match self {
            Self::Own(filter) => BoundTest {
                column: table.position(&filter.variable())?,
                check: Check::Filter(filter),
            },
            Self::IdIn(column, ids) => BoundTest {
                column: table.position(&column)?,
                check: Check::OneOf(ids),
            },
        })
    }
}

enum Check {
    Filter(Filter),
    OneOf(BTreeSet<String>),
}

/// A row test resolved to a column index.
struct BoundTest {
    column: usize,
    check: Check,
}

impl BoundTest {
    fn passes(&self, record: &csv::StringRecord) -> bool {
        let value = record.get(self.column).unwrap_or_default();
        match &self.check {
            Check::OneOf(ids) => ids.contains(value),
            Check::Filter(Filter::StringSet { string_set, .. }) => {
                string_set.iter().any(|s| s == value)
            }
            Check::Filter(Filter::NumberRange { min, max, .. }) => {
                match value.trim().parse::<f64>() {
                    Ok(v) => min.is_none_or(|m| v >= m) && max.is_none_or(|m| v <= m),
                    Err(_) => false,
                }
            }
        }
    }
}

// =============================================================================
// PROJECTED STREAM
// =============================================================================

/// Lazily projects and filters an entity table into the engine's stream
/// format: a header of raw ids, then one tab-separated line per kept row.
struct ProjectedStream {
    reader: csv::Reader<File>,
    columns: Vec<usize>,
    tests: Vec<BoundTest>,
    record: csv::StringRecord,
    buffer: Vec<u8>,
    offset: usize,
    done: bool,
}

impl ProjectedStream {
    fn new(
        table: Table,
        columns: Vec<usize>,
        header: &[String],
        tests: Vec<BoundTest>,
    ) -> Self {
        let mut buffer = header.join("\t").into_bytes();
        buffer.push(b'\n');
        Self {
            reader: table.reader,
            columns,
            tests,
            record: csv::StringRecord::new(),
            buffer,
            offset: 0,
            done: false,
        }
    }

    /// Refill the buffer with the next kept row; false at end of table.
    fn fill(&mut self) -> io::Result<bool> {
        loop {
            if !self.reader.read_record(&mut self.record).map_err(io::Error::other)? {
                return Ok(false);
            }
            if !self.tests.iter().all(|t| t.passes(&self.record)) {
                continue;
            }
            self.buffer.clear();
            self.offset = 0;
            for (i, &column) in self.columns.iter().enumerate() {
                if i > 0 {
                    self.buffer.push(b'\t');
                }
                self.buffer
                    .extend_from_slice(self.record.get(column).unwrap_or_default().as_bytes());
            }
            self.buffer.push(b'\n');
            return Ok(true);
        }
    }
}

impl Read for ProjectedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.buffer.len() {
            if self.done || !self.fill()? {
                self.done = true;
                return Ok(0);
            }
        }
        let n = buf.len().min(self.buffer.len() - self.offset);
        buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

// =============================================================================
// COLLABORATOR IMPLEMENTATIONS
// =============================================================================

impl MetadataProvider for FileStudyStore {
    fn study(&self, study_id: &str) -> Result<Option<StudyDetail>, MergeError> {
        Ok((study_id == self.study.id).then(|| self.study.clone()))
    }
}

impl TabularStreamProvider for FileStudyStore {
    fn tabular_stream(
        &self,
        study_id: &str,
        spec: &StreamSpec,
        filters: &[Filter],
    ) -> Result<DataStream, MergeError> {
        self.check_study(study_id)?;
        let wanted = self
            .metadata
            .tabular_columns(&spec.entity_id, &spec.variables)?;
        let row_tests = self.row_tests(&spec.entity_id, filters)?;

        let table = self.open_table(&spec.entity_id)?;
        let columns = wanted
            .iter()
            .map(|v| table.position(v))
            .collect::<Result<Vec<_>, _>>()?;
        let tests = row_tests
            .into_iter()
            .map(|t| t.bind(&table))
            .collect::<Result<Vec<_>, _>>()?;
        let header: Vec<String> = wanted.iter().map(|v| v.variable_id.clone()).collect();

        tracing::debug!(
            stream = %spec.name,
            entity = %spec.entity_id,
            columns = ?header,
            filters = tests.len(),
            "opened tabular stream"
        );
        Ok(Box::new(ProjectedStream::new(table, columns, &header, tests)))
    }
}

impl ComputeProvider for FileStudyStore {
    fn results_available(&self, study_id: &str, spec: &ComputeSpec) -> Result<bool, MergeError> {
        self.check_study(study_id)?;
        Ok(self.compute_path(spec, "json")?.is_file() && self.compute_path(spec, "tsv")?.is_file())
    }

    fn computed_variables(
        &self,
        study_id: &str,
        spec: &ComputeSpec,
    ) -> Result<ComputedVariableMetadata, MergeError> {
        self.check_study(study_id)?;
        read_json(&self.compute_path(spec, "json")?)
    }

    fn computed_stream(
        &self,
        study_id: &str,
        spec: &ComputeSpec,
    ) -> Result<DataStream, MergeError> {
        self.check_study(study_id)?;
        let path = self.compute_path(spec, "tsv")?;
        let file = File::open(&path).map_err(|e| {
            io::Error::new(e.kind(), format!("Cannot open '{}': {}", path.display(), e))
        })?;
        Ok(Box::new(file))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const STUDY: &str = r#"{
        "id": "s1",
        "rootEntity": {
            "id": "household",
            "idColumnName": "household_id",
            "variables": [{ "id": "region", "type": "string", "dataShape": "categorical" }],
            "children": [
                {
                    "id": "participant",
                    "idColumnName": "participant_id",
                    "variables": [{ "id": "age", "type": "integer" }]
                },
                { "id": "dwelling", "idColumnName": "dwelling_id" }
            ]
        }
    }"#;

    fn store() -> (tempfile::TempDir, FileStudyStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(STUDY_FILE), STUDY).expect("study");
        fs::write(
            dir.path().join("household.tsv"),
            "household.household_id\thousehold.region\nh1\tnorth\nh2\tsouth\n",
        )
        .expect("household");
        fs::write(
            dir.path().join("participant.tsv"),
            "age\tparticipant_id\thousehold_id\n30\tp1\th1\n41\tp2\th1\n25\tp3\th2\n",
        )
        .expect("participant");
        let store = FileStudyStore::open(dir.path()).expect("open");
        (dir, store)
    }

    fn read(stream: DataStream) -> String {
        let mut text = String::new();
        let mut stream = stream;
        stream.read_to_string(&mut text).expect("read");
        text
    }

    fn participant_ages() -> StreamSpec {
        StreamSpec::new("participant#1", "participant")
            .with_variables(vec![VariableSpec::new("participant", "age")])
    }

    #[test]
    fn projects_columns_in_stream_order() {
        let (_dir, store) = store();
        let text = read(
            store
                .tabular_stream("s1", &participant_ages(), &[])
                .expect("stream"),
        );
        assert_eq!(
            text,
            "participant_id\thousehold_id\tage\np1\th1\t30\np2\th1\t41\np3\th2\t25\n"
        );
    }

    #[test]
    fn own_number_range_filter() {
        let (_dir, store) = store();
        let filter = Filter::NumberRange {
            entity_id: "participant".to_string(),
            variable_id: "age".to_string(),
            min: Some(26.0),
            max: None,
        };
        let text = read(
            store
                .tabular_stream("s1", &participant_ages(), &[filter])
                .expect("stream"),
        );
        assert_eq!(text, "participant_id\thousehold_id\tage\np1\th1\t30\np2\th1\t41\n");
    }

    #[test]
    fn ancestor_filter_keeps_rows_of_passing_ancestors() {
        let (_dir, store) = store();
        let filter = Filter::StringSet {
            entity_id: "household".to_string(),
            variable_id: "region".to_string(),
            string_set: vec!["south".to_string()],
        };
        let text = read(
            store
                .tabular_stream("s1", &participant_ages(), &[filter])
                .expect("stream"),
        );
        assert_eq!(text, "participant_id\thousehold_id\tage\np3\th2\t25\n");
    }

    #[test]
    fn descendant_filter_keeps_rows_with_passing_descendants() {
        let (_dir, store) = store();
        let filter = Filter::NumberRange {
            entity_id: "participant".to_string(),
            variable_id: "age".to_string(),
            min: None,
            max: Some(28.0),
        };
        let spec = StreamSpec::new("household#1", "household");
        let text = read(store.tabular_stream("s1", &spec, &[filter]).expect("stream"));
        assert_eq!(text, "household_id\nh2\n");
    }

    #[test]
    fn unrelated_branch_filter_rejected() {
        let (_dir, store) = store();
        let filter = Filter::StringSet {
            entity_id: "dwelling".to_string(),
            variable_id: "dwelling_id".to_string(),
            string_set: vec!["d1".to_string()],
        };
        let err = store
            .tabular_stream("s1", &participant_ages(), &[filter])
            .err()
            .expect("unrelated");
        assert!(err.is_request_error());
    }

    #[test]
    fn unknown_study_is_none() {
        let (_dir, store) = store();
        assert!(store.study("other").expect("lookup").is_none());
        assert_eq!(store.study("s1").expect("lookup").map(|s| s.id), Some("s1".to_string()));
    }

    #[test]
    fn compute_names_stay_inside_data_dir() {
        let (_dir, store) = store();
        let spec = ComputeSpec {
            compute_name: "../escape".to_string(),
            compute_config: serde_json::Value::Null,
        };
        assert!(store.results_available("s1", &spec).is_err());
    }

    #[test]
    fn missing_compute_results_are_unavailable() {
        let (_dir, store) = store();
        let spec = ComputeSpec {
            compute_name: "scores".to_string(),
            compute_config: serde_json::Value::Null,
        };
        assert!(!store.results_available("s1", &spec).expect("check"));
    }
}
