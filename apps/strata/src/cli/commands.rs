//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::provider::FileStudyStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::{
    ChecksumWriter, ComputeProvider, DataStream, MergeConfig, MergeError, MergePlan,
    MergeRequest, MergeRequestProcessor, MergeSummary, MergedResponseSupplier, RequestResources,
    TabularStreamProvider, standard_registry,
};
use tokio::task::JoinSet;

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum request file size (4 MB).
///
/// Requests are small JSON documents; anything larger is a mistake.
const MAX_REQUEST_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), MergeError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        io::Error::new(e.kind(), format!("Cannot read file metadata: {}", e))
    })?;

    if metadata.len() > max_size {
        return Err(MergeError::InvalidRequest(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve an input path to an existing regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, MergeError> {
    let canonical = path.canonicalize().map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("Invalid file path '{}': {}", path.display(), e),
        )
    })?;

    if !canonical.is_file() {
        return Err(MergeError::InvalidRequest(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Resolve an output path whose parent directory must already exist.
fn validate_output_path(path: &Path) -> Result<PathBuf, MergeError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("Invalid output directory '{}': {}", parent.display(), e),
        )
    })?;

    if !canonical_parent.is_dir() {
        return Err(MergeError::InvalidRequest(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| MergeError::InvalidRequest("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

/// Read and parse a merge request file.
pub fn read_request(path: &Path) -> Result<MergeRequest, MergeError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, MAX_REQUEST_FILE_SIZE)?;
    let text = std::fs::read_to_string(&validated)?;
    serde_json::from_str(&text).map_err(|e| {
        MergeError::InvalidRequest(format!("Malformed request '{}': {}", path.display(), e))
    })
}

/// Validate `request` against the store and plan its node tree.
pub fn plan_request(
    store: &FileStudyStore,
    request: MergeRequest,
    config: MergeConfig,
) -> Result<MergedResponseSupplier, MergeError> {
    let registry = standard_registry();
    let resources = RequestResources::new(
        request,
        store,
        Some(store as &dyn ComputeProvider),
        &registry,
    )?;
    MergeRequestProcessor::new(resources, config).create_merged_response_supplier()
}

fn join_error(e: tokio::task::JoinError) -> MergeError {
    MergeError::Io(io::Error::other(e))
}

// =============================================================================
// MERGE COMMAND
// =============================================================================

/// Inputs of one `merge` invocation.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub data_dir: PathBuf,
    pub request: PathBuf,
    pub output: Option<PathBuf>,
    pub config: MergeConfig,
    pub checksum: bool,
    pub json_mode: bool,
    pub quiet: bool,
}

/// What a merge wrote.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub study_id: String,
    pub entity_id: String,
    pub rows: u64,
    pub bytes: u64,
    pub pass_through: bool,
    pub streams: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blake3: Option<String>,
}

/// Run a merge: plan, open every stream concurrently, then write.
pub async fn cmd_merge(options: MergeOptions) -> Result<MergeReport, MergeError> {
    let store = Arc::new(FileStudyStore::open(&options.data_dir)?);
    tracing::info!(
        study = %store.study_id(),
        data_dir = %store.data_dir().display(),
        "study opened"
    );
    let request = read_request(&options.request)?;
    let supplier = plan_request(&store, request, options.config.clone())?;

    let study_id = store.study_id().to_string();
    let entity_id = supplier.resources().target_entity_id().to_string();
    let streams = fetch_streams(Arc::clone(&store), &supplier).await?;
    let stream_count = streams.len();

    let output = match &options.output {
        Some(path) => Some(validate_output_path(path)?),
        None => None,
    };
    let target = output.clone();
    let (summary, bytes, digest) = tokio::task::spawn_blocking(move || {
        write_response(supplier, streams, target.as_deref())
    })
    .await
    .map_err(join_error)??;

    let report = MergeReport {
        study_id,
        entity_id,
        rows: summary.rows,
        bytes,
        pass_through: summary.pass_through,
        streams: stream_count,
        output,
        blake3: options.checksum.then_some(digest),
    };
    if !options.quiet {
        print_report(&report, options.json_mode);
    }
    Ok(report)
}

/// Open every required stream on the blocking pool.
async fn fetch_streams(
    store: Arc<FileStudyStore>,
    supplier: &MergedResponseSupplier,
) -> Result<BTreeMap<String, DataStream>, MergeError> {
    let study_id = supplier.resources().study_id().to_string();
    let mut tasks: JoinSet<Result<(String, DataStream), MergeError>> = JoinSet::new();

    for spec in supplier.required_streams() {
        let store = Arc::clone(&store);
        let filters = supplier.effective_filters(spec);
        let spec = spec.clone();
        let study_id = study_id.clone();
        tasks.spawn_blocking(move || {
            let stream = store.tabular_stream(&study_id, &spec, &filters)?;
            Ok((spec.name, stream))
        });
    }
    if let (Some(spec), Some(compute)) = (
        supplier.compute_stream(),
        supplier.resources().compute_spec().cloned(),
    ) {
        let store = Arc::clone(&store);
        let study_id = study_id.clone();
        tasks.spawn_blocking(move || {
            let stream = store.computed_stream(&study_id, &compute)?;
            Ok((spec.name, stream))
        });
    }

    let mut streams = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (name, stream) = joined.map_err(join_error)??;
        tracing::debug!(stream = %name, "stream opened");
        streams.insert(name, stream);
    }
    Ok(streams)
}

/// Write the merged response to `output`, or stdout.
fn write_response(
    supplier: MergedResponseSupplier,
    streams: BTreeMap<String, DataStream>,
    output: Option<&Path>,
) -> Result<(MergeSummary, u64, String), MergeError> {
    let sink: Box<dyn Write> = match output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = ChecksumWriter::new(BufWriter::new(sink));
    let summary = supplier.write(streams, &mut writer)?;
    let bytes = writer.bytes_written();
    let (digest, mut inner) = writer.finish();
    inner.flush()?;
    Ok((summary, bytes, digest))
}

fn print_report(report: &MergeReport, json_mode: bool) {
    let text = if json_mode {
        serde_json::to_string_pretty(report).unwrap_or_default()
    } else {
        let mut lines = vec![
            format!("Study:   {}", report.study_id),
            format!("Entity:  {}", report.entity_id),
            format!("Rows:    {}", report.rows),
            format!("Bytes:   {}", report.bytes),
            format!(
                "Mode:    {}",
                if report.pass_through {
                    "pass-through"
                } else {
                    "merged"
                }
            ),
            format!("Streams: {}", report.streams),
        ];
        if let Some(digest) = &report.blake3 {
            lines.push(format!("BLAKE3:  {}", digest));
        }
        lines.join("\n")
    };

    // Merged rows own stdout unless they went to a file.
    if report.output.is_some() {
        println!("{}", text);
    } else {
        eprintln!("{}", text);
    }
}

// =============================================================================
// PLAN COMMAND
// =============================================================================

/// Validate a request and print its plan.
pub fn cmd_plan(
    data_dir: &Path,
    request: &Path,
    config: &MergeConfig,
    json_mode: bool,
) -> Result<(), MergeError> {
    let store = FileStudyStore::open(data_dir)?;
    let supplier = plan_request(&store, read_request(request)?, config.clone())?;
    let plan = supplier.plan();

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&plan).unwrap_or_default());
        return Ok(());
    }
    print!("{}", render_plan(&plan));
    Ok(())
}

/// Human-readable plan.
#[must_use]
pub fn render_plan(plan: &MergePlan) -> String {
    let mut out = String::new();
    out.push_str("Strata Merge Plan\n=================\n");
    out.push_str(&format!("Study:  {}\n", plan.study_id));
    out.push_str(&format!("Entity: {}\n", plan.entity_id));
    out.push_str(&format!(
        "Mode:   {}\n\n",
        if plan.pass_through {
            "pass-through"
        } else {
            "merged"
        }
    ));

    out.push_str("Derived variables (producers first):\n");
    if plan.derived_variables.is_empty() {
        out.push_str("  (none)\n");
    }
    for dv in &plan.derived_variables {
        out.push_str(&format!("  {} = {} ({})\n", dv.column, dv.function_name, dv.kind));
    }

    out.push_str("\nStreams:\n");
    for stream in &plan.streams {
        let variables: Vec<String> = stream.spec.variables.iter().map(|v| v.to_string()).collect();
        out.push_str(&format!(
            "  {} [{}] vars: {}; filters: {}\n",
            stream.spec.name,
            stream.spec.entity_id,
            if variables.is_empty() {
                "-".to_string()
            } else {
                variables.join(", ")
            },
            stream.filters.len()
        ));
    }

    out.push_str("\nOutput columns:\n");
    for column in &plan.output_columns {
        out.push_str(&format!("  {}\n", column));
    }

    out.push_str("\nNode tree:\n");
    for line in plan.tree.lines() {
        out.push_str(&format!("  {}\n", line));
    }
    out
}

// =============================================================================
// PLUGINS COMMAND
// =============================================================================

/// List registered derived variable functions.
pub fn cmd_plugins(json_mode: bool) -> Result<(), MergeError> {
    let registry = standard_registry();
    let transforms: Vec<&str> = registry.transform_names().collect();
    let reductions: Vec<&str> = registry.reduction_names().collect();

    if json_mode {
        let output = serde_json::json!({
            "transforms": transforms,
            "reductions": reductions,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Transforms:");
    for name in &transforms {
        println!("  {}", name);
    }
    println!();
    println!("Reductions:");
    for name in &reductions {
        println!("  {}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_without_directory_resolves_to_cwd() {
        let resolved = validate_output_path(Path::new("out.tsv")).expect("path");
        assert_eq!(resolved.file_name().and_then(|n| n.to_str()), Some("out.tsv"));
    }

    #[test]
    fn output_path_needs_existing_parent() {
        assert!(validate_output_path(Path::new("/definitely/not/here/out.tsv")).is_err());
    }

    #[test]
    fn request_must_be_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_request(dir.path()).expect_err("directory");
        assert!(err.is_request_error());
    }

    #[test]
    fn malformed_request_is_a_request_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("request.json");
        std::fs::write(&path, "{ \"studyId\": ").expect("write");
        let err = read_request(&path).expect_err("malformed");
        assert!(matches!(err, MergeError::InvalidRequest(_)));
    }
}
