//! # Merge Primitives
//!
//! Hardcoded constants shared by the stream reader, the node tree and the
//! output writer. These are compiled into the binary and immutable at runtime.
//!
//! ## Primitives
//!
//! 1. **Wire format**: tab-delimited, newline-terminated, no quoting.
//! 2. **Missing values**: the empty string.
//! 3. **Bounds**: entity dependency depth is limited so a malformed request
//!    cannot build an unbounded node tree.

/// Field delimiter for every stream read or written by the engine.
pub const FIELD_DELIMITER: u8 = b'\t';

/// Record terminator for merged output.
pub const RECORD_TERMINATOR: u8 = b'\n';

/// Separator between entity id and variable id in output column names.
pub const DOT: char = '.';

/// Value written for a missing or undefined cell.
pub const EMPTY_VALUE: &str = "";

/// Name of the single stream supplied by the compute collaborator.
pub const COMPUTED_VAR_STREAM_NAME: &str = "__COMPUTED_VAR_STREAM__";

/// Default maximum depth of the entity node tree.
///
/// Each ancestor hop and each reduction adds one level.
pub const MAX_ENTITY_DEPENDENCY_DEPTH: usize = 15;
