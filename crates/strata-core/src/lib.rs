//! # strata-core
//!
//! The entity-stream merge engine for Strata - THE LOGIC.
//!
//! This crate assembles per-entity tabular streams into one merged tabular
//! response. Values flow down the entity tree by inheritance, flow up it
//! through reductions, and are finished row by row by transforms.
//!
//! ## Pipeline
//!
//! - `request`: resolve and validate a `MergeRequest` against study metadata
//! - `derived`: build, order and place derived variables
//! - `stream`: the pull-based node tree that merges streams row by row
//! - `processor`: fetch, distribute and write
//!
//! ## Architectural Constraints
//!
//! - Synchronous and single-threaded; the only suspension points are reads
//!   on the upstream streams
//! - Nothing is materialized beyond one lookahead row per stream
//! - Output row order is the target stream's row order
//! - No process-wide state: plugins come from an injected `PluginRegistry`
//! - Has NO async, NO network dependencies (pure Rust)

// =============================================================================
// MODULES
// =============================================================================

pub mod config;
pub mod derived;
pub mod metadata;
#[cfg(feature = "crypto-hash")]
pub mod output;
pub mod plugins;
pub mod primitives;
pub mod processor;
pub mod request;
pub mod stream;
pub mod types;

#[cfg(test)]
mod test_support;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{DerivedVariableSpec, ErrorKind, Filter, MergeError, Row, VariableSpec};

// =============================================================================
// RE-EXPORTS: Metadata & Configuration
// =============================================================================

pub use config::MergeConfig;
pub use metadata::{
    DataShape, EntityDef, EntityDetail, ReferenceMetadata, StudyDetail, VariableDef,
    VariableDetail, VariableSource, VariableType,
};

// =============================================================================
// RE-EXPORTS: Derived Variables
// =============================================================================

pub use derived::{
    DerivedVariable, DerivedVariableFactory, DerivedVariablePlugin, PluginRegistry, Reducer,
    Reduction, Transform,
};
pub use plugins::standard_registry;

// =============================================================================
// RE-EXPORTS: Merge Pipeline
// =============================================================================

pub use processor::{
    MergePlan, MergeRequestProcessor, MergeSummary, MergedResponseSupplier, TabularStreamProvider,
};
pub use request::{
    ComputeProvider, ComputeSpec, ComputedVariableDetail, ComputedVariableMetadata, MergeRequest,
    MetadataProvider, RequestResources,
};
pub use stream::{DataStream, EntityStream, RootEntityNode, StreamSpec};

// =============================================================================
// RE-EXPORTS: Output Integrity (feature-gated)
// =============================================================================

#[cfg(feature = "crypto-hash")]
pub use output::{ChecksumWriter, compute_blake3_hash};
