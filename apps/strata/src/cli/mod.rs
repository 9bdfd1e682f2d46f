//! # Strata CLI Module
//!
//! This module implements the CLI interface for Strata.
//!
//! ## Available Commands
//!
//! - `merge` - Run a merge request against a data directory
//! - `plan` - Validate a request and show the streams it needs
//! - `plugins` - List registered derived variable functions

mod commands;

use crate::config::{StrataConfig, data_dir_from_env};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use strata_core::MergeError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Strata - streaming multi-entity merge
///
/// Merges per-entity tabular streams into one tabular response, computing
/// derived variables along the way.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress informational output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a TOML config file (default: ./strata.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding study.json, entity tables and compute results
    #[arg(short = 'D', long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a merge request
    Merge {
        /// Path to the request JSON
        #[arg(short, long)]
        request: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Always merge row by row, even for a single plain stream
        #[arg(long)]
        no_pass_through: bool,

        /// Fail when rows are not grouped by their parent ids
        #[arg(long)]
        validate_order: bool,

        /// Report a BLAKE3 digest of the response
        #[arg(long)]
        checksum: bool,
    },

    /// Validate a request and show its plan
    Plan {
        /// Path to the request JSON
        #[arg(short, long)]
        request: PathBuf,
    },

    /// List registered transforms and reductions
    Plugins,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), MergeError> {
    let json_mode = cli.json_mode;
    let config = StrataConfig::load(cli.config.as_deref())?;
    let data_dir = config.data_dir(cli.data_dir.as_deref(), data_dir_from_env());
    if cli.verbose {
        tracing::info!(data_dir = %data_dir.display(), "resolved data directory");
    }

    match cli.command {
        Commands::Merge {
            request,
            output,
            no_pass_through,
            validate_order,
            checksum,
        } => {
            let options = MergeOptions {
                data_dir,
                request,
                output,
                config: config.merge_config(no_pass_through, validate_order),
                checksum,
                json_mode,
                quiet: cli.quiet,
            };
            cmd_merge(options).await.map(|_| ())
        }
        Commands::Plan { request } => cmd_plan(&data_dir, &request, &config.merge, json_mode),
        Commands::Plugins => cmd_plugins(json_mode),
    }
}
