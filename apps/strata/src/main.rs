//! # Strata - Streaming Multi-Entity Merge
//!
//! The main binary for the Strata merge engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 apps/strata (THE BINARY)                 │
//! │                                                          │
//! │  ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   │
//! │  │    CLI      │   │   Config    │   │ File Study   │   │
//! │  │   (clap)    │   │   (toml)    │   │ Store (csv)  │   │
//! │  └──────┬──────┘   └──────┬──────┘   └──────┬───────┘   │
//! │         └─────────────────┼─────────────────┘           │
//! │                           ▼                             │
//! │                   ┌───────────────┐                     │
//! │                   │  strata-core  │                     │
//! │                   │  (THE LOGIC)  │                     │
//! │                   └───────────────┘                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! strata -D ./study merge -r request.json -o out.tsv --checksum
//! strata -D ./study plan -r request.json
//! strata plugins --json-mode
//! ```

use clap::Parser;
use strata::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // STRATA_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("STRATA_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "strata=info,strata_core=info".into());

    // Logs go to stderr; stdout carries the merged response.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if cli.verbose && !cli.quiet {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the Strata startup banner.
fn print_banner() {
    eprintln!(
        r#"
  ███████╗████████╗██████╗  █████╗ ████████╗ █████╗
  ██╔════╝╚══██╔══╝██╔══██╗██╔══██╗╚══██╔══╝██╔══██╗
  ███████╗   ██║   ██████╔╝███████║   ██║   ███████║
  ╚════██║   ██║   ██╔══██╗██╔══██║   ██║   ██╔══██║
  ███████║   ██║   ██║  ██║██║  ██║   ██║   ██║  ██║
  ╚══════╝   ╚═╝   ╚═╝  ╚═╝╚═╝  ╚═╝   ╚═╝   ╚═╝  ╚═╝

  Streaming Merge Engine v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
