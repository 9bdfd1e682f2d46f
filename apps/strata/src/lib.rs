//! # strata
//!
//! The Strata binary's library half: configuration, file-backed
//! collaborators and the CLI commands that drive `strata-core`.

pub mod cli;
pub mod config;
pub mod provider;
