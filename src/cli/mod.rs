//! Command-line interface for brainprep.
//!
//! Provides commands to run stages, check and persist the completion
//! ledger, preview plans, and collect exported results.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
