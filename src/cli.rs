//! CLI argument parsing.
//!
//! The CLI is intentionally thin: each subcommand wires one entry point into
//! the core modules so the same logic backs the gateway and offline use.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint for the correction loop.
#[derive(Parser, Debug)]
#[command(
    name = "redline",
    version,
    about = "Human-in-the-loop correction loop for tabular extraction pipelines",
    after_help = "Examples:\n  redline serve --port 8000\n  redline steps\n  redline recalc --csv fe_list.csv --stage 30_motor_list_normalized --patch edits.json\n  redline map-headers --input fe_list.csv --output fe_list_norm.csv",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Serve(ServeArgs),
    Steps(StepsArgs),
    Recalc(RecalcArgs),
    MapHeaders(MapHeadersArgs),
}

/// Serve the HTTP gateway.
#[derive(Parser, Debug)]
#[command(about = "Serve the correction-loop gateway")]
pub struct ServeArgs {
    /// Repository root holding the transformation scripts (default: cwd)
    #[arg(long, value_name = "DIR")]
    pub repo_root: Option<PathBuf>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Bind port
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
}

/// Print the currently loaded pipeline configuration.
#[derive(Parser, Debug)]
#[command(about = "Print the loaded step registry as JSON")]
pub struct StepsArgs {
    /// Repository root holding the transformation scripts (default: cwd)
    #[arg(long, value_name = "DIR")]
    pub repo_root: Option<PathBuf>,
}

/// Apply a patch to a CSV offline and persist the audit artifacts.
#[derive(Parser, Debug)]
#[command(about = "Apply a patch to a CSV and persist the audit artifacts")]
pub struct RecalcArgs {
    /// Input CSV file
    #[arg(long, value_name = "PATH")]
    pub csv: PathBuf,

    /// Stage name the CSV belongs to (a trailing .csv is stripped)
    #[arg(long, value_name = "NAME")]
    pub stage: String,

    /// Patch JSON file; omit to persist the CSV unchanged
    #[arg(long, value_name = "PATH")]
    pub patch: Option<PathBuf>,

    /// Metadata role recorded in the audit trail
    #[arg(long, default_value = "production")]
    pub role: String,

    /// Repository root the output tree hangs off (default: cwd)
    #[arg(long, value_name = "DIR")]
    pub repo_root: Option<PathBuf>,
}

/// Run the LM-backed header-mapping step over a CSV file.
#[derive(Parser, Debug)]
#[command(about = "Normalize CSV headers onto canonical keys via an LM")]
pub struct MapHeadersArgs {
    /// Input CSV file
    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,

    /// Output CSV file (a _header_map.json sidecar lands next to it)
    #[arg(long, value_name = "PATH")]
    pub output: PathBuf,

    /// LM command invoked with the prompt on stdin (default: REDLINE_LM_COMMAND)
    #[arg(long, value_name = "CMD")]
    pub lm: Option<String>,

    /// Rows included in the prompt as a sample
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub sample_rows: usize,
}
