use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs;
use tracing_subscriber::EnvFilter;

mod api;
mod cli;
mod config;
mod headmap;
mod patch;
mod registry;
mod runner;
mod store;
mod table;

use cli::{Command, MapHeadersArgs, RecalcArgs, RootArgs, ServeArgs, StepsArgs};
use config::AppConfig;
use headmap::HeaderMapRequest;
use patch::{Metadata, Patch, PatchOptions};
use registry::StepRegistry;
use table::Table;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = RootArgs::parse();
    match args.command {
        Command::Serve(args) => cmd_serve(args).await,
        Command::Steps(args) => cmd_steps(args),
        Command::Recalc(args) => cmd_recalc(args),
        Command::MapHeaders(args) => cmd_map_headers(args),
    }
}

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let config = AppConfig::from_env(args.repo_root)?;
    api::server::serve(config, &args.host, args.port).await
}

fn cmd_steps(args: StepsArgs) -> Result<()> {
    let config = AppConfig::from_env(args.repo_root)?;
    let registry = StepRegistry::load(&config);
    let listing = serde_json::json!({
        "steps": registry.steps(),
        "repo_root": config.repo_root.display().to_string(),
        "out_dir": config.out_dir.display().to_string(),
        "runs_dir": config.runs_dir.display().to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

fn cmd_recalc(args: RecalcArgs) -> Result<()> {
    let config = AppConfig::from_env(args.repo_root)?;
    if args.stage.trim().is_empty() {
        return Err(anyhow!("--stage must be non-empty"));
    }

    let csv_text = fs::read_to_string(&args.csv)
        .with_context(|| format!("read {}", args.csv.display()))?;
    let mut table = Table::parse(&csv_text)?;
    if !table.has_headers() {
        return Err(anyhow!("{} has no header record", args.csv.display()));
    }

    let patch: Option<Patch> = match &args.patch {
        Some(path) => {
            let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            Some(serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?)
        }
        None => None,
    };

    let options = PatchOptions {
        strict: config.strict_patch,
    };
    let outcome = patch::apply(&mut table, patch.as_ref(), options);
    let patched_csv = table.serialize();

    let metadata = Metadata {
        stage: args.stage.clone(),
        role: args.role,
        aggregate: true,
        conf_threshold: None,
    };
    let store = config.store();
    let run_id = store.new_run_id();
    let stage_name = args.stage.strip_suffix(".csv").unwrap_or(&args.stage);
    let artifacts = store.persist_recalculation(
        &run_id,
        stage_name,
        &csv_text,
        &patched_csv,
        &metadata,
        patch.as_ref(),
    )?;

    let summary = serde_json::json!({
        "run_id": run_id,
        "stage_dir": artifacts.stage_dir.display().to_string(),
        "rows": table.rows.len(),
        "cols": table.headers.len(),
        "applied_ops": outcome.applied,
        "conflicts": outcome.conflicts.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_map_headers(args: MapHeadersArgs) -> Result<()> {
    let lm_command = args
        .lm
        .or_else(|| std::env::var(headmap::LM_COMMAND_ENV).ok())
        .ok_or_else(|| {
            anyhow!(
                "no LM command: pass --lm or set {}",
                headmap::LM_COMMAND_ENV
            )
        })?;
    headmap::run(&HeaderMapRequest {
        input: args.input,
        output: args.output,
        lm_command,
        sample_rows: args.sample_rows,
    })
}
