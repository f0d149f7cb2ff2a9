//! One-step execution: template expansion, process capture, log persistence,
//! declared-output checks.
//!
//! A step failing is a result, not an error: the runner reports the exit code
//! and the combined capture and leaves the next decision to the operator.
//! Only bad requests (index out of range, missing upload) and storage
//! problems surface as errors.

use anyhow::{Context as _, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::AppConfig;
use crate::registry::{Step, StepRegistry};
use crate::store::RunStore;

/// Exit code reported when the process could not be spawned at all,
/// distinguishing infrastructure failure from the tool's own failure.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 999;

/// Run-scoped values substituted into command and output templates.
#[derive(Debug, Clone)]
pub struct RunVars {
    pub run_id: String,
    pub pdf: PathBuf,
    pub out_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub repo_root: PathBuf,
}

impl RunVars {
    pub fn new(config: &AppConfig, store: &RunStore, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            pdf: store.input_document_path(run_id),
            out_dir: config.out_dir.clone(),
            runs_dir: config.runs_dir.clone(),
            repo_root: config.repo_root.clone(),
        }
    }

    /// Expand every placeholder in `template`.
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{pdf}", &self.pdf.display().to_string())
            .replace("{run_id}", &self.run_id)
            .replace("{out_dir}", &self.out_dir.display().to_string())
            .replace("{runs_dir}", &self.runs_dir.display().to_string())
            .replace("{repo_root}", &self.repo_root.display().to_string())
    }
}

/// Outcome of one step execution. `ok` mirrors the exit code; `outputs` maps
/// each expanded declared output to its on-disk existence so partial
/// completion stays visible.
#[derive(Debug, Serialize)]
pub struct StepOutcome {
    pub ok: bool,
    pub exit_code: i32,
    pub log: String,
    pub outputs: BTreeMap<String, bool>,
    pub cmd: String,
}

/// Why a step invocation was refused before anything ran.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("step_index {index} out of range ({count} steps loaded)")]
    StepIndexOutOfRange { index: usize, count: usize },
    #[error("no uploaded document for run {run_id}; upload first")]
    MissingDocument { run_id: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Execute step `step_index` of `registry` for `run_id`.
///
/// Stateless across calls: everything that matters lands on disk (the log)
/// or in the returned outcome.
pub fn execute_step(
    config: &AppConfig,
    registry: &StepRegistry,
    run_id: &str,
    step_index: usize,
) -> Result<StepOutcome, ExecError> {
    let step = registry
        .get(step_index)
        .ok_or(ExecError::StepIndexOutOfRange {
            index: step_index,
            count: registry.steps().len(),
        })?;

    let store = config.store();
    let vars = RunVars::new(config, &store, run_id);
    if !vars.pdf.is_file() {
        return Err(ExecError::MissingDocument {
            run_id: run_id.to_string(),
        });
    }

    // Steps conventionally write under <out>/<run_id>; make sure it exists
    // so the first step of a fresh run does not fail on a missing directory.
    store.run_output_dir(run_id)?;

    let cmd = vars.expand(&step.cmd);
    let (exit_code, log) = run_command(step, &cmd, &config.repo_root);
    store.write_step_log(run_id, &step.name, &log)?;

    let outputs = check_outputs(step, &vars);
    let ok = exit_code == 0;
    tracing::info!(run_id, step = %step.name, exit_code, ok, "step finished");

    Ok(StepOutcome {
        ok,
        exit_code,
        log,
        outputs,
        cmd,
    })
}

/// Run the expanded command from the repo root, capturing stdout and stderr
/// combined (stderr appended after a separating newline when non-empty).
/// Spawn failures become the runner exit code with the error as the log body.
fn run_command(step: &Step, cmd: &str, repo_root: &Path) -> (i32, String) {
    let spawned = if step.shell {
        Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(repo_root)
            .output()
    } else {
        match split_argv(cmd) {
            Ok(argv) => Command::new(&argv[0])
                .args(&argv[1..])
                .current_dir(repo_root)
                .output(),
            Err(err) => return (SPAWN_FAILURE_EXIT_CODE, err.to_string()),
        }
    };

    match spawned {
        Ok(output) => {
            let mut log = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                log.push('\n');
                log.push_str(&stderr);
            }
            // A signal-terminated child has no code; fold it into -1 so the
            // caller still sees a non-zero result.
            (output.status.code().unwrap_or(-1), log)
        }
        Err(err) => (
            SPAWN_FAILURE_EXIT_CODE,
            format!("failed to spawn `{cmd}`: {err}"),
        ),
    }
}

fn split_argv(cmd: &str) -> Result<Vec<String>> {
    let argv = shell_words::split(cmd).with_context(|| format!("parse command `{cmd}`"))?;
    if argv.is_empty() {
        anyhow::bail!("empty command");
    }
    Ok(argv)
}

fn check_outputs(step: &Step, vars: &RunVars) -> BTreeMap<String, bool> {
    step.outputs
        .iter()
        .map(|template| {
            let expanded = vars.expand(template);
            let exists = Path::new(&expanded).exists();
            (expanded, exists)
        })
        .collect()
}
