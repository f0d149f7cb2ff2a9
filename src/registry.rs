//! Pipeline step definitions.
//!
//! The registry prefers an explicit `pipeline.json` in the repo root and
//! degrades to capability probing: each known transformation script that is
//! present on disk contributes its predefined step, in a fixed order. With
//! nothing to probe, a single diagnostic step proves the execution path.
//!
//! Load never fails - a malformed config is logged and probing takes over -
//! and callers reload per request so edits to `pipeline.json` apply without
//! a restart. Command templates expand at execution time, once a run exists.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::AppConfig;

/// One externally-invoked transformation.
///
/// `cmd` and `outputs` entries may contain the placeholders `{pdf}`,
/// `{run_id}`, `{out_dir}`, `{runs_dir}`, and `{repo_root}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Run through `sh -c` instead of direct argv spawning. Off unless a
    /// step genuinely needs shell syntax (the diagnostic step's redirect).
    #[serde(default)]
    pub shell: bool,
}

#[derive(Debug, Deserialize)]
struct PipelineFile {
    #[serde(default)]
    steps: Vec<Step>,
}

/// An immutable snapshot of the configured pipeline.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: Vec<Step>,
}

/// Known transformation scripts, probed in this order. The relative order is
/// part of the pipeline contract: conversion feeds header mapping feeds row
/// fixes feeds aggregation feeds sizing.
const KNOWN_SCRIPTS: [KnownScript; 5] = [
    KnownScript {
        script: "convert_motor_list.py",
        name: "01_convert",
        args: "--in {pdf} --out {out_dir}/{run_id}/fe_list.csv",
        outputs: &["{out_dir}/{run_id}/fe_list.csv"],
    },
    KnownScript {
        script: "llm_header_map.py",
        name: "02_header_map",
        args: "{out_dir}/{run_id}/fe_list.csv {out_dir}/{run_id}/fe_list_norm.csv",
        outputs: &["{out_dir}/{run_id}/fe_list_norm.csv"],
    },
    KnownScript {
        script: "llm_fix_rows.py",
        name: "03_fix_rows",
        args: "{out_dir}/{run_id}/fe_list_norm.csv {out_dir}/{run_id}/fe_list_fixed.csv",
        outputs: &["{out_dir}/{run_id}/fe_list_fixed.csv"],
    },
    KnownScript {
        script: "heavy_from_llm.py",
        name: "04_heavy",
        args: "{out_dir}/{run_id}/fe_list_fixed.csv {out_dir}/{run_id}/fe_list_heavy.csv",
        outputs: &["{out_dir}/{run_id}/fe_list_heavy.csv"],
    },
    KnownScript {
        script: "size_from_fe_auto.py",
        name: "05_size",
        args: "--in {out_dir}/{run_id}/fe_list_heavy.csv --out {out_dir}/B_full",
        outputs: &[
            "{out_dir}/B_full/drive_list.csv",
            "{out_dir}/B_full/xfmr_list.csv",
            "{out_dir}/B_full/wiring.md",
        ],
    },
];

struct KnownScript {
    script: &'static str,
    name: &'static str,
    args: &'static str,
    outputs: &'static [&'static str],
}

impl StepRegistry {
    /// Load the registry for one request. Never fails: configuration problems
    /// fall back to probing.
    pub fn load(config: &AppConfig) -> Self {
        let path = config.pipeline_config_path();
        if let Some(steps) = load_pipeline_file(&path) {
            return Self { steps };
        }
        Self {
            steps: probe_default_steps(&config.repo_root),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }
}

fn load_pipeline_file(path: &Path) -> Option<Vec<Step>> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice::<PipelineFile>(&bytes) {
        Ok(file) if !file.steps.is_empty() => Some(file.steps),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "pipeline config unparsable, probing instead");
            None
        }
    }
}

/// Emit predefined steps for the known scripts present under `repo_root`,
/// preserving the fixed order of the known list. With none present, emit the
/// diagnostic step.
fn probe_default_steps(repo_root: &Path) -> Vec<Step> {
    let python = python_interpreter();
    let steps: Vec<Step> = KNOWN_SCRIPTS
        .iter()
        .filter(|known| repo_root.join(known.script).is_file())
        .map(|known| Step {
            name: known.name.to_string(),
            cmd: format!("{python} {} {}", known.script, known.args),
            outputs: known.outputs.iter().map(|o| o.to_string()).collect(),
            shell: false,
        })
        .collect();

    if steps.is_empty() {
        tracing::info!("no transformation scripts found, registering diagnostic step");
        return vec![diagnostic_step()];
    }
    steps
}

/// Prefer `python3`; some environments only ship `python`.
fn python_interpreter() -> &'static str {
    if which::which("python3").is_ok() {
        "python3"
    } else {
        "python"
    }
}

/// A step with no real transformation: it writes a marker file so an operator
/// can confirm upload, execution, log capture, and output checking end to end.
fn diagnostic_step() -> Step {
    Step {
        name: "echo".to_string(),
        cmd: "echo Pipeline OK for {pdf} > {out_dir}/{run_id}/pipeline_ok.txt".to_string(),
        outputs: vec!["{out_dir}/{run_id}/pipeline_ok.txt".to_string()],
        shell: true,
    }
}
