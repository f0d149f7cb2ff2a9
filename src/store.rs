//! Run-scoped artifact storage.
//!
//! Two directory trees, keyed by run id: `runs/` holds the uploaded document
//! and per-step logs; the output root holds step outputs and recalculation
//! audit artifacts grouped by stage. Runs are never deleted here; cleanup is
//! an operational concern.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

use crate::patch::{Metadata, Patch};

/// Filename of the uploaded source document within a run directory.
pub const INPUT_DOCUMENT: &str = "input.pdf";

/// Paths written by one recalculation.
#[derive(Debug)]
pub struct RecalcArtifacts {
    pub stage_dir: PathBuf,
    pub received_csv: PathBuf,
    pub patched_csv: PathBuf,
    pub metadata: PathBuf,
    pub patch: Option<PathBuf>,
}

/// Storage handle over the runs and output roots.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
    out_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: PathBuf, out_dir: PathBuf) -> Self {
        Self { runs_dir, out_dir }
    }

    /// Mint a time-derived run id. Second resolution: two uploads inside the
    /// same second share an id, which is accepted for a single-operator tool.
    pub fn new_run_id(&self) -> String {
        Utc::now().format("run-%Y%m%d-%H%M%S").to_string()
    }

    /// `runs/<run_id>/` (not created).
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    /// `runs/<run_id>/input.pdf` (not created).
    pub fn input_document_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(INPUT_DOCUMENT)
    }

    /// `runs/<run_id>/<step_name>.log` (not created).
    pub fn step_log_path(&self, run_id: &str, step_name: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{step_name}.log"))
    }

    /// `<out>/<run_id>/<stage>/`, created on demand. Idempotent.
    pub fn stage_dir(&self, run_id: &str, stage: &str) -> Result<PathBuf> {
        let dir = self.out_dir.join(run_id).join(stage);
        fs::create_dir_all(&dir).with_context(|| format!("create stage dir {}", dir.display()))?;
        Ok(dir)
    }

    /// `<out>/<run_id>/`, created on demand so steps can write into it.
    pub fn run_output_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.out_dir.join(run_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create run output dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Store an uploaded document under a fresh run directory.
    pub fn store_input_document(&self, run_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.input_document_path(run_id);
        ensure_parent(&path)?;
        fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        tracing::debug!(run_id, bytes = bytes.len(), "stored input document");
        Ok(path)
    }

    /// Write (or overwrite) the combined capture for one executed step.
    pub fn write_step_log(&self, run_id: &str, step_name: &str, log: &str) -> Result<PathBuf> {
        let path = self.step_log_path(run_id, step_name);
        ensure_parent(&path)?;
        fs::write(&path, log).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Persist the full audit set for one recalculation: the verbatim
    /// received CSV, the post-patch CSV, the metadata, and the patch when one
    /// was supplied. Writes are sequential and best-effort, not transactional;
    /// everything here is re-derivable from received.csv plus patch.json.
    pub fn persist_recalculation(
        &self,
        run_id: &str,
        stage: &str,
        received_csv: &str,
        patched_csv: &str,
        metadata: &Metadata,
        patch: Option<&Patch>,
    ) -> Result<RecalcArtifacts> {
        let stage_dir = self.stage_dir(run_id, stage)?;

        let received = stage_dir.join("received.csv");
        fs::write(&received, received_csv)
            .with_context(|| format!("write {}", received.display()))?;

        let patched = stage_dir.join("patched.csv");
        fs::write(&patched, patched_csv).with_context(|| format!("write {}", patched.display()))?;

        let metadata_path = stage_dir.join("metadata.json");
        write_pretty_json(&metadata_path, metadata)?;

        let patch_path = match patch {
            Some(patch) => {
                let path = stage_dir.join("patch.json");
                write_pretty_json(&path, patch)?;
                Some(path)
            }
            None => None,
        };

        tracing::debug!(run_id, stage, "persisted recalculation artifacts");
        Ok(RecalcArtifacts {
            stage_dir,
            received_csv: received,
            patched_csv: patched,
            metadata: metadata_path,
            patch: patch_path,
        })
    }
}

fn write_pretty_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize audit artifact")?;
    fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent dir {}", parent.display()))?;
    }
    Ok(())
}
