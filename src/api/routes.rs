//! Endpoint handlers: validation and wiring only; the core modules do the
//! actual work.

use axum::extract::{Multipart, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::resolve_readable;
use crate::patch::{self, Metadata, Patch, PatchOptions};
use crate::registry::{Step, StepRegistry};
use crate::runner::{self, StepOutcome};
use crate::table::Table;

use super::error::ApiError;
use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub steps: Vec<Step>,
    pub repo_root: String,
    pub out_dir: String,
    pub runs_dir: String,
}

/// Reflect the registry as loaded right now; edits to `pipeline.json` show up
/// on the next call without a restart.
pub async fn config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let registry = StepRegistry::load(&state.config);
    Json(ConfigResponse {
        steps: registry.steps().to_vec(),
        repo_root: state.config.repo_root.display().to_string(),
        out_dir: state.config.out_dir.display().to_string(),
        runs_dir: state.config.runs_dir.display().to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub ok: bool,
    pub run_id: String,
    pub pdf: String,
}

pub async fn upload_pdf(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        if !filename.to_ascii_lowercase().ends_with(".pdf") {
            return Err(ApiError::BadRequest(format!(
                "expected a .pdf document, got {filename:?}"
            )));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::BadRequest(format!("read upload: {err}")))?;

        let store = state.config.store();
        let run_id = store.new_run_id();
        store.store_input_document(&run_id, &bytes)?;
        let pdf = format!("/runs/{run_id}/input.pdf");
        tracing::info!(%run_id, bytes = bytes.len(), "document uploaded");
        return Ok(Json(UploadResponse {
            ok: true,
            run_id,
            pdf,
        }));
    }
    Err(ApiError::BadRequest(
        "multipart field 'file' is required".to_string(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExecStepRequest {
    pub run_id: String,
    pub step_index: usize,
}

/// Run one step synchronously: the request blocks until the external process
/// exits. The registry is reloaded per call and the snapshot used throughout.
pub async fn exec_step(
    State(state): State<AppState>,
    Json(request): Json<ExecStepRequest>,
) -> Result<Json<StepOutcome>, ApiError> {
    let config = state.config.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let registry = StepRegistry::load(&config);
        runner::execute_step(&config, &registry, &request.run_id, request.step_index)
    })
    .await
    .map_err(|err| ApiError::Internal(format!("exec task failed: {err}")))??;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub run_id: String,
    pub step_name: String,
}

pub async fn get_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<String, ApiError> {
    let path = state
        .config
        .store()
        .step_log_path(&query.run_id, &query.step_name);
    fs::read_to_string(path).map_err(|_| ApiError::NotFound("log not found".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

pub async fn read_text(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<String, ApiError> {
    read_under_roots(&state, &query.path, "file not found")
}

pub async fn read_csv(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<String, ApiError> {
    read_under_roots(&state, &query.path, "csv not found")
}

/// Relative paths resolve against the output root first, then the runs root.
fn read_under_roots(state: &AppState, path: &str, missing: &str) -> Result<String, ApiError> {
    let roots: [&Path; 2] = [&state.config.out_dir, &state.config.runs_dir];
    let resolved =
        resolve_readable(path, &roots).ok_or_else(|| ApiError::NotFound(missing.to_string()))?;
    fs::read_to_string(&resolved)
        .map_err(|err| ApiError::Internal(format!("read {}: {err}", resolved.display())))
}

#[derive(Debug, Deserialize)]
pub struct SaveCsvRequest {
    pub path: String,
    pub csv: String,
}

#[derive(Debug, Serialize)]
pub struct SaveCsvResponse {
    pub ok: bool,
    pub path: String,
}

pub async fn save_csv(
    State(state): State<AppState>,
    Json(request): Json<SaveCsvRequest>,
) -> Result<Json<SaveCsvResponse>, ApiError> {
    let candidate = Path::new(&request.path);
    let target: PathBuf = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        state.config.out_dir.join(candidate)
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ApiError::Internal(format!("create {}: {err}", parent.display())))?;
    }
    fs::write(&target, &request.csv)
        .map_err(|err| ApiError::Internal(format!("write {}: {err}", target.display())))?;
    Ok(Json(SaveCsvResponse {
        ok: true,
        path: target.display().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecalcRequest {
    pub metadata: Metadata,
    pub csv: String,
    #[serde(default)]
    pub patch: Option<Patch>,
}

#[derive(Debug, Serialize)]
pub struct RecalcResponse {
    pub ok: bool,
    pub saved: SavedArtifacts,
    pub summary: RecalcSummary,
}

#[derive(Debug, Serialize)]
pub struct SavedArtifacts {
    pub run_id: String,
    pub stage_dir: String,
    pub received_csv_path: String,
    pub patched_csv_path: String,
    pub patch_path: Option<String>,
    pub metadata_path: String,
}

#[derive(Debug, Serialize)]
pub struct RecalcSummary {
    pub rows: usize,
    pub cols: usize,
    pub applied_ops: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<usize>,
}

/// Apply the submitted patch to the submitted CSV and persist the audit set:
/// the verbatim received CSV, the patched CSV, the metadata, and the patch.
pub async fn recalculate(
    State(state): State<AppState>,
    Json(request): Json<RecalcRequest>,
) -> Result<Json<RecalcResponse>, ApiError> {
    if request.metadata.stage.trim().is_empty() || request.csv.is_empty() {
        return Err(ApiError::BadRequest(
            "metadata.stage and csv are required".to_string(),
        ));
    }
    let mut table = Table::parse(&request.csv)
        .map_err(|err| ApiError::BadRequest(format!("csv could not be parsed: {err}")))?;
    if !table.has_headers() {
        return Err(ApiError::BadRequest(
            "csv has no header record".to_string(),
        ));
    }

    let options = PatchOptions {
        strict: state.config.strict_patch,
    };
    let outcome = patch::apply(&mut table, request.patch.as_ref(), options);
    let patched_csv = table.serialize();

    let store = state.config.store();
    let run_id = store.new_run_id();
    let stage = request.metadata.stage.clone();
    let stage_name = stage.strip_suffix(".csv").unwrap_or(&stage);
    let artifacts = store.persist_recalculation(
        &run_id,
        stage_name,
        &request.csv,
        &patched_csv,
        &request.metadata,
        request.patch.as_ref(),
    )?;

    tracing::info!(
        %run_id,
        stage = stage_name,
        applied = outcome.applied,
        conflicts = outcome.conflicts.len(),
        "recalculation persisted"
    );
    Ok(Json(RecalcResponse {
        ok: true,
        saved: SavedArtifacts {
            run_id,
            stage_dir: artifacts.stage_dir.display().to_string(),
            received_csv_path: artifacts.received_csv.display().to_string(),
            patched_csv_path: artifacts.patched_csv.display().to_string(),
            patch_path: artifacts.patch.map(|p| p.display().to_string()),
            metadata_path: artifacts.metadata.display().to_string(),
        },
        summary: RecalcSummary {
            rows: table.rows.len(),
            cols: table.headers.len(),
            applied_ops: outcome.applied,
            conflicts: (!outcome.conflicts.is_empty()).then_some(outcome.conflicts.len()),
        },
    }))
}
