//! Header-map step: LM-assisted canonicalization of extracted table columns.
//!
//! Extraction leaves headers in whatever shape the source document used
//! (spacing artifacts, synonyms, full-width characters). An LM maps them onto
//! the canonical keys; the LM itself is a user-configured command that reads
//! the prompt on stdin and prints JSON on stdout, so any local or remote
//! model can back this step.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use crate::table::{Row, Table};

/// Environment fallback for the LM command when `--lm` is not given.
pub const LM_COMMAND_ENV: &str = "REDLINE_LM_COMMAND";

/// Canonical column keys for normalized motor lists.
pub const CANON_KEYS: [&str; 6] = [
    "用途",
    "出力(kW)",
    "電圧(V)",
    "rpm_base",
    "rpm_top",
    "torque_kgm",
];

const IGNORE_MARKER: &str = "IGNORE";

const PROMPT_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/header_map.md"
));

/// Inputs for one `map-headers` invocation.
#[derive(Debug)]
pub struct HeaderMapRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub lm_command: String,
    pub sample_rows: usize,
}

#[derive(Debug, Deserialize)]
struct MappingResponse {
    #[serde(default)]
    mapping: BTreeMap<String, String>,
}

/// Run the full step: read, prompt, map, normalize, write CSV plus the
/// mapping sidecar (`<output stem>_header_map.json`).
pub fn run(request: &HeaderMapRequest) -> Result<()> {
    let text = fs::read_to_string(&request.input)
        .with_context(|| format!("read {}", request.input.display()))?;
    let table = Table::parse(&text).context("parse input csv")?;
    if !table.has_headers() {
        return Err(anyhow!("input csv has no header record"));
    }

    let prompt = build_prompt(&table, request.sample_rows)?;
    let response = invoke_lm_command(&request.lm_command, &prompt)?;
    let mapping = parse_mapping(&response)?;

    let normalized = apply_mapping(&table, &mapping);
    if let Some(parent) = request.output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create output dir {}", parent.display()))?;
    }
    fs::write(&request.output, normalized.serialize())
        .with_context(|| format!("write {}", request.output.display()))?;

    let sidecar = mapping_sidecar_path(&request.output);
    fs::write(&sidecar, serde_json::to_string_pretty(&mapping)?)
        .with_context(|| format!("write {}", sidecar.display()))?;

    tracing::info!(
        input = %request.input.display(),
        output = %request.output.display(),
        columns = mapping.len(),
        "header map complete"
    );
    Ok(())
}

/// `out/x.csv` -> `out/x_header_map.json`.
fn mapping_sidecar_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{stem}_header_map.json"))
}

fn build_prompt(table: &Table, sample_rows: usize) -> Result<String> {
    let sample: Vec<Row> = table
        .rows
        .iter()
        .take(sample_rows)
        .map(|row| {
            row.iter()
                .map(|(header, value)| (header.clone(), normalize_cell(value)))
                .collect()
        })
        .collect();

    Ok(PROMPT_TEMPLATE
        .replace("{canon}", &serde_json::to_string(&CANON_KEYS)?)
        .replace("{headers}", &serde_json::to_string(&table.headers)?)
        .replace("{sample}", &serde_json::to_string_pretty(&sample)?))
}

/// Invoke the LM command (split with shell-words) with the prompt on stdin
/// and return its stdout.
fn invoke_lm_command(command: &str, prompt: &str) -> Result<String> {
    let argv = shell_words::split(command).with_context(|| format!("parse LM command: {command}"))?;
    if argv.is_empty() {
        return Err(anyhow!("LM command is empty; set --lm or {LM_COMMAND_ENV}"));
    }

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn LM command: {}", argv[0]))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(prompt.as_bytes())
            .context("write prompt to LM stdin")?;
    }

    let output = child.wait_with_output().context("wait for LM command")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "LM command failed with status {}: {}",
            output.status,
            stderr.trim()
        ));
    }
    String::from_utf8(output.stdout).context("decode LM stdout as UTF-8")
}

fn parse_mapping(text: &str) -> Result<BTreeMap<String, String>> {
    let json = extract_json(text);
    let response: MappingResponse = serde_json::from_str(json)
        .with_context(|| format!("parse LM mapping: {}", &text[..text.len().min(500)]))?;
    Ok(response.mapping)
}

/// Strip markdown code fences that chat-tuned models wrap around JSON.
fn extract_json(text: &str) -> &str {
    let text = text.trim();
    if let Some(start) = text.find("```") {
        let start = start + 3;
        // Skip a language tag such as ```json.
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }
    text
}

/// Rename mapped headers (IGNORE keeps the original so column positions hold)
/// and normalize every cell.
fn apply_mapping(table: &Table, mapping: &BTreeMap<String, String>) -> Table {
    let renamed: Vec<String> = table
        .headers
        .iter()
        .map(|header| match mapping.get(header) {
            Some(target) if target != IGNORE_MARKER => target.clone(),
            _ => header.clone(),
        })
        .collect();

    let rows = table
        .rows
        .iter()
        .map(|row| {
            table
                .headers
                .iter()
                .zip(&renamed)
                .map(|(old, new)| {
                    let value = row.get(old).map(String::as_str).unwrap_or("");
                    (new.clone(), normalize_cell(value))
                })
                .collect()
        })
        .collect();

    Table {
        headers: renamed,
        rows,
    }
}

/// Text cleanup for extracted cells: rpm notation variants, digit groups
/// broken by stray spaces or commas, `~` ranges, and spaces wedged between
/// CJK characters by the PDF text layer.
pub fn normalize_cell(value: &str) -> String {
    static DIGIT_GAP: OnceLock<Regex> = OnceLock::new();
    static TILDE: OnceLock<Regex> = OnceLock::new();
    static CJK_GAP: OnceLock<Regex> = OnceLock::new();

    let digit_gap = DIGIT_GAP.get_or_init(|| Regex::new(r"(\d)[\s,]+(\d)").expect("digit regex"));
    let tilde = TILDE.get_or_init(|| Regex::new(r"\s*~\s*").expect("tilde regex"));
    let cjk_gap = CJK_GAP.get_or_init(|| {
        Regex::new(
            r"([\x{3040}-\x{30FF}\x{4E00}-\x{9FFF}\x{FF00}-\x{FFEF}])\s+([\x{3040}-\x{30FF}\x{4E00}-\x{9FFF}\x{FF00}-\x{FFEF}])",
        )
        .expect("cjk regex")
    });

    let mut text = value
        .replace("ｒ/ｍ", "rpm")
        .replace("Ｒ／Ｍ", "rpm")
        .replace("Ｒ/Ｍ", "rpm")
        .replace("r/m", "rpm");
    text = replace_to_fixpoint(digit_gap, &text);
    text = tilde.replace_all(&text, "-").to_string();
    text = replace_to_fixpoint(cjk_gap, &text);
    text.trim().to_string()
}

// Adjacent matches overlap (`1 5 0 0` needs three joins), so iterate until
// the text stops changing.
fn replace_to_fixpoint(regex: &Regex, text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = regex.replace_all(&current, "$1$2").to_string();
        if next == current {
            return current;
        }
        current = next;
    }
}
