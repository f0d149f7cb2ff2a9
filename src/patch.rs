//! Cell-level patch application over a parsed table.
//!
//! A patch is a batch of `replace` ops submitted by a reviewer. Individual
//! ops that fail to resolve are skipped rather than failing the batch; the
//! caller learns how many ops actually landed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::table::Table;

/// Key columns recognized for row lookup, in priority order.
pub const KEY_COLUMNS: [&str; 3] = ["row_id", "id", "item_no"];

/// Stage metadata accompanying a recalculation; persisted verbatim for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub stage: String,
    pub role: String,
    #[serde(default = "default_aggregate")]
    pub aggregate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf_threshold: Option<f64>,
}

fn default_aggregate() -> bool {
    true
}

/// One cell edit. Only `op == "replace"` does anything; other tags are
/// ignored so future op kinds can flow through older servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_key: Option<String>,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// A reviewer-submitted batch of ops plus opaque client metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub ops: Vec<PatchOp>,
}

/// Apply-time behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchOptions {
    /// Reject ops whose `old` value no longer matches the cell. Off by
    /// default: a stale expectation is recorded but the edit still lands.
    pub strict: bool,
}

/// A mismatch between an op's expected prior value and the actual cell.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub row: usize,
    pub column: String,
    pub expected: String,
    pub actual: String,
    /// False only in strict mode, where the op was rejected.
    pub applied: bool,
}

/// Result of applying one patch.
#[derive(Debug, Default)]
pub struct PatchOutcome {
    /// Ops that resolved to a row and a known column (and, in strict mode,
    /// survived the conflict check).
    pub applied: usize,
    pub conflicts: Vec<Conflict>,
}

/// First recognized key column present in `headers`, if any.
pub fn detect_key_column(headers: &[String]) -> Option<&str> {
    KEY_COLUMNS
        .iter()
        .copied()
        .find(|candidate| headers.iter().any(|header| header == candidate))
}

/// Apply `patch` to `table` in place.
///
/// Per op: key lookup wins when a key column exists and the key is found;
/// otherwise an in-range `row_index` is used; otherwise the op is skipped.
/// Unknown columns are skipped too - the schema is fixed by the original
/// parse and ops never create columns. Key lookup is built once per call;
/// duplicate keys resolve to the later row.
pub fn apply(table: &mut Table, patch: Option<&Patch>, options: PatchOptions) -> PatchOutcome {
    let mut outcome = PatchOutcome::default();
    let Some(patch) = patch else {
        return outcome;
    };
    if patch.ops.is_empty() {
        return outcome;
    }

    let key_column = detect_key_column(&table.headers).map(str::to_string);
    let mut by_key: BTreeMap<String, usize> = BTreeMap::new();
    if let Some(key) = &key_column {
        for (idx, row) in table.rows.iter().enumerate() {
            let value = row.get(key).map(String::as_str).unwrap_or("");
            if !value.is_empty() {
                by_key.insert(value.to_string(), idx);
            }
        }
    }

    for op in &patch.ops {
        if op.op != "replace" {
            continue;
        }
        let mut idx = None;
        if let (Some(row_key), Some(_)) = (&op.row_key, &key_column) {
            idx = by_key.get(row_key).copied();
        }
        if idx.is_none() {
            if let Some(row_index) = op.row_index {
                if row_index < table.rows.len() {
                    idx = Some(row_index);
                }
            }
        }
        let Some(idx) = idx else {
            continue;
        };
        if !table.headers.iter().any(|header| *header == op.column) {
            continue;
        }

        let current = table.rows[idx]
            .get(&op.column)
            .cloned()
            .unwrap_or_default();
        let stale = op.old.as_ref().is_some_and(|old| *old != current);
        if stale {
            outcome.conflicts.push(Conflict {
                row: idx,
                column: op.column.clone(),
                expected: op.old.clone().unwrap_or_default(),
                actual: current,
                applied: !options.strict,
            });
            if options.strict {
                continue;
            }
        }

        table.rows[idx].insert(op.column.clone(), op.value.clone().unwrap_or_default());
        outcome.applied += 1;
    }

    outcome
}
