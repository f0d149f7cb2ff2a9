//! Process-wide configuration: directory roots and the environment surface.
//!
//! Everything is derived from a repository root so the tool can be pointed at
//! any checkout; only the output root and the CORS allow-list come from the
//! environment.

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::RunStore;

/// Environment override for the output root shared with the extraction scripts.
pub const OUTPUT_ROOT_ENV: &str = "OUTPUT_ROOT";
/// Environment override for the comma-separated CORS allow-list.
pub const ALLOWED_ORIGINS_ENV: &str = "ALLOWED_ORIGINS";
/// Opt-in strict patch mode: reject ops whose expected prior value mismatches.
pub const STRICT_PATCH_ENV: &str = "REDLINE_STRICT_PATCH";

const DEFAULT_ALLOWED_ORIGINS: &str = "https://*.github.io,https://github.io,https://localhost";

/// Resolved configuration shared by the CLI and the gateway.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Checkout containing the transformation scripts; the working directory
    /// for every executed step.
    pub repo_root: PathBuf,
    /// Root for per-run uploads and step logs.
    pub runs_dir: PathBuf,
    /// Root for step outputs and recalculation artifacts.
    pub out_dir: PathBuf,
    /// CORS allow-list; entries may contain a single `*` wildcard.
    pub allowed_origins: Vec<String>,
    /// When true, patch ops with a stale `old` value are rejected instead of
    /// applied.
    pub strict_patch: bool,
}

impl AppConfig {
    /// Build a config from the environment, rooted at `repo_root` (the current
    /// directory when not given).
    pub fn from_env(repo_root: Option<PathBuf>) -> Result<Self> {
        let repo_root = match repo_root {
            Some(root) => root,
            None => env::current_dir().context("resolve current directory")?,
        };
        let runs_dir = repo_root.join("runs");
        let out_dir = match env::var(OUTPUT_ROOT_ENV) {
            Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw),
            _ => repo_root.join("out"),
        };
        let origins_raw = env::var(ALLOWED_ORIGINS_ENV)
            .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string());
        let strict_patch = env::var(STRICT_PATCH_ENV)
            .map(|raw| matches!(raw.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(Self {
            repo_root,
            runs_dir,
            out_dir,
            allowed_origins: parse_origins(&origins_raw),
            strict_patch,
        })
    }

    /// Create the runs and output roots if they do not exist yet.
    pub fn ensure_roots(&self) -> Result<()> {
        fs::create_dir_all(&self.runs_dir)
            .with_context(|| format!("create runs root {}", self.runs_dir.display()))?;
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("create output root {}", self.out_dir.display()))?;
        Ok(())
    }

    /// Return the `pipeline.json` path for this checkout.
    pub fn pipeline_config_path(&self) -> PathBuf {
        self.repo_root.join("pipeline.json")
    }

    /// Build a store over this config's roots.
    pub fn store(&self) -> RunStore {
        RunStore::new(self.runs_dir.clone(), self.out_dir.clone())
    }
}

/// Split a comma-separated origin list, dropping empty entries.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Check an origin against the allow-list. Entries are exact matches unless
/// they contain a `*`, which matches any run of characters.
pub fn origin_allowed(patterns: &[impl AsRef<str>], origin: &str) -> bool {
    patterns.iter().any(|pattern| {
        let pattern = pattern.as_ref();
        match pattern.split_once('*') {
            Some((prefix, suffix)) => {
                origin.len() >= prefix.len() + suffix.len()
                    && origin.starts_with(prefix)
                    && origin.ends_with(suffix)
            }
            None => pattern == origin,
        }
    })
}

/// Resolve a client-supplied path the way the read endpoints do: absolute
/// paths pass through; relative paths are tried under each root in order.
pub fn resolve_readable(path: &str, roots: &[&Path]) -> Option<PathBuf> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return candidate.exists().then(|| candidate.to_path_buf());
    }
    roots
        .iter()
        .map(|root| root.join(candidate))
        .find(|joined| joined.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_origins_trims_and_drops_empties() {
        let origins = parse_origins(" https://a.example , ,https://b.example,");
        assert_eq!(origins, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn origin_allowed_exact_match() {
        let patterns = ["https://localhost"];
        assert!(origin_allowed(&patterns, "https://localhost"));
        assert!(!origin_allowed(&patterns, "https://localhost.evil"));
    }

    #[test]
    fn origin_allowed_wildcard_suffix() {
        let patterns = ["https://*.github.io"];
        assert!(origin_allowed(&patterns, "https://someone.github.io"));
        assert!(!origin_allowed(&patterns, "https://github.io"));
        assert!(!origin_allowed(&patterns, "http://someone.github.io"));
    }

    #[test]
    fn resolve_readable_prefers_first_root() {
        let out = tempfile::tempdir().unwrap();
        let runs = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("a.txt"), "out").unwrap();
        std::fs::write(runs.path().join("a.txt"), "runs").unwrap();
        std::fs::write(runs.path().join("b.txt"), "runs").unwrap();

        let roots = [out.path(), runs.path()];
        assert_eq!(
            resolve_readable("a.txt", &roots).unwrap(),
            out.path().join("a.txt")
        );
        assert_eq!(
            resolve_readable("b.txt", &roots).unwrap(),
            runs.path().join("b.txt")
        );
        assert!(resolve_readable("missing.txt", &roots).is_none());
    }
}
