use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::{ManifestTool, ToolInvocation};
use crate::finding::DependencyFinding;

const ECOSYSTEM: &str = "pip";

/// `pip list --outdated` for projects with a `requirements.txt`.
///
/// pip reports on the interpreter's environment rather than on the checkout,
/// so findings are narrowed to the packages `requirements.txt` names.
pub struct PipOutdated {
    program: String,
}

impl PipOutdated {
    /// Use a specific `pip` executable instead of the one on `PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PipOutdated {
    fn default() -> Self {
        Self::with_program("pip")
    }
}

#[derive(Debug, Deserialize)]
struct PipEntry {
    name: String,
    version: String,
    latest_version: String,
}

/// PEP 503 name normalization: case-insensitive, with runs of `-`, `_` and `.`
/// treated as a single `-`.
fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            in_separator = true;
            continue;
        }
        if in_separator && !normalized.is_empty() {
            normalized.push('-');
        }
        in_separator = false;
        normalized.extend(c.to_lowercase());
    }
    normalized
}

/// Normalized names of the packages a requirements file declares.
///
/// Options (`-r`, `-e`, `--index-url`, ...) and comments are skipped.
fn requirement_names(contents: &str) -> HashSet<String> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split_once(" #").map_or(line, |(req, _)| req).trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
                return None;
            }
            let end = line
                .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
                .unwrap_or(line.len());
            let name = normalize_name(&line[..end]);
            (!name.is_empty()).then_some(name)
        })
        .collect()
}

impl ManifestTool for PipOutdated {
    fn ecosystem(&self) -> &'static str {
        ECOSYSTEM
    }

    fn manifest(&self) -> &'static str {
        "requirements.txt"
    }

    fn invocation(&self) -> ToolInvocation {
        ToolInvocation::new(&self.program, &["list", "--outdated", "--format=json"])
    }

    fn parse(&self, stdout: &str) -> Result<Vec<DependencyFinding>> {
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<PipEntry> =
            serde_json::from_str(stdout).context("pip output is not a JSON array")?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                DependencyFinding::new(ECOSYSTEM, entry.name, entry.version, None, entry.latest_version)
            })
            .collect())
    }

    fn scope(&self, findings: Vec<DependencyFinding>, manifest: &str) -> Vec<DependencyFinding> {
        let declared = requirement_names(manifest);
        findings
            .into_iter()
            .filter(|finding| declared.contains(&normalize_name(&finding.package_name)))
            .collect()
    }
}
