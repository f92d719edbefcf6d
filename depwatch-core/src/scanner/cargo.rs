use anyhow::{Context, Result};
use serde::Deserialize;

use super::{ManifestTool, ToolInvocation};
use crate::finding::DependencyFinding;

const ECOSYSTEM: &str = "cargo";

/// cargo-outdated's placeholder for "no such version".
const NO_VERSION: &str = "---";
const REMOVED: &str = "Removed";

/// `cargo outdated` (the cargo-outdated plugin) for projects with a `Cargo.toml`.
pub struct CargoOutdated;

/// One line of output: the report for a single workspace member.
#[derive(Debug, Deserialize)]
struct CrateReport {
    dependencies: Vec<CargoDependency>,
}

#[derive(Debug, Deserialize)]
struct CargoDependency {
    name: String,
    project: String,
    compat: String,
    latest: String,
}

fn known_version(version: String) -> Option<String> {
    match version.as_str() {
        NO_VERSION | REMOVED => None,
        _ => Some(version),
    }
}

impl ManifestTool for CargoOutdated {
    fn ecosystem(&self) -> &'static str {
        ECOSYSTEM
    }

    fn manifest(&self) -> &'static str {
        "Cargo.toml"
    }

    fn invocation(&self) -> ToolInvocation {
        ToolInvocation::new("cargo", &["outdated", "--format", "json", "--root-deps-only"])
    }

    fn parse(&self, stdout: &str) -> Result<Vec<DependencyFinding>> {
        let mut findings = Vec::new();

        for (line_num, line) in stdout.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let report: CrateReport = serde_json::from_str(line)
                .with_context(|| format!("line {} is not a cargo-outdated report", line_num + 1))?;

            for dependency in report.dependencies {
                let Some(latest) = known_version(dependency.latest) else {
                    continue;
                };
                if latest == dependency.project {
                    continue;
                }
                // Workspace members often share dependencies; report each package once.
                if findings
                    .iter()
                    .any(|f: &DependencyFinding| f.package_name == dependency.name)
                {
                    continue;
                }
                findings.push(DependencyFinding::new(
                    ECOSYSTEM,
                    dependency.name,
                    dependency.project,
                    known_version(dependency.compat),
                    latest,
                ));
            }
        }

        Ok(findings)
    }
}
