use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{ManifestTool, ToolInvocation};
use crate::finding::DependencyFinding;

const ECOSYSTEM: &str = "npm";

/// Shown when npm lists a dependency that is declared but not installed.
const NOT_INSTALLED: &str = "not installed";

/// `npm outdated --json` for projects with a `package.json`.
pub struct NpmOutdated;

#[derive(Debug, Deserialize)]
struct NpmEntry {
    current: Option<String>,
    wanted: Option<String>,
    latest: Option<String>,
}

/// Workspace projects report one entry per dependent package.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NpmEntries {
    One(NpmEntry),
    Many(Vec<NpmEntry>),
}

impl ManifestTool for NpmOutdated {
    fn ecosystem(&self) -> &'static str {
        ECOSYSTEM
    }

    fn manifest(&self) -> &'static str {
        "package.json"
    }

    fn invocation(&self) -> ToolInvocation {
        // npm exits with 1 whenever something is outdated.
        ToolInvocation::new("npm", &["outdated", "--json"]).accepting_exit_codes(&[0, 1])
    }

    fn parse(&self, stdout: &str) -> Result<Vec<DependencyFinding>> {
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }

        let report: serde_json::Map<String, Value> =
            serde_json::from_str(stdout).context("npm output is not a JSON object")?;

        // A package may legitimately be called "error"; npm's own error object has a code.
        if let Some(Value::Object(error)) = report.get("error").filter(|e| e.get("code").is_some())
        {
            let summary = error
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("npm reported an error: {}", summary);
        }

        let mut findings = Vec::with_capacity(report.len());
        for (name, value) in report {
            let entries: NpmEntries = serde_json::from_value(value)
                .with_context(|| format!("unexpected entry for {}", name))?;
            let entry = match entries {
                NpmEntries::One(entry) => entry,
                NpmEntries::Many(list) => list
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("empty entry list for {}", name))?,
            };
            let latest = entry
                .latest
                .ok_or_else(|| anyhow!("no latest version for {}", name))?;

            findings.push(DependencyFinding::new(
                ECOSYSTEM,
                name,
                entry.current.unwrap_or_else(|| NOT_INSTALLED.to_string()),
                entry.wanted,
                latest,
            ));
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outdated_report() {
        let stdout = r#"{
            "left-pad": {
                "current": "1.0.0",
                "wanted": "1.0.0",
                "latest": "1.3.0",
                "dependent": "app",
                "location": "node_modules/left-pad"
            }
        }"#;

        let findings = NpmOutdated.parse(stdout).unwrap();

        assert_eq!(
            findings,
            vec![DependencyFinding::new(
                "npm",
                "left-pad",
                "1.0.0",
                Some("1.0.0".to_string()),
                "1.3.0"
            )]
        );
    }

    #[test]
    fn test_parse_preserves_reported_order() {
        let stdout = r#"{
            "zod": {"current": "3.0.0", "wanted": "3.0.0", "latest": "3.22.0"},
            "axios": {"current": "0.21.0", "wanted": "0.21.4", "latest": "1.6.0"},
            "moment": {"current": "2.29.0", "wanted": "2.29.4", "latest": "2.30.1"}
        }"#;

        let names: Vec<String> = NpmOutdated
            .parse(stdout)
            .unwrap()
            .into_iter()
            .map(|f| f.package_name)
            .collect();

        assert_eq!(names, vec!["zod", "axios", "moment"]);
    }

    #[test]
    fn test_parse_empty_output_means_up_to_date() {
        assert!(NpmOutdated.parse("").unwrap().is_empty());
        assert!(NpmOutdated.parse("{}").unwrap().is_empty());
    }

    #[test]
    fn test_parse_missing_install() {
        let stdout = r#"{"left-pad": {"wanted": "1.3.0", "latest": "1.3.0"}}"#;
        let findings = NpmOutdated.parse(stdout).unwrap();
        assert_eq!(findings[0].current_version, "not installed");
    }

    #[test]
    fn test_parse_workspace_entries_takes_first() {
        let stdout = r#"{
            "left-pad": [
                {"current": "1.0.0", "wanted": "1.1.0", "latest": "1.3.0", "dependent": "a"},
                {"current": "1.2.0", "wanted": "1.2.0", "latest": "1.3.0", "dependent": "b"}
            ]
        }"#;
        let findings = NpmOutdated.parse(stdout).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].current_version, "1.0.0");
    }

    #[test]
    fn test_parse_error_object_is_rejected() {
        let stdout = r#"{"error": {"code": "ENOLOCK", "summary": "no lockfile"}}"#;
        let err = NpmOutdated.parse(stdout).unwrap_err();
        assert!(err.to_string().contains("no lockfile"));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(NpmOutdated.parse("[1, 2, 3]").is_err());
        assert!(NpmOutdated.parse("npm WARN something").is_err());
    }
}
