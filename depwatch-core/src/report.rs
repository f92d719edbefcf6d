//! Report composition and rendering.
//!
//! A [`Report`] is a pure function of the scanner outcomes: ecosystems are
//! kept in a `BTreeMap`, so sections always render in ecosystem-name order no
//! matter which scanner finished first, while findings inside a section keep
//! the order their tool reported them in. Every ecosystem gets a section, even
//! when it has nothing to say, so the issue body keeps the same shape from run
//! to run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::finding::{DependencyFinding, ScanOutcome};

/// Hidden first line of every rendered report.
pub const REPORT_MARKER: &str = "<!-- depwatch-report -->";

pub const REPORT_HEADING: &str = "Outdated Dependencies Report";

const NOT_APPLICABLE_LINE: &str = "No manifest found; not applicable.";
const UP_TO_DATE_LINE: &str = "All packages are up to date.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub findings_by_ecosystem: BTreeMap<String, ScanOutcome>,
}

impl Report {
    pub fn compose(
        outcomes: impl IntoIterator<Item = (String, ScanOutcome)>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            generated_at,
            findings_by_ecosystem: outcomes.into_iter().collect(),
        }
    }

    pub fn outdated_count(&self) -> usize {
        self.findings_by_ecosystem
            .values()
            .map(|outcome| outcome.findings().len())
            .sum()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.outdated_count() == 0
    }

    /// Render the report as the markdown body of the tracking issue.
    pub fn render(&self, version: &str) -> String {
        let mut body = String::new();

        body.push_str(REPORT_MARKER);
        body.push('\n');
        body.push_str(&format!("# {}\n\n", REPORT_HEADING));
        body.push_str(&format!(
            "Generated at {}.\n\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));

        let outdated = self.outdated_count();
        if outdated == 0 {
            body.push_str("All checked dependencies are up to date.\n");
        } else {
            let plural = if outdated == 1 { "" } else { "s" };
            body.push_str(&format!("**{} outdated package{}** found.\n", outdated, plural));
        }

        for (ecosystem, outcome) in &self.findings_by_ecosystem {
            body.push_str(&format!("\n## {}\n\n", ecosystem));
            match outcome {
                ScanOutcome::NotApplicable => {
                    body.push_str(NOT_APPLICABLE_LINE);
                    body.push('\n');
                }
                ScanOutcome::Findings(findings) if findings.is_empty() => {
                    body.push_str(UP_TO_DATE_LINE);
                    body.push('\n');
                }
                ScanOutcome::Findings(findings) => render_table(&mut body, findings),
            }
        }

        body.push_str(&format!("\n---\n_Generated by depwatch {}._\n", version));
        body
    }
}

fn render_table(body: &mut String, findings: &[DependencyFinding]) {
    body.push_str("| Package | Current | Wanted | Latest |\n");
    body.push_str("|---|---|---|---|\n");
    for finding in findings {
        body.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            escape_cell(&finding.package_name),
            escape_cell(&finding.current_version),
            finding.wanted_version.as_deref().map_or("-".to_string(), escape_cell),
            escape_cell(&finding.latest_version),
        ));
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
