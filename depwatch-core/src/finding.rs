use serde::{Deserialize, Serialize};

/// One outdated package reported by an ecosystem's freshness tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyFinding {
    pub ecosystem: String,
    pub package_name: String,
    pub current_version: String,
    /// Highest version satisfying the manifest's constraint, when the tool knows it.
    pub wanted_version: Option<String>,
    pub latest_version: String,
}

impl DependencyFinding {
    pub fn new(
        ecosystem: impl Into<String>,
        package_name: impl Into<String>,
        current_version: impl Into<String>,
        wanted_version: Option<String>,
        latest_version: impl Into<String>,
    ) -> Self {
        Self {
            ecosystem: ecosystem.into(),
            package_name: package_name.into(),
            current_version: current_version.into(),
            wanted_version,
            latest_version: latest_version.into(),
        }
    }
}

/// Result of probing one ecosystem in a workspace.
///
/// `NotApplicable` covers both "no manifest here" and "the tool could not
/// give a usable answer"; the latter is logged by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOutcome {
    Findings(Vec<DependencyFinding>),
    NotApplicable,
}

impl ScanOutcome {
    pub fn findings(&self) -> &[DependencyFinding] {
        match self {
            Self::Findings(findings) => findings,
            Self::NotApplicable => &[],
        }
    }

    pub fn is_applicable(&self) -> bool {
        matches!(self, Self::Findings(_))
    }
}
