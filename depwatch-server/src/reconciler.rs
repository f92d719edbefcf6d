use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::auth::InstallationToken;
use crate::github::{CreateIssueRequest, Issue, IssueTracker, RepositoryName};
use depwatch_core::Report;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("failed to list tracking issues in {repository}")]
    List {
        repository: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to create tracking issue in {repository}")]
    Create {
        repository: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to update tracking issue #{number} in {repository}")]
    Update {
        repository: String,
        number: u64,
        #[source]
        source: anyhow::Error,
    },
}

/// The single open issue that carries a repository's report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingIssue {
    pub number: u64,
    pub title: String,
    pub labels: BTreeSet<String>,
    pub body: String,
}

impl From<Issue> for TrackingIssue {
    fn from(issue: Issue) -> Self {
        Self {
            number: issue.number,
            title: issue.title,
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            body: issue.body.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub issue: TrackingIssue,
    pub action: ReconcileAction,
}

/// Keeps at most one open tracking issue per repository, found by title and
/// label, and overwrites its body with the latest report.
pub struct IssueReconciler {
    tracker: Arc<dyn IssueTracker>,
    title: String,
    label: String,
}

impl IssueReconciler {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        title: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            title: title.into(),
            label: label.into(),
        }
    }

    pub async fn reconcile(
        &self,
        correlation_id: Option<&str>,
        token: &InstallationToken,
        repo: &RepositoryName,
        report: &Report,
    ) -> Result<Reconciled, ReconciliationError> {
        let body = report.render(&depwatch_core::service_version());

        let issues = self
            .tracker
            .list_open_issues(correlation_id, token, repo, &self.label)
            .await
            .map_err(|source| ReconciliationError::List {
                repository: repo.to_string(),
                source,
            })?;

        let mut matching: Vec<&Issue> = issues
            .iter()
            .filter(|issue| !issue.is_pull_request() && issue.title == self.title)
            .collect();
        matching.sort_by_key(|issue| issue.number);

        if matching.len() > 1 {
            let duplicates: Vec<u64> = matching[1..].iter().map(|i| i.number).collect();
            warn!(
                "Found {} tracking issues in {}; updating #{} and leaving duplicates {:?}",
                matching.len(),
                repo,
                matching[0].number,
                duplicates
            );
        }

        match matching.first() {
            Some(existing) => {
                let number = existing.number;
                info!("Updating tracking issue #{} in {}", number, repo);
                let updated = self
                    .tracker
                    .update_issue_body(correlation_id, token, repo, number, &body)
                    .await
                    .map_err(|source| ReconciliationError::Update {
                        repository: repo.to_string(),
                        number,
                        source,
                    })?;
                Ok(Reconciled {
                    issue: updated.into(),
                    action: ReconcileAction::Updated,
                })
            }
            None => {
                info!("No tracking issue in {}, creating one", repo);
                let request = CreateIssueRequest {
                    title: self.title.clone(),
                    body,
                    labels: vec![self.label.clone()],
                };
                let created = self
                    .tracker
                    .create_issue(correlation_id, token, repo, &request)
                    .await
                    .map_err(|source| ReconciliationError::Create {
                        repository: repo.to_string(),
                        source,
                    })?;
                Ok(Reconciled {
                    issue: created.into(),
                    action: ReconcileAction::Created,
                })
            }
        }
    }
}
