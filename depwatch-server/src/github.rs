use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::auth::InstallationToken;
use crate::recording::RecordingMiddleware;
use depwatch_core::{RecordingLogger, CORRELATION_ID_HEADER};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ISSUES_PER_PAGE: usize = 100;

/// `owner/name` of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryName {
    pub owner: String,
    pub name: String,
}

impl RepositoryName {
    /// Parse a `full_name` such as `octocat/hello-world`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    /// Present when the "issue" is really a pull request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<serde_json::Value>,
}

impl Issue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateIssueRequest {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UpdateIssueRequest<'a> {
    body: &'a str,
}

/// The issue operations the reconciler needs from the hosting platform.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// All open issues carrying `label`, pull requests excluded.
    async fn list_open_issues(
        &self,
        correlation_id: Option<&str>,
        token: &InstallationToken,
        repo: &RepositoryName,
        label: &str,
    ) -> Result<Vec<Issue>>;

    async fn create_issue(
        &self,
        correlation_id: Option<&str>,
        token: &InstallationToken,
        repo: &RepositoryName,
        request: &CreateIssueRequest,
    ) -> Result<Issue>;

    async fn update_issue_body(
        &self,
        correlation_id: Option<&str>,
        token: &InstallationToken,
        repo: &RepositoryName,
        issue_number: u64,
        body: &str,
    ) -> Result<Issue>;
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_url: String,
}

impl GitHubClient {
    pub fn new(client: ClientWithMiddleware, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    fn with_headers(
        &self,
        request_builder: RequestBuilder,
        correlation_id: Option<&str>,
        token: &InstallationToken,
    ) -> RequestBuilder {
        let request_builder = request_builder
            .header("Authorization", token.bearer())
            .header("Accept", "application/vnd.github+json");

        match correlation_id {
            Some(cid) => request_builder.header(CORRELATION_ID_HEADER, cid),
            None => request_builder,
        }
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        request_builder: RequestBuilder,
        operation: &str,
    ) -> Result<T> {
        let response = request_builder
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", operation))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error {}: {} - {}", operation, status, error_text);
            return Err(anyhow!(
                "GitHub API error {}: {} - {}",
                operation,
                status,
                error_text
            ));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", operation))
    }
}

#[async_trait]
impl IssueTracker for GitHubClient {
    async fn list_open_issues(
        &self,
        correlation_id: Option<&str>,
        token: &InstallationToken,
        repo: &RepositoryName,
        label: &str,
    ) -> Result<Vec<Issue>> {
        let mut all_issues = Vec::new();
        let mut page = 1;

        info!("Listing open issues labelled {:?} in {}", label, repo);

        loop {
            let url = format!(
                "{}/repos/{}/{}/issues",
                self.api_url, repo.owner, repo.name
            );
            let per_page = ISSUES_PER_PAGE.to_string();
            let page_str = page.to_string();
            let request_builder = self.with_headers(
                self.client.get(&url).query(&[
                    ("state", "open"),
                    ("labels", label),
                    ("per_page", per_page.as_str()),
                    ("page", page_str.as_str()),
                ]),
                correlation_id,
                token,
            );

            let issues: Vec<Issue> = Self::send_json(request_builder, "listing issues").await?;
            let count = issues.len();
            all_issues.extend(issues.into_iter().filter(|issue| !issue.is_pull_request()));

            // A short page is the last page
            if count < ISSUES_PER_PAGE {
                break;
            }
            page += 1;
        }

        info!("Found {} open labelled issues in {}", all_issues.len(), repo);
        Ok(all_issues)
    }

    async fn create_issue(
        &self,
        correlation_id: Option<&str>,
        token: &InstallationToken,
        repo: &RepositoryName,
        request: &CreateIssueRequest,
    ) -> Result<Issue> {
        let url = format!(
            "{}/repos/{}/{}/issues",
            self.api_url, repo.owner, repo.name
        );

        info!("Creating issue {:?} in {}", request.title, repo);

        let request_builder = self.with_headers(
            self.client
                .post(&url)
                .body(serde_json::to_string(request)?)
                .header("Content-Type", "application/json"),
            correlation_id,
            token,
        );

        let issue: Issue = Self::send_json(request_builder, "creating issue").await?;
        info!("Created issue #{} in {}", issue.number, repo);
        Ok(issue)
    }

    async fn update_issue_body(
        &self,
        correlation_id: Option<&str>,
        token: &InstallationToken,
        repo: &RepositoryName,
        issue_number: u64,
        body: &str,
    ) -> Result<Issue> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}",
            self.api_url, repo.owner, repo.name, issue_number
        );

        info!("Updating body of issue #{} in {}", issue_number, repo);

        let request_builder = self.with_headers(
            self.client
                .patch(&url)
                .body(serde_json::to_string(&UpdateIssueRequest { body })?)
                .header("Content-Type", "application/json"),
            correlation_id,
            token,
        );

        let issue: Issue = Self::send_json(request_builder, "updating issue").await?;
        info!("Updated issue #{} in {}", issue.number, repo);
        Ok(issue)
    }
}

/// HTTP client shared by the authenticator and the issue client.
pub fn create_github_client(
    recording_logger: Option<RecordingLogger>,
) -> Result<ClientWithMiddleware> {
    use reqwest_middleware::ClientBuilder;

    let client = Client::builder()
        .user_agent(format!("depwatch/{}", depwatch_core::service_version()))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")?;

    let mut builder = ClientBuilder::new(client);

    if let Some(logger) = recording_logger {
        builder = builder.with(RecordingMiddleware::new(logger));
    }

    Ok(builder.build())
}
