//! The per-delivery state machine.
//!
//! `Received → Verifying → Authenticating → Scanning → Reporting →
//! Reconciling → Done`, with `Rejected` reachable from `Verifying` and
//! `Failed` from anywhere. A workspace acquired during `Scanning` is released
//! on every path out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::body::Bytes;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn, Instrument};

use crate::auth::{AuthError, TokenSource};
use crate::github::RepositoryName;
use crate::reconciler::{IssueReconciler, Reconciled, ReconciliationError};
use crate::signature::{SignatureVerifier, Verification};
use crate::workspace::{WorkspaceError, WorkspaceManager};
use depwatch_core::{
    scan_all, CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger, Report,
    Sanitizer, Scanner,
};

/// `pull_request` actions that change the code under review.
const AUDITED_PR_ACTIONS: &[&str] = &["opened", "synchronize", "reopened"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Push,
    PullRequest,
    Ping,
    Other(String),
}

impl EventKind {
    pub fn from_header(value: &str) -> Self {
        match value {
            "push" => Self::Push,
            "pull_request" => Self::PullRequest,
            "ping" => Self::Ping,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => f.write_str("push"),
            Self::PullRequest => f.write_str("pull_request"),
            Self::Ping => f.write_str("ping"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Verifying,
    Authenticating,
    Scanning,
    Reporting,
    Reconciling,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Verifying => "verifying",
            Self::Authenticating => "authenticating",
            Self::Scanning => "scanning",
            Self::Reporting => "reporting",
            Self::Reconciling => "reconciling",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// One webhook delivery as it came off the wire.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub delivery_id: Option<String>,
    pub correlation_id: CorrelationId,
    pub signature: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    action: Option<String>,
    #[serde(default)]
    deleted: bool,
    repository: Option<RepositoryPayload>,
    installation: Option<InstallationPayload>,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
    clone_url: String,
}

#[derive(Debug, Deserialize)]
struct InstallationPayload {
    id: u64,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid webhook payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
}

impl PipelineError {
    /// Whether the delivery itself was at fault.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::Payload(_))
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Ignored(String),
    Pong,
    Rejected,
    Reported {
        repository: String,
        outdated: usize,
        reconciled: Reconciled,
    },
    Failed {
        stage: Stage,
        error: PipelineError,
    },
}

impl RunOutcome {
    fn failed(stage: Stage, error: impl Into<PipelineError>) -> Self {
        Self::Failed {
            stage,
            error: error.into(),
        }
    }
}

/// One async mutex per repository full name.
///
/// An entry lives only while some run holds or waits on it; [`RepoLocks::release`]
/// drops it once the last run for that repository is done.
#[derive(Default)]
pub struct RepoLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoLocks {
    pub async fn lock_for(&self, repository: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(repository) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(repository.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Hand back a lock obtained from [`RepoLocks::lock_for`].
    pub async fn release(&self, repository: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.write().await;
        drop(lock);
        // Clones are only taken under the map lock, so the count cannot grow here.
        if locks
            .get(repository)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(repository);
        }
    }
}

/// Validated context for an audit run.
struct AuditTarget {
    repo: RepositoryName,
    clone_url: String,
    installation_id: u64,
}

pub struct EventRouter {
    verifier: SignatureVerifier,
    tokens: Arc<dyn TokenSource>,
    workspaces: WorkspaceManager,
    scanners: Vec<Arc<dyn Scanner>>,
    reconciler: IssueReconciler,
    recording_logger: Option<RecordingLogger>,
    locks: RepoLocks,
}

impl EventRouter {
    pub fn new(
        verifier: SignatureVerifier,
        tokens: Arc<dyn TokenSource>,
        workspaces: WorkspaceManager,
        scanners: Vec<Arc<dyn Scanner>>,
        reconciler: IssueReconciler,
        recording_logger: Option<RecordingLogger>,
    ) -> Self {
        Self {
            verifier,
            tokens,
            workspaces,
            scanners,
            reconciler,
            recording_logger,
            locks: RepoLocks::default(),
        }
    }

    pub async fn handle(&self, event: InboundEvent) -> RunOutcome {
        let span = tracing::info_span!(
            "delivery",
            event = %event.kind,
            delivery = event.delivery_id.as_deref().unwrap_or("-"),
            correlation_id = %event.correlation_id.0
        );
        self.run(event).instrument(span).await
    }

    async fn run(&self, event: InboundEvent) -> RunOutcome {
        info!(stage = %Stage::Received, "Received {} event", event.kind);
        match event.kind {
            EventKind::Push | EventKind::PullRequest => {}
            EventKind::Ping => {
                info!("Received ping");
                return RunOutcome::Pong;
            }
            EventKind::Other(ref name) => {
                info!("Ignoring {} event", name);
                return RunOutcome::Ignored(format!("event type {}", name));
            }
        }

        info!(stage = %Stage::Verifying, "Verifying delivery");
        if self.verifier.verify(&event.body, event.signature.as_deref())
            == Verification::Unauthorized
        {
            warn!("Rejecting delivery with missing or invalid signature");
            return RunOutcome::Rejected;
        }

        let payload: serde_json::Value = match serde_json::from_slice(&event.body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Delivery body is not JSON: {}", e);
                return RunOutcome::failed(
                    Stage::Verifying,
                    PipelineError::Payload(format!("body is not JSON: {}", e)),
                );
            }
        };

        self.record_webhook(&event, &payload);

        let target = match self.audit_target(&event.kind, payload) {
            Ok(Some(target)) => target,
            Ok(None) => {
                return RunOutcome::Ignored(match event.kind {
                    EventKind::PullRequest => "pull request action".to_string(),
                    _ => "branch deletion".to_string(),
                })
            }
            Err(e) => {
                warn!("Rejecting malformed delivery: {}", e);
                return RunOutcome::failed(Stage::Verifying, e);
            }
        };

        let full_name = target.repo.to_string();
        let lock = self.locks.lock_for(&full_name).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.audit(&event.correlation_id, target)
                .instrument(tracing::info_span!("audit", repository = %full_name))
                .await
        };
        self.locks.release(&full_name, lock).await;

        outcome
    }

    /// `Ok(None)` when the event carries nothing worth auditing.
    fn audit_target(
        &self,
        kind: &EventKind,
        payload: serde_json::Value,
    ) -> Result<Option<AuditTarget>, PipelineError> {
        let payload: EventPayload = serde_json::from_value(payload)
            .map_err(|e| PipelineError::Payload(format!("unexpected payload shape: {}", e)))?;

        let repository = payload
            .repository
            .ok_or_else(|| PipelineError::Payload("missing repository".to_string()))?;
        let installation = payload
            .installation
            .ok_or_else(|| PipelineError::Payload("missing installation".to_string()))?;
        let repo = RepositoryName::parse(&repository.full_name).ok_or_else(|| {
            PipelineError::Payload(format!(
                "malformed repository name {:?}",
                repository.full_name
            ))
        })?;

        match kind {
            EventKind::PullRequest => {
                let action = payload.action.as_deref().unwrap_or_default();
                if !AUDITED_PR_ACTIONS.contains(&action) {
                    info!("Ignoring pull_request action {:?}", action);
                    return Ok(None);
                }
            }
            EventKind::Push if payload.deleted => {
                info!("Ignoring push that deletes a ref");
                return Ok(None);
            }
            _ => {}
        }

        Ok(Some(AuditTarget {
            repo,
            clone_url: repository.clone_url,
            installation_id: installation.id,
        }))
    }

    async fn audit(&self, correlation_id: &CorrelationId, target: AuditTarget) -> RunOutcome {
        let cid = Some(correlation_id.0.as_str());
        let repo = &target.repo;

        info!(
            stage = %Stage::Authenticating,
            "Authenticating installation {}", target.installation_id
        );
        let token = match self
            .tokens
            .installation_token(cid, target.installation_id)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(stage = %Stage::Authenticating, "Installation authentication failed: {}", e);
                return RunOutcome::failed(Stage::Authenticating, e);
            }
        };

        info!(stage = %Stage::Scanning, "Acquiring workspace");
        let workspace = match self
            .workspaces
            .acquire(repo, &target.clone_url, &token)
            .await
        {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(stage = %Stage::Scanning, "Failed to acquire workspace for {}: {}", repo, e);
                return RunOutcome::failed(Stage::Scanning, e);
            }
        };

        let outcomes = scan_all(&self.scanners, workspace.path()).await;

        info!(stage = %Stage::Reporting, "Composing report");
        let report = Report::compose(outcomes, Utc::now());
        let outdated = report.outdated_count();

        info!(
            stage = %Stage::Reconciling,
            "Reconciling tracking issue ({} outdated)", outdated
        );
        let reconciled = self.reconciler.reconcile(cid, &token, repo, &report).await;

        // Removal failures are logged inside release and never mask the outcome
        let _ = workspace.release().await;

        match reconciled {
            Ok(reconciled) => {
                info!(
                    stage = %Stage::Done,
                    "Tracking issue #{} {:?}",
                    reconciled.issue.number,
                    reconciled.action
                );
                RunOutcome::Reported {
                    repository: repo.to_string(),
                    outdated,
                    reconciled,
                }
            }
            Err(e) => {
                error!(stage = %Stage::Reconciling, "Reconciliation failed for {}: {}", repo, e);
                RunOutcome::failed(Stage::Reconciling, e)
            }
        }
    }

    fn record_webhook(&self, event: &InboundEvent, payload: &serde_json::Value) {
        let Some(logger) = &self.recording_logger else {
            return;
        };

        let mut recorded = RecordedEvent::now(
            &event.correlation_id.0,
            EventType::WebhookReceived,
            Direction::Request,
            "webhook",
            serde_json::json!({
                "headers": Sanitizer::sanitize_headers(&event.headers),
                "payload": Sanitizer::sanitize_json(payload),
            }),
        )
        .with_metadata("event_type", event.kind.to_string());

        if let Some(delivery_id) = &event.delivery_id {
            recorded = recorded.with_metadata("delivery_id", delivery_id.clone());
        }

        logger.record(recorded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_from_header() {
        assert_eq!(EventKind::from_header("push"), EventKind::Push);
        assert_eq!(EventKind::from_header("pull_request"), EventKind::PullRequest);
        assert_eq!(EventKind::from_header("ping"), EventKind::Ping);
        assert_eq!(
            EventKind::from_header("gollum"),
            EventKind::Other("gollum".to_string())
        );
        assert_eq!(EventKind::from_header("gollum").to_string(), "gollum");
    }

    #[tokio::test]
    async fn test_repo_locks_share_one_mutex_per_repository() {
        let locks = RepoLocks::default();
        let a1 = locks.lock_for("octocat/a").await;
        let a2 = locks.lock_for("octocat/a").await;
        let b = locks.lock_for("octocat/b").await;

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        let _held = a1.lock().await;
        assert!(a2.try_lock().is_err());
        assert!(b.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_repo_lock_entry_is_dropped_after_last_release() {
        let locks = RepoLocks::default();
        let first = locks.lock_for("octocat/a").await;
        let second = locks.lock_for("octocat/a").await;

        locks.release("octocat/a", first).await;
        assert!(locks.locks.read().await.contains_key("octocat/a"));

        locks.release("octocat/a", second).await;
        assert!(locks.locks.read().await.is_empty());

        // A later run gets a fresh, unlocked mutex.
        let again = locks.lock_for("octocat/a").await;
        assert!(again.try_lock().is_ok());
    }

    #[test]
    fn test_only_payload_errors_are_bad_requests() {
        assert!(PipelineError::Payload("missing repository".to_string()).is_bad_request());
        assert!(!PipelineError::Reconciliation(ReconciliationError::List {
            repository: "o/r".to_string(),
            source: anyhow::anyhow!("boom"),
        })
        .is_bad_request());
    }
}
