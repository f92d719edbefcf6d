//! Ecosystem scanners.
//!
//! A [`Scanner`] inspects a checked-out repository and reports the outdated
//! packages of one ecosystem, or [`ScanOutcome::NotApplicable`]. Scanners never
//! fail the surrounding run: a missing tool, an unexpected exit status or
//! unparseable output is logged and downgraded to `NotApplicable`.
//!
//! Most ecosystems are probed by shelling out to their own freshness command.
//! Those implement [`ManifestTool`] and are wrapped in a [`ToolScanner`], which
//! owns the manifest check, the process invocation and the failure policy.

mod cargo;
mod npm;
mod pip;

pub use cargo::CargoOutdated;
pub use npm::NpmOutdated;
pub use pip::PipOutdated;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::finding::{DependencyFinding, ScanOutcome};

/// Default upper bound for a single freshness command.
pub const DEFAULT_SCANNER_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum number of stderr bytes kept in a failure message.
const STDERR_EXCERPT_LIMIT: usize = 2_000;

/// A probe for one package ecosystem.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Ecosystem name used as the report section key. Must be unique within a scanner set.
    fn ecosystem(&self) -> &str;

    async fn probe(&self, workspace: &Path) -> ScanOutcome;
}

/// Why a scanner could not produce findings. Always recovered into `NotApplicable`.
#[derive(Debug, Error)]
pub enum ScanFailure {
    #[error("`{program}` could not be started")]
    ToolUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with {status}: {stderr}")]
    UnexpectedExit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("`{program}` did not finish within {timeout_secs}s")]
    TimedOut { program: String, timeout_secs: u64 },
    #[error("`{program}` produced unusable output: {reason}")]
    MalformedOutput { program: String, reason: String },
    #[error("could not read {manifest}")]
    UnreadableManifest {
        manifest: String,
        #[source]
        source: std::io::Error,
    },
}

/// A command line to run inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Exit codes that still carry a usable report on stdout.
    pub accepted_exit_codes: Vec<i32>,
}

impl ToolInvocation {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            accepted_exit_codes: vec![0],
        }
    }

    pub fn accepting_exit_codes(mut self, codes: &[i32]) -> Self {
        self.accepted_exit_codes = codes.to_vec();
        self
    }
}

/// An ecosystem whose freshness is reported by a command line tool.
pub trait ManifestTool: Send + Sync + 'static {
    fn ecosystem(&self) -> &'static str;

    /// File whose presence at the workspace root makes this ecosystem applicable.
    fn manifest(&self) -> &'static str;

    fn invocation(&self) -> ToolInvocation;

    /// Turn the tool's stdout into findings, preserving the order the tool reported.
    fn parse(&self, stdout: &str) -> anyhow::Result<Vec<DependencyFinding>>;

    /// Drop findings for packages the manifest does not declare.
    ///
    /// Tools that resolve against the workspace already report only its
    /// packages. Tools that inspect a shared environment override this.
    fn scope(&self, findings: Vec<DependencyFinding>, _manifest: &str) -> Vec<DependencyFinding> {
        findings
    }
}

/// Adapts a [`ManifestTool`] into a [`Scanner`].
pub struct ToolScanner<T> {
    tool: T,
    timeout: Duration,
}

impl<T: ManifestTool> ToolScanner<T> {
    pub fn new(tool: T, timeout: Duration) -> Self {
        Self { tool, timeout }
    }

    async fn scan(&self, workspace: &Path) -> Result<Vec<DependencyFinding>, ScanFailure> {
        let manifest = tokio::fs::read_to_string(workspace.join(self.tool.manifest()))
            .await
            .map_err(|source| ScanFailure::UnreadableManifest {
                manifest: self.tool.manifest().to_string(),
                source,
            })?;

        let invocation = self.tool.invocation();
        let stdout = run_tool(&invocation, workspace, self.timeout).await?;
        let findings = self
            .tool
            .parse(&stdout)
            .map_err(|e| ScanFailure::MalformedOutput {
                program: invocation.program.clone(),
                reason: format!("{:#}", e),
            })?;

        Ok(self.tool.scope(findings, &manifest))
    }
}

#[async_trait]
impl<T: ManifestTool> Scanner for ToolScanner<T> {
    fn ecosystem(&self) -> &str {
        self.tool.ecosystem()
    }

    async fn probe(&self, workspace: &Path) -> ScanOutcome {
        let ecosystem = self.tool.ecosystem();
        let manifest = workspace.join(self.tool.manifest());

        if !tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            debug!("No {} found, {} not applicable", self.tool.manifest(), ecosystem);
            return ScanOutcome::NotApplicable;
        }

        match self.scan(workspace).await {
            Ok(findings) => {
                info!("{} scanner found {} outdated packages", ecosystem, findings.len());
                ScanOutcome::Findings(findings)
            }
            Err(failure) => {
                warn!(
                    "{} scanner failed, treating as not applicable: {}",
                    ecosystem, failure
                );
                ScanOutcome::NotApplicable
            }
        }
    }
}

/// Run `invocation` in `workspace` and return its stdout.
pub async fn run_tool(
    invocation: &ToolInvocation,
    workspace: &Path,
    timeout: Duration,
) -> Result<String, ScanFailure> {
    let program = invocation.program.clone();

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    debug!("Running {} {:?} in {}", program, invocation.args, workspace.display());

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Err(_) => {
            return Err(ScanFailure::TimedOut {
                program,
                timeout_secs: timeout.as_secs(),
            })
        }
        Ok(Err(source)) => return Err(ScanFailure::ToolUnavailable { program, source }),
        Ok(Ok(output)) => output,
    };

    let accepted = output
        .status
        .code()
        .is_some_and(|code| invocation.accepted_exit_codes.contains(&code));
    if !accepted {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let excerpt = match stderr.char_indices().nth(STDERR_EXCERPT_LIMIT) {
            Some((idx, _)) => format!("{}...", &stderr[..idx]),
            None => stderr.to_string(),
        };
        return Err(ScanFailure::UnexpectedExit {
            program,
            status: output.status.to_string(),
            stderr: excerpt,
        });
    }

    String::from_utf8(output.stdout).map_err(|_| ScanFailure::MalformedOutput {
        program,
        reason: "stdout is not valid UTF-8".to_string(),
    })
}

/// The scanners enabled in production, one per supported ecosystem.
pub fn default_scanners(timeout: Duration) -> Vec<Arc<dyn Scanner>> {
    vec![
        Arc::new(ToolScanner::new(NpmOutdated, timeout)),
        Arc::new(ToolScanner::new(PipOutdated::default(), timeout)),
        Arc::new(ToolScanner::new(CargoOutdated, timeout)),
    ]
}

/// Probe every scanner concurrently and key the outcomes by ecosystem.
///
/// The map is ordered by ecosystem name, so the result does not depend on
/// which scanner finished first.
pub async fn scan_all(
    scanners: &[Arc<dyn Scanner>],
    workspace: &Path,
) -> BTreeMap<String, ScanOutcome> {
    let probes = scanners.iter().map(|scanner| async move {
        let outcome = scanner.probe(workspace).await;
        (scanner.ecosystem().to_string(), outcome)
    });

    join_all(probes).await.into_iter().collect()
}
