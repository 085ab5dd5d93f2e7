//! Reka public API façade (in-process).
//!
//! This crate defines the types frontends (CLI) depend on. The `Provisioner`
//! is the one entry point: it validates a batch of intents, plans against
//! live cluster state, executes the plan, and reports per-resource outcomes
//! with a run summary. Implementations stay in-process today; the report and
//! error types are serializable so the surface can move over RPC later.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use reka_apply::{Applier, ApplyError, ApplyOptions};
use reka_reconcile::{ReconcileError, Reconciler};
use reka_store::IntentStore;

pub use reka_apply::DEFAULT_WORKERS; // Re-export the executor default
pub use reka_cluster::{ClusterClient, ClusterError, KubeClusterClient, MockCluster, RetryPolicy};
pub use reka_core::prelude::*; // Re-export the intent/plan/result model

/// Overall verdict for one submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failure,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Outcome counts for one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn tally(results: &[ApplyResult]) -> Self {
        let mut summary = Self::default();
        for r in results {
            match r.outcome {
                ApplyOutcome::Applied => summary.applied += 1,
                ApplyOutcome::Skipped => summary.skipped += 1,
                ApplyOutcome::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.failed
    }

    /// Success with zero failures (an empty run converged trivially),
    /// failure when nothing succeeded, partial in between.
    pub fn status(&self) -> RunStatus {
        if self.failed == 0 {
            RunStatus::Success
        } else if self.failed == self.total() {
            RunStatus::Failure
        } else {
            RunStatus::Partial
        }
    }
}

/// Everything a frontend needs to render the outcome of one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub plan: Plan,
    pub results: Vec<ApplyResult>,
    pub summary: RunSummary,
}

impl ProvisionReport {
    pub fn status(&self) -> RunStatus {
        self.summary.status()
    }
}

/// Errors that fail a whole submission, as opposed to per-resource outcomes
/// reported in the results.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("invalid intent: {0}")]
    InvalidIntent(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("cluster: {0}")]
    Cluster(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

impl From<InvalidIntent> for ProvisionError {
    fn from(e: InvalidIntent) -> Self {
        ProvisionError::InvalidIntent(format!("{}: {}", e.id, e.reason))
    }
}

impl From<ReconcileError> for ProvisionError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Cluster(ClusterError::Auth(msg)) => ProvisionError::Auth(msg),
            ReconcileError::Cluster(e) => ProvisionError::Cluster(e.to_string()),
        }
    }
}

impl From<ApplyError> for ProvisionError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Auth(ClusterError::Auth(msg)) => ProvisionError::Auth(msg),
            ApplyError::Auth(other) => ProvisionError::Auth(other.to_string()),
            other => ProvisionError::Internal(other.to_string()),
        }
    }
}

/// In-process provisioning facade: staging, reconciliation, and execution
/// behind one call.
pub struct Provisioner {
    cluster: Arc<dyn ClusterClient>,
    reconciler: Reconciler,
    apply_opts: ApplyOptions,
}

impl Provisioner {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            reconciler: Reconciler::new(),
            apply_opts: ApplyOptions::default(),
        }
    }

    /// Cap on concurrently executing plan entries.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.apply_opts.workers = workers.max(1);
        self
    }

    /// Backoff policy shared by observation and execution.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.reconciler = self.reconciler.with_retry(retry.clone());
        self.apply_opts.retry = retry;
        self
    }

    /// Validate and stage the batch, then plan against live state. Nothing
    /// is written.
    pub async fn plan(&self, intents: Vec<ResourceIntent>) -> ProvisionResult<Plan> {
        let t0 = Instant::now();
        info!(intents = intents.len(), "api: plan start");
        let staged = stage(intents)?;
        let plan = self.reconciler.reconcile(&staged, self.cluster.as_ref()).await?;
        info!(entries = plan.len(), mutating = plan.mutating_len(), took_ms = %t0.elapsed().as_millis(), "api: plan ok");
        Ok(plan)
    }

    /// Validate, plan, and execute a batch of intents.
    ///
    /// Per-resource failures land in the report. Only structural rejection
    /// of the batch, a failed reconcile pass, and authorization failures
    /// fail the call itself.
    pub async fn submit_intents(
        &self,
        intents: Vec<ResourceIntent>,
    ) -> ProvisionResult<ProvisionReport> {
        self.submit_intents_with_cancel(intents, &CancellationToken::new()).await
    }

    /// Same as `submit_intents`, stopping early when `cancel` fires:
    /// unstarted entries are skipped, in-flight attempts finish without
    /// further retries.
    pub async fn submit_intents_with_cancel(
        &self,
        intents: Vec<ResourceIntent>,
        cancel: &CancellationToken,
    ) -> ProvisionResult<ProvisionReport> {
        let t0 = Instant::now();
        info!(intents = intents.len(), "api: submit start");
        let staged = stage(intents)?;
        let plan = self.reconciler.reconcile(&staged, self.cluster.as_ref()).await?;
        let applier = Applier::with_options(self.apply_opts.clone());
        let results = applier.apply(&plan, self.cluster.clone(), cancel).await?;
        let summary = RunSummary::tally(&results);
        info!(
            status = %summary.status(),
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            took_ms = %t0.elapsed().as_millis(),
            "api: submit done"
        );
        Ok(ProvisionReport { plan, results, summary })
    }
}

/// All-or-nothing validation: one bad intent rejects the batch before any
/// cluster traffic. Later intents supersede earlier ones with the same
/// identity.
fn stage(intents: Vec<ResourceIntent>) -> ProvisionResult<Vec<ResourceIntent>> {
    let mut store = IntentStore::with_capacity(intents.len());
    store.submit_all(intents)?;
    Ok(store.snapshot())
}
