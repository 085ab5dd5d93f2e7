//! Reka applier: executes a plan with bounded workers and bounded retries.
//!
//! Every entry preflights a read before mutating, so applying an
//! already-converged plan writes nothing and re-running a plan is safe even
//! when the world moved between reconcile and apply (a planned create finds
//! the object and updates it instead, and vice versa). Dependency edges gate
//! dependents on their prerequisites; a failed prerequisite skips its
//! transitive dependents without executing them.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value as Json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reka_cluster::{ClusterClient, ClusterError, RetryPolicy};
use reka_core::specdiff::{compare_specs, SpecComparison};
use reka_core::{Action, ApplyOutcome, ApplyResult, Plan, PlanEntry};

/// Concurrent in-flight entries per run.
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { workers: DEFAULT_WORKERS, retry: RetryPolicy::default() }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    /// No further call can be authorized; the run is aborted mid-flight.
    #[error("authorization failed; run aborted")]
    Auth(#[source] ClusterError),
    #[error("apply worker panicked")]
    TaskPanicked(#[source] tokio::task::JoinError),
    #[error("worker pool closed unexpectedly")]
    PoolClosed,
    /// Entries remained blocked with no task left to unblock them. Plans
    /// from the reconciler cannot produce this; hand-built plans with
    /// forward or cyclic edges can.
    #[error("plan execution stalled on unresolved dependencies")]
    Stalled,
}

#[derive(Debug, Default, Clone)]
pub struct Applier {
    opts: ApplyOptions,
}

impl Applier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(opts: ApplyOptions) -> Self {
        Self { opts }
    }

    /// Execute the plan and return one result per entry, in plan order.
    ///
    /// Per-entry failures are isolated to the entry and its transitive
    /// dependents; only an authorization failure aborts the whole run.
    /// Cancellation skips entries that have not started and lets in-flight
    /// attempts finish (an in-flight entry stops retrying).
    pub async fn apply(
        &self,
        plan: &Plan,
        cluster: Arc<dyn ClusterClient>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApplyResult>, ApplyError> {
        let n = plan.entries.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let mut remaining: Vec<usize> = vec![0; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (idx, entry) in plan.entries.iter().enumerate() {
            remaining[idx] = entry.requires.len();
            for &req in &entry.requires {
                // An edge out of range can never resolve.
                if req >= n {
                    return Err(ApplyError::Stalled);
                }
                dependents[req].push(idx);
            }
        }

        let mut results: Vec<Option<ApplyResult>> = vec![None; n];
        let mut launched = vec![false; n];
        let mut unresolved = n;
        let semaphore = Arc::new(Semaphore::new(self.opts.workers.max(1)));
        let mut join_set: JoinSet<(usize, EntryOutcome)> = JoinSet::new();

        loop {
            // Launch everything ready. Reconciler plans keep edges pointing
            // backwards so one ascending scan reaches entries released
            // inline; rescan in case a hand-built plan released a lower
            // index.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for idx in 0..n {
                    if launched[idx] || remaining[idx] > 0 || results[idx].is_some() {
                        continue;
                    }
                    launched[idx] = true;
                    let entry = &plan.entries[idx];
                    if entry.action == Action::NoOp {
                        debug!(id = %entry.id, "noop entry");
                        results[idx] = Some(resolved_without_execution(entry, None));
                        unresolved -= 1;
                        for &d in &dependents[idx] {
                            remaining[d] -= 1;
                        }
                        progressed = true;
                        continue;
                    }
                    if cancel.is_cancelled() {
                        results[idx] = Some(resolved_without_execution(
                            entry,
                            Some("cancelled before start".to_string()),
                        ));
                        unresolved -= 1;
                        for &d in &dependents[idx] {
                            remaining[d] -= 1;
                        }
                        progressed = true;
                        continue;
                    }
                    let entry = entry.clone();
                    let cluster = cluster.clone();
                    let retry = self.opts.retry.clone();
                    let cancel = cancel.clone();
                    let sem = semaphore.clone();
                    join_set.spawn(async move {
                        let _permit = match sem.acquire().await {
                            Ok(permit) => permit,
                            Err(_) => return (idx, EntryOutcome::PoolClosed),
                        };
                        // The token may have fired while this entry waited
                        // for a worker; it has not started yet.
                        if cancel.is_cancelled() {
                            let result = resolved_without_execution(
                                &entry,
                                Some("cancelled before start".to_string()),
                            );
                            return (idx, EntryOutcome::Done(result));
                        }
                        (idx, execute_entry(&entry, cluster.as_ref(), &retry, &cancel).await)
                    });
                }
            }

            if unresolved == 0 {
                break;
            }
            let Some(joined) = join_set.join_next().await else {
                return Err(ApplyError::Stalled);
            };
            let (idx, outcome) = joined.map_err(ApplyError::TaskPanicked)?;
            match outcome {
                EntryOutcome::PoolClosed => return Err(ApplyError::PoolClosed),
                EntryOutcome::Fatal(e) => {
                    warn!(id = %plan.entries[idx].id, error = %e, "fatal error; aborting run");
                    join_set.abort_all();
                    return Err(ApplyError::Auth(e));
                }
                EntryOutcome::Done(result) => {
                    let failed = result.outcome == ApplyOutcome::Failed;
                    results[idx] = Some(result);
                    unresolved -= 1;
                    if failed {
                        skip_dependents(idx, &dependents, &plan.entries, &mut results, &mut launched, &mut unresolved);
                    } else {
                        for &d in &dependents[idx] {
                            remaining[d] -= 1;
                        }
                    }
                }
            }
        }

        let results: Vec<ApplyResult> = results.into_iter().flatten().collect();
        if results.len() != n {
            return Err(ApplyError::Stalled);
        }
        let applied = results.iter().filter(|r| r.outcome == ApplyOutcome::Applied).count();
        let failed = results.iter().filter(|r| r.outcome == ApplyOutcome::Failed).count();
        histogram!("apply_run_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            entries = n,
            applied,
            skipped = n - applied - failed,
            failed,
            "apply complete"
        );
        Ok(results)
    }
}

enum EntryOutcome {
    Done(ApplyResult),
    /// Authorization failure: surfaced to the scheduler to abort the run.
    Fatal(ClusterError),
    PoolClosed,
}

/// Mark every transitive dependent of a failed entry as skipped. None of
/// them can have started: an entry launches only after all its
/// prerequisites resolved successfully.
fn skip_dependents(
    root: usize,
    dependents: &[Vec<usize>],
    entries: &[PlanEntry],
    results: &mut [Option<ApplyResult>],
    launched: &mut [bool],
    unresolved: &mut usize,
) {
    let cause = entries[root].id.to_string();
    let mut stack: Vec<usize> = dependents[root].to_vec();
    while let Some(idx) = stack.pop() {
        if results[idx].is_some() {
            continue;
        }
        warn!(id = %entries[idx].id, cause = %cause, "skipping dependent of failed entry");
        results[idx] = Some(resolved_without_execution(
            &entries[idx],
            Some(format!("prerequisite {cause} failed")),
        ));
        launched[idx] = true;
        *unresolved -= 1;
        stack.extend(dependents[idx].iter().copied());
    }
}

fn resolved_without_execution(entry: &PlanEntry, error: Option<String>) -> ApplyResult {
    ApplyResult {
        id: entry.id.clone(),
        outcome: ApplyOutcome::Skipped,
        error,
        attempts: 0,
        resource_version: None,
    }
}

/// Run one entry to completion: preflight read, mutate, retry transient
/// failures with backoff until the budget is spent. Cancellation is checked
/// between attempts; the current attempt always finishes.
async fn execute_entry(
    entry: &PlanEntry,
    cluster: &dyn ClusterClient,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> EntryOutcome {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        counter!("apply_attempts", 1u64);
        match try_entry(entry, cluster).await {
            Ok(step) => {
                histogram!("apply_entry_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
                match step.outcome {
                    ApplyOutcome::Applied => counter!("apply_ok", 1u64),
                    _ => counter!("apply_skipped", 1u64),
                }
                return EntryOutcome::Done(ApplyResult {
                    id: entry.id.clone(),
                    outcome: step.outcome,
                    error: None,
                    attempts,
                    resource_version: step.resource_version,
                });
            }
            Err(e) if e.is_fatal() => return EntryOutcome::Fatal(e),
            Err(e) if e.is_transient() && retry.retries_left(attempts) => {
                counter!("apply_retries", 1u64);
                let delay = retry.delay_for(attempts);
                warn!(id = %entry.id, attempt = attempts, delay_ms = delay.as_millis() as u64, error = %e, "attempt failed; backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        counter!("apply_err", 1u64);
                        return EntryOutcome::Done(ApplyResult {
                            id: entry.id.clone(),
                            outcome: ApplyOutcome::Failed,
                            error: Some(format!("cancelled during retry backoff: {e}")),
                            attempts,
                            resource_version: None,
                        });
                    }
                }
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(id = %entry.id, attempts, error = %e, "entry failed");
                return EntryOutcome::Done(ApplyResult {
                    id: entry.id.clone(),
                    outcome: ApplyOutcome::Failed,
                    error: Some(e.to_string()),
                    attempts,
                    resource_version: None,
                });
            }
        }
    }
}

struct StepOutcome {
    outcome: ApplyOutcome,
    resource_version: Option<String>,
}

/// One attempt. The preflight read decides the actual verb, which keeps
/// re-applies quiet and converges when the cluster drifted after planning.
async fn try_entry(entry: &PlanEntry, cluster: &dyn ClusterClient) -> Result<StepOutcome, ClusterError> {
    match entry.action {
        Action::Create | Action::Update => {
            let Some(target) = entry.target_spec.as_ref() else {
                return Err(ClusterError::BadRequest(format!(
                    "plan entry for {} carries no target spec",
                    entry.id
                )));
            };
            apply_target(entry, target, cluster).await
        }
        Action::Delete => match cluster.get(&entry.id).await? {
            None => {
                debug!(id = %entry.id, "already absent");
                Ok(StepOutcome { outcome: ApplyOutcome::Skipped, resource_version: None })
            }
            Some(_) => match cluster.delete(&entry.id).await {
                Ok(()) => Ok(StepOutcome { outcome: ApplyOutcome::Applied, resource_version: None }),
                // Vanished between the read and the delete.
                Err(ClusterError::NotFound(_)) => {
                    debug!(id = %entry.id, "deleted concurrently");
                    Ok(StepOutcome { outcome: ApplyOutcome::Skipped, resource_version: None })
                }
                Err(e) => Err(e),
            },
        },
        Action::NoOp => Ok(StepOutcome { outcome: ApplyOutcome::Skipped, resource_version: None }),
    }
}

async fn apply_target(
    entry: &PlanEntry,
    target: &Json,
    cluster: &dyn ClusterClient,
) -> Result<StepOutcome, ClusterError> {
    match cluster.get(&entry.id).await? {
        None => {
            let rv = cluster.create(&entry.id, target).await?;
            Ok(StepOutcome { outcome: ApplyOutcome::Applied, resource_version: Some(rv) })
        }
        Some(observed) => match compare_specs(target, &observed.spec) {
            SpecComparison::Equal => {
                debug!(id = %entry.id, "already in desired state");
                Ok(StepOutcome {
                    outcome: ApplyOutcome::Skipped,
                    resource_version: Some(observed.resource_version),
                })
            }
            SpecComparison::Differs | SpecComparison::Ambiguous => {
                let rv = cluster.update(&entry.id, target).await?;
                Ok(StepOutcome { outcome: ApplyOutcome::Applied, resource_version: Some(rv) })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reka_core::{ResourceId, ResourceKind};

    fn entry(name: &str, requires: &[usize]) -> PlanEntry {
        PlanEntry {
            action: Action::Create,
            id: ResourceId::namespaced(ResourceKind::Service, "demo", name),
            target_spec: Some(serde_json::json!({})),
            requires: requires.iter().copied().collect(),
        }
    }

    #[test]
    fn skip_dependents_walks_transitively() {
        let entries = vec![entry("a", &[]), entry("b", &[0]), entry("c", &[1]), entry("d", &[])];
        let dependents = vec![vec![1], vec![2], vec![], vec![]];
        let mut results: Vec<Option<ApplyResult>> = vec![None; 4];
        let mut launched = vec![true, false, false, false];
        let mut unresolved = 3;

        skip_dependents(0, &dependents, &entries, &mut results, &mut launched, &mut unresolved);

        assert_eq!(unresolved, 1);
        for idx in [1usize, 2] {
            let r = results[idx].as_ref().unwrap();
            assert_eq!(r.outcome, ApplyOutcome::Skipped);
            assert_eq!(r.attempts, 0);
            assert!(r.error.as_deref().unwrap().contains("Service/demo/a"));
            assert!(launched[idx]);
        }
        assert!(results[3].is_none());
    }

    #[test]
    fn skip_dependents_leaves_resolved_entries_alone() {
        let entries = vec![entry("a", &[]), entry("b", &[0])];
        let dependents = vec![vec![1], vec![]];
        let mut results: Vec<Option<ApplyResult>> = vec![None, Some(resolved_without_execution(&entries[1], None))];
        let mut launched = vec![true, true];
        let mut unresolved = 1;

        skip_dependents(0, &dependents, &entries, &mut results, &mut launched, &mut unresolved);

        assert_eq!(unresolved, 1);
        assert!(results[1].as_ref().unwrap().error.is_none());
    }
}
