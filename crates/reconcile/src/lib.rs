//! Reka reconciler: turns desired state plus observations into an ordered
//! action plan.
//!
//! The decision core is pure; the only cluster traffic here is the
//! per-intent observation read. Plans are deterministic for a given set of
//! intents and observations: entries are phase-ordered (namespace creations
//! first, namespace deletions last) with lexical identity order inside a
//! phase, and dependency edges always point backwards in plan order.

#![forbid(unsafe_code)]

use std::time::Instant;

use futures::{StreamExt, TryStreamExt};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use reka_cluster::{ClusterClient, ClusterError, RetryPolicy};
use reka_core::specdiff::{compare_specs, SpecComparison};
use reka_core::{Action, DesiredState, ObservedResource, Plan, PlanEntry, ResourceIntent, ResourceKind};

/// Concurrent observation reads per reconcile pass.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Observation failed after retries. The pass is abandoned: planning
    /// against a partial world view could schedule destructive actions.
    #[error("observing cluster state: {0}")]
    Cluster(#[from] ClusterError),
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    fetch_concurrency: usize,
    retry: RetryPolicy,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self { fetch_concurrency: DEFAULT_FETCH_CONCURRENCY, retry: RetryPolicy::default() }
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_concurrency(mut self, n: usize) -> Self {
        self.fetch_concurrency = n.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Observe every intent's identity and produce the plan. Intents are
    /// expected to be deduplicated (an intent store snapshot).
    pub async fn reconcile(
        &self,
        intents: &[ResourceIntent],
        cluster: &dyn ClusterClient,
    ) -> Result<Plan, ReconcileError> {
        if intents.is_empty() {
            return Ok(Plan::default());
        }
        let started = Instant::now();

        let observed: Vec<Option<ObservedResource>> = futures::stream::iter(intents)
            .map(|intent| self.observe(cluster, intent))
            .buffered(self.fetch_concurrency)
            .try_collect()
            .await?;

        let mut staged: Vec<(u8, PlanEntry)> = intents
            .iter()
            .zip(observed.iter())
            .map(|(intent, obs)| {
                let (action, target_spec) = decide(intent, obs.as_ref());
                let entry = PlanEntry {
                    action,
                    id: intent.id.clone(),
                    target_spec,
                    requires: Default::default(),
                };
                (phase(intent.state, intent.id.kind), entry)
            })
            .collect();
        staged.sort_by(|(pa, ea), (pb, eb)| pa.cmp(pb).then_with(|| ea.id.cmp(&eb.id)));

        let mut entries: Vec<PlanEntry> = staged.into_iter().map(|(_, e)| e).collect();
        link_namespace_edges(&mut entries);

        let plan = Plan { entries };
        let (creates, updates, deletes) = action_counts(&plan);
        counter!("reconcile_runs", 1u64);
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            intents = intents.len(),
            creates, updates, deletes,
            noops = plan.len() - plan.mutating_len(),
            "reconcile complete"
        );
        Ok(plan)
    }

    /// One observation read with the transient-retry loop.
    async fn observe(
        &self,
        cluster: &dyn ClusterClient,
        intent: &ResourceIntent,
    ) -> Result<Option<ObservedResource>, ClusterError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match cluster.get(&intent.id).await {
                Ok(obs) => return Ok(obs),
                Err(e) if e.is_transient() && self.retry.retries_left(attempt) => {
                    warn!(id = %intent.id, attempt, error = %e, "observe failed; retrying");
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Diff policy for one intent against its observation.
fn decide(intent: &ResourceIntent, observed: Option<&ObservedResource>) -> (Action, Option<serde_json::Value>) {
    match (intent.state, observed) {
        (DesiredState::Present, None) => (Action::Create, Some(intent.spec.clone())),
        (DesiredState::Present, Some(obs)) => match compare_specs(&intent.spec, &obs.spec) {
            SpecComparison::Equal => {
                debug!(id = %intent.id, "observed state already matches");
                (Action::NoOp, Some(intent.spec.clone()))
            }
            SpecComparison::Differs => (Action::Update, Some(intent.spec.clone())),
            SpecComparison::Ambiguous => {
                counter!("reconcile_ambiguous_specs", 1u64);
                warn!(id = %intent.id, "spec not structurally comparable; planning conservative update");
                (Action::Update, Some(intent.spec.clone()))
            }
        },
        (DesiredState::Absent, Some(_)) => (Action::Delete, None),
        (DesiredState::Absent, None) => (Action::NoOp, None),
    }
}

/// Plan phases: namespace creations open the run, namespace deletions close
/// it, everything else sits in between (creations before deletions).
fn phase(state: DesiredState, kind: ResourceKind) -> u8 {
    match (state, kind == ResourceKind::Namespace) {
        (DesiredState::Present, true) => 0,
        (DesiredState::Present, false) => 1,
        (DesiredState::Absent, false) => 2,
        (DesiredState::Absent, true) => 3,
    }
}

/// Correctness edges: entries inside a namespace require its present-phase
/// entry; a namespace delete requires every entry inside that namespace.
fn link_namespace_edges(entries: &mut [PlanEntry]) {
    let mut ns_present: FxHashMap<String, usize> = FxHashMap::default();
    let mut ns_delete: FxHashMap<String, usize> = FxHashMap::default();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.id.kind == ResourceKind::Namespace {
            match entry.action {
                Action::Delete => {
                    ns_delete.insert(entry.id.name.clone(), idx);
                }
                // Absent and already gone; nothing to gate on.
                Action::NoOp if entry.target_spec.is_none() => {}
                _ => {
                    ns_present.insert(entry.id.name.clone(), idx);
                }
            }
        }
    }
    for idx in 0..entries.len() {
        let Some(ns) = entries[idx].id.namespace.clone() else { continue };
        if let Some(&gate) = ns_present.get(ns.as_str()) {
            entries[idx].requires.push(gate);
        }
        if let Some(&teardown) = ns_delete.get(ns.as_str()) {
            entries[teardown].requires.push(idx);
        }
    }
}

fn action_counts(plan: &Plan) -> (usize, usize, usize) {
    let mut creates = 0;
    let mut updates = 0;
    let mut deletes = 0;
    for e in &plan.entries {
        match e.action {
            Action::Create => creates += 1,
            Action::Update => updates += 1,
            Action::Delete => deletes += 1,
            Action::NoOp => {}
        }
    }
    (creates, updates, deletes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reka_core::ResourceId;
    use serde_json::json;

    fn intent(kind: ResourceKind, ns: Option<&str>, name: &str, state: DesiredState) -> ResourceIntent {
        ResourceIntent {
            id: ResourceId { kind, namespace: ns.map(String::from), name: name.into() },
            state,
            spec: json!({"spec": {"x": 1}}),
        }
    }

    fn observed(intent: &ResourceIntent, spec: serde_json::Value) -> ObservedResource {
        ObservedResource { id: intent.id.clone(), resource_version: "7".into(), spec }
    }

    #[test]
    fn decide_covers_the_policy_table() {
        let present = intent(ResourceKind::Service, Some("d"), "web", DesiredState::Present);
        assert_eq!(decide(&present, None).0, Action::Create);
        let same = observed(&present, json!({"spec": {"x": 1, "extra": true}}));
        assert_eq!(decide(&present, Some(&same)).0, Action::NoOp);
        let changed = observed(&present, json!({"spec": {"x": 2}}));
        assert_eq!(decide(&present, Some(&changed)).0, Action::Update);

        let absent = intent(ResourceKind::Service, Some("d"), "web", DesiredState::Absent);
        assert_eq!(decide(&absent, None).0, Action::NoOp);
        assert_eq!(decide(&absent, Some(&changed)).0, Action::Delete);
        assert_eq!(decide(&absent, Some(&changed)).1, None);
    }

    #[test]
    fn ambiguous_specs_plan_a_conservative_update() {
        let present = intent(ResourceKind::Secret, Some("d"), "creds", DesiredState::Present);
        let opaque = observed(&present, json!("not an object"));
        assert_eq!(decide(&present, Some(&opaque)).0, Action::Update);
    }

    #[test]
    fn phases_put_namespace_creation_first_and_teardown_last() {
        assert_eq!(phase(DesiredState::Present, ResourceKind::Namespace), 0);
        assert!(phase(DesiredState::Present, ResourceKind::Job) < phase(DesiredState::Absent, ResourceKind::Job));
        assert!(phase(DesiredState::Absent, ResourceKind::Job) < phase(DesiredState::Absent, ResourceKind::Namespace));
    }

    #[test]
    fn vacuous_namespace_noops_gate_nothing() {
        // An absent namespace that is already gone must not become a gate
        // for entries inside it; a converged present namespace still does.
        let mut entries = vec![
            PlanEntry {
                action: Action::NoOp,
                id: ResourceId::cluster(ResourceKind::Namespace, "kept"),
                target_spec: Some(json!({})),
                requires: Default::default(),
            },
            PlanEntry {
                action: Action::Create,
                id: ResourceId::namespaced(ResourceKind::Service, "kept", "web"),
                target_spec: Some(json!({})),
                requires: Default::default(),
            },
            PlanEntry {
                action: Action::NoOp,
                id: ResourceId::namespaced(ResourceKind::Service, "gone", "web"),
                target_spec: None,
                requires: Default::default(),
            },
            PlanEntry {
                action: Action::NoOp,
                id: ResourceId::cluster(ResourceKind::Namespace, "gone"),
                target_spec: None,
                requires: Default::default(),
            },
        ];
        link_namespace_edges(&mut entries);
        assert_eq!(entries[1].requires.as_slice(), &[0]);
        assert!(entries[2].requires.is_empty());
        assert!(entries[3].requires.is_empty());
    }

    #[test]
    fn namespace_edges_point_backwards() {
        let mut entries = vec![
            PlanEntry {
                action: Action::Create,
                id: ResourceId::cluster(ResourceKind::Namespace, "demo"),
                target_spec: Some(json!({})),
                requires: Default::default(),
            },
            PlanEntry {
                action: Action::Create,
                id: ResourceId::namespaced(ResourceKind::Service, "demo", "web"),
                target_spec: Some(json!({})),
                requires: Default::default(),
            },
            PlanEntry {
                action: Action::Delete,
                id: ResourceId::namespaced(ResourceKind::Job, "old", "batch"),
                target_spec: None,
                requires: Default::default(),
            },
            PlanEntry {
                action: Action::Delete,
                id: ResourceId::cluster(ResourceKind::Namespace, "old"),
                target_spec: None,
                requires: Default::default(),
            },
        ];
        link_namespace_edges(&mut entries);
        assert_eq!(entries[1].requires.as_slice(), &[0]);
        assert!(entries[2].requires.is_empty());
        assert_eq!(entries[3].requires.as_slice(), &[2]);
        for (idx, e) in entries.iter().enumerate() {
            assert!(e.requires.iter().all(|&r| r < idx));
        }
    }
}
