//! Reka core types: intents, plans, apply results

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

pub mod builders;
pub mod specdiff;

/// Resource kinds the provisioner knows how to manage. Closed set; each kind
/// maps statically to an API group/version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Job,
    Namespace,
    NetworkPolicy,
    Secret,
    Service,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Job => "Job",
            ResourceKind::Namespace => "Namespace",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
        }
    }

    /// Cluster-scoped kinds carry no namespace in their identity.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, ResourceKind::Namespace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity triple for a managed resource. `namespace` is `None` exactly for
/// cluster-scoped kinds. Derived ordering (kind, namespace, name) is the
/// lexical tie-break used by plan ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn namespaced(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self { kind, namespace: None, name: name.into() }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
}

/// A declarative request: make the identified resource look like `spec`, or
/// make it not exist. `spec` is the manifest body minus identity fields
/// (e.g. `{"spec": {...}}` for a Service, `{"type": ..., "data": ...}` for a
/// Secret, `{}` for a Namespace).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceIntent {
    #[serde(flatten)]
    pub id: ResourceId,
    #[serde(default)]
    pub state: DesiredState,
    #[serde(default = "empty_object")]
    pub spec: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ResourceIntent {
    pub fn present(id: ResourceId, spec: serde_json::Value) -> Self {
        Self { id, state: DesiredState::Present, spec }
    }

    pub fn absent(id: ResourceId) -> Self {
        Self { id, state: DesiredState::Absent, spec: empty_object() }
    }

    /// Structural validity only: non-empty name, namespace present exactly
    /// when the kind is namespaced. Spec payloads are opaque here.
    pub fn validate(&self) -> Result<(), InvalidIntent> {
        if self.id.name.trim().is_empty() {
            return Err(InvalidIntent::new(&self.id, "name must not be empty"));
        }
        match (&self.id.namespace, self.id.kind.is_cluster_scoped()) {
            (Some(ns), false) if ns.trim().is_empty() => {
                Err(InvalidIntent::new(&self.id, "namespace must not be empty"))
            }
            (Some(_), false) => Ok(()),
            (None, false) => Err(InvalidIntent::new(
                &self.id,
                "namespaced kind requires a namespace",
            )),
            (None, true) => Ok(()),
            (Some(_), true) => Err(InvalidIntent::new(
                &self.id,
                "cluster-scoped kind must not carry a namespace",
            )),
        }
    }
}

/// Rejected at submission time, before any cluster traffic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid intent {id}: {reason}")]
pub struct InvalidIntent {
    pub id: String,
    pub reason: String,
}

impl InvalidIntent {
    pub fn new(id: &ResourceId, reason: impl Into<String>) -> Self {
        Self { id: id.to_string(), reason: reason.into() }
    }
}

/// Live state for one identity as reported by the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedResource {
    pub id: ResourceId,
    /// Opaque version cookie from the cluster (changes on every write).
    pub resource_version: String,
    pub spec: serde_json::Value,
}

// ---- plan model ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::NoOp => "noop",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Action::NoOp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a plan. `requires` holds indices of prerequisite entries;
/// prerequisites always precede the entry in plan order, so executing
/// entries sequentially in order is safe without consulting the edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanEntry {
    pub action: Action,
    pub id: ResourceId,
    /// Desired payload for create/update; `None` for delete and absent-noop.
    pub target_spec: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub requires: SmallVec<[usize; 4]>,
}

/// Deterministic for a given set of intents and observations.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that would touch the cluster if applied.
    pub fn mutating_len(&self) -> usize {
        self.entries.iter().filter(|e| e.action.is_mutating()).count()
    }
}

// ---- apply model ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped,
    Failed,
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Skipped => "skipped",
            ApplyOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyResult {
    pub id: ResourceId,
    pub outcome: ApplyOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution attempts made for this entry; 0 when it never reached a
    /// worker (plan noop, skipped dependent, cancelled before start).
    pub attempts: u32,
    /// Version cookie after the last successful read or write, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

pub mod prelude {
    pub use super::{
        Action, ApplyOutcome, ApplyResult, DesiredState, InvalidIntent, ObservedResource, Plan,
        PlanEntry, ResourceId, ResourceIntent, ResourceKind,
    };
}
