//! In-memory `ClusterClient` double for tests and dry runs.
//!
//! Stores payloads verbatim, bumps a monotonic resource version on every
//! write, records every call, and can be scripted to fail specific
//! operations.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use reka_core::{ObservedResource, ResourceId};

use crate::{ClusterClient, ClusterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Get,
    Create,
    Update,
    Delete,
}

impl MockOp {
    pub fn is_mutating(&self) -> bool {
        !matches!(self, MockOp::Get)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub op: MockOp,
    pub id: ResourceId,
}

#[derive(Debug, Clone)]
struct StoredObject {
    spec: Json,
    resource_version: u64,
}

#[derive(Debug)]
struct Failure {
    op: MockOp,
    id: ResourceId,
    err: ClusterError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct MockState {
    objects: FxHashMap<ResourceId, StoredObject>,
    rv_seq: u64,
    calls: Vec<MockCall>,
    failures: Vec<Failure>,
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Place an object into the cluster without recording a call.
    pub fn seed(&self, id: ResourceId, spec: Json) {
        let mut state = self.lock();
        state.rv_seq += 1;
        let rv = state.rv_seq;
        state.objects.insert(id, StoredObject { spec, resource_version: rv });
    }

    /// Fail the next `times` matching calls with `err`.
    pub fn fail_times(&self, op: MockOp, id: ResourceId, err: ClusterError, times: u32) {
        self.lock().failures.push(Failure { op, id, err, remaining: Some(times) });
    }

    pub fn fail_once(&self, op: MockOp, id: ResourceId, err: ClusterError) {
        self.fail_times(op, id, err, 1);
    }

    /// Fail every matching call with `err`.
    pub fn fail_always(&self, op: MockOp, id: ResourceId, err: ClusterError) {
        self.lock().failures.push(Failure { op, id, err, remaining: None });
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Calls that would have written to a real cluster.
    pub fn mutation_count(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.op.is_mutating()).count()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.lock().objects.contains_key(id)
    }

    pub fn stored_spec(&self, id: &ResourceId) -> Option<Json> {
        self.lock().objects.get(id).map(|o| o.spec.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Record the call and pop a scripted failure when one matches.
    fn enter(&self, op: MockOp, id: &ResourceId) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.calls.push(MockCall { op, id: id.clone() });
        let matched = state
            .failures
            .iter()
            .position(|f| f.op == op && &f.id == id && f.remaining != Some(0));
        if let Some(pos) = matched {
            let err = state.failures[pos].err.clone();
            if let Some(n) = state.failures[pos].remaining.as_mut() {
                *n -= 1;
            }
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedResource>, ClusterError> {
        self.enter(MockOp::Get, id)?;
        let state = self.lock();
        Ok(state.objects.get(id).map(|o| ObservedResource {
            id: id.clone(),
            resource_version: o.resource_version.to_string(),
            spec: o.spec.clone(),
        }))
    }

    async fn create(&self, id: &ResourceId, spec: &Json) -> Result<String, ClusterError> {
        self.enter(MockOp::Create, id)?;
        let mut state = self.lock();
        if state.objects.contains_key(id) {
            return Err(ClusterError::Conflict(format!("{id} already exists")));
        }
        state.rv_seq += 1;
        let rv = state.rv_seq;
        state.objects.insert(id.clone(), StoredObject { spec: spec.clone(), resource_version: rv });
        Ok(rv.to_string())
    }

    async fn update(&self, id: &ResourceId, spec: &Json) -> Result<String, ClusterError> {
        self.enter(MockOp::Update, id)?;
        let mut state = self.lock();
        if !state.objects.contains_key(id) {
            return Err(ClusterError::NotFound(format!("{id} not found")));
        }
        state.rv_seq += 1;
        let rv = state.rv_seq;
        state.objects.insert(id.clone(), StoredObject { spec: spec.clone(), resource_version: rv });
        Ok(rv.to_string())
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        self.enter(MockOp::Delete, id)?;
        let mut state = self.lock();
        if state.objects.remove(id).is_none() {
            return Err(ClusterError::NotFound(format!("{id} not found")));
        }
        Ok(())
    }
}
