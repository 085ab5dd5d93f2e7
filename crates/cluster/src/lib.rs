//! Reka cluster capability: the boundary between planning and the
//! orchestration API.
//!
//! Everything that talks to a cluster goes through the [`ClusterClient`]
//! trait. The kube-backed implementation maps the closed kind set onto
//! typed API resources and folds transport/API failures into the error
//! taxonomy the planner and applier act on.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, info};

use reka_core::{ObservedResource, ResourceId, ResourceKind};

pub mod auth;
pub mod mock;
pub mod retry;

pub use auth::{BearerToken, ClusterEndpoint, StaticTokenProvider, TokenProvider};
pub use mock::{MockCall, MockCluster, MockOp};
pub use retry::RetryPolicy;

/// Failure classes for cluster calls. `Conflict` and `Transient` are worth
/// retrying; `Auth` is fatal for the whole run; the rest fail the operation
/// that hit them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("transient cluster error: {0}")]
    Transient(String),
}

impl ClusterError {
    /// Retrying can help: throttling, server errors, timeouts, and write
    /// conflicts (the retry re-reads before writing again).
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Conflict(_) | ClusterError::Transient(_))
    }

    /// No further call can succeed; abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::Auth(_))
    }
}

/// Narrow capability for reading and mutating single resources. Components
/// receive exactly this; nothing reaches for ambient client state.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Observed state for one identity; `None` when the resource does not
    /// exist (a plain miss, not an error).
    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedResource>, ClusterError>;

    /// Create the resource from a spec payload. Returns the new resource
    /// version.
    async fn create(&self, id: &ResourceId, spec: &Json) -> Result<String, ClusterError>;

    /// Overwrite the desired fields of an existing resource. Returns the
    /// new resource version.
    async fn update(&self, id: &ResourceId, spec: &Json) -> Result<String, ClusterError>;

    /// Request deletion. Deleting a missing resource reports `NotFound`.
    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError>;
}

/// Static kind table: the managed set is closed, so no discovery round-trip
/// is needed.
pub fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Job => ApiResource::erase::<k8s_openapi::api::batch::v1::Job>(&()),
        ResourceKind::Namespace => ApiResource::erase::<k8s_openapi::api::core::v1::Namespace>(&()),
        ResourceKind::NetworkPolicy => {
            ApiResource::erase::<k8s_openapi::api::networking::v1::NetworkPolicy>(&())
        }
        ResourceKind::Secret => ApiResource::erase::<k8s_openapi::api::core::v1::Secret>(&()),
        ResourceKind::Service => ApiResource::erase::<k8s_openapi::api::core::v1::Service>(&()),
    }
}

/// Keys owned by the provisioner or the server; spec payloads never supply
/// them.
const RESERVED_KEYS: &[&str] = &["apiVersion", "kind", "metadata", "status"];

/// Assemble a full manifest from an identity and a spec payload.
fn manifest_for(id: &ResourceId, spec: &Json) -> Result<Json, ClusterError> {
    let Some(fields) = spec.as_object() else {
        return Err(ClusterError::BadRequest(format!(
            "spec payload for {id} must be a JSON object"
        )));
    };
    let ar = api_resource(id.kind);
    let mut metadata = serde_json::Map::new();
    metadata.insert("name".into(), Json::String(id.name.clone()));
    if let Some(ns) = &id.namespace {
        metadata.insert("namespace".into(), Json::String(ns.clone()));
    }
    let mut root = serde_json::Map::new();
    root.insert("apiVersion".into(), Json::String(ar.api_version.clone()));
    root.insert("kind".into(), Json::String(ar.kind.clone()));
    root.insert("metadata".into(), Json::Object(metadata));
    for (k, v) in fields {
        if !RESERVED_KEYS.contains(&k.as_str()) {
            root.insert(k.clone(), v.clone());
        }
    }
    Ok(Json::Object(root))
}

/// Reduce a live object to the payload a spec would describe.
fn payload_of(obj: &DynamicObject) -> Result<Json, ClusterError> {
    let mut v = serde_json::to_value(obj)
        .map_err(|e| ClusterError::Transient(format!("serializing live object: {e}")))?;
    if let Some(map) = v.as_object_mut() {
        for k in RESERVED_KEYS {
            map.remove(*k);
        }
    }
    Ok(v)
}

fn map_kube_err(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            401 => ClusterError::Auth(ae.message),
            403 => ClusterError::Forbidden(ae.message),
            400 | 422 => ClusterError::BadRequest(ae.message),
            404 => ClusterError::NotFound(ae.message),
            409 => ClusterError::Conflict(ae.message),
            429 => ClusterError::Transient(format!("throttled: {}", ae.message)),
            code if (500..=599).contains(&code) => {
                ClusterError::Transient(format!("server error {code}: {}", ae.message))
            }
            code if (400..=499).contains(&code) => {
                ClusterError::BadRequest(format!("status {code}: {}", ae.message))
            }
            code => ClusterError::Transient(format!("status {code}: {}", ae.message)),
        },
        kube::Error::Auth(e) => ClusterError::Auth(e.to_string()),
        // Transport, protocol, and encoding failures: worth another try.
        other => ClusterError::Transient(other.to_string()),
    }
}

enum ClientSource {
    Fixed(Client),
    Refreshing(auth::RefreshingClient),
}

/// `ClusterClient` backed by the Kubernetes API.
pub struct KubeClusterClient {
    source: ClientSource,
}

impl KubeClusterClient {
    /// Use the ambient kubeconfig context (local development, in-cluster).
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(map_kube_err)?;
        Ok(Self { source: ClientSource::Fixed(client) })
    }

    pub fn from_client(client: Client) -> Self {
        Self { source: ClientSource::Fixed(client) }
    }

    /// Token-authenticated endpoint; the session is rebuilt whenever the
    /// provider's token approaches expiry.
    pub fn with_token_provider(
        endpoint: ClusterEndpoint,
        provider: std::sync::Arc<dyn TokenProvider>,
    ) -> Self {
        Self { source: ClientSource::Refreshing(auth::RefreshingClient::new(endpoint, provider)) }
    }

    async fn client(&self) -> Result<Client, ClusterError> {
        match &self.source {
            ClientSource::Fixed(client) => Ok(client.clone()),
            ClientSource::Refreshing(refreshing) => refreshing.client().await,
        }
    }

    async fn api_for(&self, id: &ResourceId) -> Result<Api<DynamicObject>, ClusterError> {
        let client = self.client().await?;
        let ar = api_resource(id.kind);
        Ok(match &id.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        })
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, id: &ResourceId) -> Result<Option<ObservedResource>, ClusterError> {
        let api = self.api_for(id).await?;
        match api.get_opt(&id.name).await.map_err(map_kube_err)? {
            Some(obj) => {
                let resource_version = obj.metadata.resource_version.clone().unwrap_or_default();
                let spec = payload_of(&obj)?;
                debug!(id = %id, rv = %resource_version, "observed");
                Ok(Some(ObservedResource { id: id.clone(), resource_version, spec }))
            }
            None => {
                debug!(id = %id, "not observed");
                Ok(None)
            }
        }
    }

    async fn create(&self, id: &ResourceId, spec: &Json) -> Result<String, ClusterError> {
        let api = self.api_for(id).await?;
        let manifest = manifest_for(id, spec)?;
        let obj: DynamicObject = serde_json::from_value(manifest)
            .map_err(|e| ClusterError::BadRequest(format!("manifest for {id}: {e}")))?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(map_kube_err)?;
        let rv = created.metadata.resource_version.unwrap_or_default();
        info!(id = %id, rv = %rv, "created");
        Ok(rv)
    }

    async fn update(&self, id: &ResourceId, spec: &Json) -> Result<String, ClusterError> {
        let api = self.api_for(id).await?;
        let manifest = manifest_for(id, spec)?;
        let patched = api
            .patch(&id.name, &PatchParams::default(), &Patch::Merge(&manifest))
            .await
            .map_err(map_kube_err)?;
        let rv = patched.metadata.resource_version.unwrap_or_default();
        info!(id = %id, rv = %rv, "updated");
        Ok(rv)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        let api = self.api_for(id).await?;
        let _ = api.delete(&id.name, &DeleteParams::default()).await.map_err(map_kube_err)?;
        info!(id = %id, "delete accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use serde_json::json;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn kube_status_codes_map_to_the_taxonomy() {
        assert!(matches!(map_kube_err(api_err(401)), ClusterError::Auth(_)));
        assert!(matches!(map_kube_err(api_err(403)), ClusterError::Forbidden(_)));
        assert!(matches!(map_kube_err(api_err(400)), ClusterError::BadRequest(_)));
        assert!(matches!(map_kube_err(api_err(422)), ClusterError::BadRequest(_)));
        assert!(matches!(map_kube_err(api_err(404)), ClusterError::NotFound(_)));
        assert!(matches!(map_kube_err(api_err(409)), ClusterError::Conflict(_)));
        assert!(matches!(map_kube_err(api_err(429)), ClusterError::Transient(_)));
        assert!(matches!(map_kube_err(api_err(503)), ClusterError::Transient(_)));
        assert!(matches!(map_kube_err(api_err(410)), ClusterError::BadRequest(_)));
    }

    #[test]
    fn transience_follows_the_retry_contract() {
        assert!(map_kube_err(api_err(409)).is_transient());
        assert!(map_kube_err(api_err(429)).is_transient());
        assert!(map_kube_err(api_err(500)).is_transient());
        assert!(!map_kube_err(api_err(403)).is_transient());
        assert!(!map_kube_err(api_err(400)).is_transient());
        assert!(map_kube_err(api_err(401)).is_fatal());
    }

    #[test]
    fn kind_table_covers_the_managed_set() {
        let ns = api_resource(ResourceKind::Namespace);
        assert_eq!((ns.api_version.as_str(), ns.plural.as_str()), ("v1", "namespaces"));
        let job = api_resource(ResourceKind::Job);
        assert_eq!((job.api_version.as_str(), job.plural.as_str()), ("batch/v1", "jobs"));
        let netpol = api_resource(ResourceKind::NetworkPolicy);
        assert_eq!(
            (netpol.api_version.as_str(), netpol.plural.as_str()),
            ("networking.k8s.io/v1", "networkpolicies")
        );
        let svc = api_resource(ResourceKind::Service);
        assert_eq!(svc.plural.as_str(), "services");
        let secret = api_resource(ResourceKind::Secret);
        assert_eq!(secret.plural.as_str(), "secrets");
    }

    #[test]
    fn manifests_merge_payload_at_the_root() {
        let id = ResourceId::namespaced(ResourceKind::Secret, "demo", "creds");
        let manifest = manifest_for(
            &id,
            &json!({
                "type": "Opaque",
                "stringData": {"user": "u"},
                "metadata": {"name": "smuggled"},
            }),
        )
        .unwrap();
        assert_eq!(manifest["apiVersion"], "v1");
        assert_eq!(manifest["kind"], "Secret");
        // Identity stays owned by the id; the payload's metadata is dropped.
        assert_eq!(manifest["metadata"]["name"], "creds");
        assert_eq!(manifest["metadata"]["namespace"], "demo");
        assert_eq!(manifest["type"], "Opaque");
    }

    #[test]
    fn cluster_scoped_manifests_have_no_namespace() {
        let id = ResourceId::cluster(ResourceKind::Namespace, "scratch");
        let manifest = manifest_for(&id, &json!({})).unwrap();
        assert_eq!(manifest["metadata"]["name"], "scratch");
        assert_eq!(manifest["metadata"].get("namespace"), None);
    }

    #[test]
    fn non_object_payloads_are_rejected_client_side() {
        let id = ResourceId::namespaced(ResourceKind::Service, "demo", "web");
        let err = manifest_for(&id, &json!("blob")).unwrap_err();
        assert!(matches!(err, ClusterError::BadRequest(_)));
    }
}
