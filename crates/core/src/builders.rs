//! Canned intents for the managed kinds with sensible defaults.

use serde_json::{json, Value as Json};

use crate::{ResourceId, ResourceIntent, ResourceKind};

/// Pods carrying this annotation are never evicted by the cluster
/// autoscaler, so batch jobs run to completion on scale-down.
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

pub fn namespace(name: &str) -> ResourceIntent {
    ResourceIntent::present(ResourceId::cluster(ResourceKind::Namespace, name), json!({}))
}

pub fn namespace_absent(name: &str) -> ResourceIntent {
    ResourceIntent::absent(ResourceId::cluster(ResourceKind::Namespace, name))
}

/// A batch job wrapping the given pod spec. The pod template is pinned
/// against autoscaler eviction and labelled with the job name.
pub fn job(namespace: &str, name: &str, pod_spec: Json) -> ResourceIntent {
    let spec = json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": { SAFE_TO_EVICT_ANNOTATION: "false" },
                    "labels": { "name": name }
                },
                "spec": pod_spec
            }
        }
    });
    ResourceIntent::present(ResourceId::namespaced(ResourceKind::Job, namespace, name), spec)
}

/// A headless service (no cluster IP) for DNS resolution of the selected
/// pods. When `ports` is `None` the service exposes TCP port 80.
pub fn headless_service(
    namespace: &str,
    name: &str,
    selector: Json,
    ports: Option<Vec<Json>>,
) -> ResourceIntent {
    let ports = ports.unwrap_or_else(|| vec![json!({"port": 80, "protocol": "TCP"})]);
    let spec = json!({
        "spec": {
            "clusterIP": "None",
            "ports": ports,
            "selector": selector
        }
    });
    ResourceIntent::present(ResourceId::namespaced(ResourceKind::Service, namespace, name), spec)
}

/// Derive service ports from container port declarations
/// (`{"containerPort": N, "protocol": P?}`).
pub fn service_ports_from_container_ports(container_ports: &[Json]) -> Vec<Json> {
    container_ports
        .iter()
        .map(|p| {
            let port = p.get("containerPort").cloned().unwrap_or(Json::Null);
            let protocol = p
                .get("protocol")
                .cloned()
                .unwrap_or_else(|| Json::String("TCP".to_string()));
            json!({"port": port, "protocol": protocol})
        })
        .collect()
}

/// A network policy allowing the selected pods egress only for DNS
/// resolution (port 53, TCP and UDP).
pub fn network_policy_dns_only(namespace: &str, name: &str, pod_selector: Json) -> ResourceIntent {
    let spec = json!({
        "spec": {
            "podSelector": pod_selector,
            "policyTypes": ["Egress"],
            "egress": [
                {
                    "ports": [
                        {"port": 53, "protocol": "TCP"},
                        {"port": 53, "protocol": "UDP"}
                    ]
                }
            ]
        }
    });
    ResourceIntent::present(
        ResourceId::namespaced(ResourceKind::NetworkPolicy, namespace, name),
        spec,
    )
}

/// A network policy allowing the selected pods egress only to the
/// destination pods.
pub fn network_policy_pods_only(
    namespace: &str,
    name: &str,
    pod_selector: Json,
    destination: Json,
) -> ResourceIntent {
    let spec = json!({
        "spec": {
            "podSelector": pod_selector,
            "policyTypes": ["Egress"],
            "egress": [
                { "to": [ {"podSelector": destination} ] }
            ]
        }
    });
    ResourceIntent::present(
        ResourceId::namespaced(ResourceKind::NetworkPolicy, namespace, name),
        spec,
    )
}

/// An opaque secret from plaintext key/value pairs.
pub fn secret(namespace: &str, name: &str, string_data: Json) -> ResourceIntent {
    let spec = json!({
        "type": "Opaque",
        "stringData": string_data
    });
    ResourceIntent::present(ResourceId::namespaced(ResourceKind::Secret, namespace, name), spec)
}
