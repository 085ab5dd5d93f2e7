//! Bearer-token sessions for token-authenticated control planes.
//!
//! A `TokenProvider` hands out short-lived bearer tokens; the session layer
//! builds a kube client from the current token and rebuilds it when the
//! token approaches expiry. Concurrent refreshes may race; last write wins
//! and every stored session carries a valid token.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::ClusterError;

/// Tokens are renewed this many seconds before their stated expiry.
pub const TOKEN_REFRESH_SKEW_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct BearerToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl BearerToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self { token: token.into(), expires_at }
    }

    /// True once the token is inside the refresh window.
    pub fn is_expired(&self) -> bool {
        needs_refresh(self.expires_at)
    }
}

pub(crate) fn needs_refresh(expires_at: DateTime<Utc>) -> bool {
    Utc::now() + Duration::seconds(TOKEN_REFRESH_SKEW_SECS) >= expires_at
}

/// Source of bearer tokens for the target control plane. Failures are
/// authorization failures; no further cluster calls can succeed without a
/// token, so callers treat them as fatal.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<BearerToken, ClusterError>;
}

/// Provider wrapping one pre-issued token. Useful for development and for
/// control planes with long-lived service-account tokens.
pub struct StaticTokenProvider {
    token: BearerToken,
}

impl StaticTokenProvider {
    pub fn new(token: BearerToken) -> Self {
        Self { token }
    }

    /// A token that never rotates; the session built from it is reused for
    /// the life of the process.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self::new(BearerToken::new(token, Utc::now() + Duration::days(3650)))
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<BearerToken, ClusterError> {
        Ok(self.token.clone())
    }
}

/// Connection coordinates for a token-authenticated control plane.
#[derive(Debug, Clone)]
pub struct ClusterEndpoint {
    /// Full server URL, e.g. `https://10.0.0.2:443`.
    pub server: String,
    /// Skip TLS verification. Managed control planes frequently present
    /// certificates for internal names only.
    pub accept_invalid_certs: bool,
}

impl ClusterEndpoint {
    pub fn new(server: impl Into<String>) -> Self {
        Self { server: server.into(), accept_invalid_certs: false }
    }

    pub fn insecure(mut self) -> Self {
        self.accept_invalid_certs = true;
        self
    }
}

pub(crate) struct TokenSession {
    pub(crate) client: Client,
    pub(crate) expires_at: DateTime<Utc>,
}

/// Client source that re-authenticates on expiry.
pub(crate) struct RefreshingClient {
    endpoint: ClusterEndpoint,
    provider: Arc<dyn TokenProvider>,
    session: ArcSwapOption<TokenSession>,
}

impl RefreshingClient {
    pub(crate) fn new(endpoint: ClusterEndpoint, provider: Arc<dyn TokenProvider>) -> Self {
        Self { endpoint, provider, session: ArcSwapOption::const_empty() }
    }

    pub(crate) async fn client(&self) -> Result<Client, ClusterError> {
        if let Some(session) = self.session.load_full() {
            if !needs_refresh(session.expires_at) {
                return Ok(session.client.clone());
            }
            debug!(expires_at = %session.expires_at, "cluster session expired");
        }
        let token = self.provider.fetch_token().await.map_err(|e| match e {
            ClusterError::Auth(_) => e,
            other => ClusterError::Auth(other.to_string()),
        })?;
        let client = build_token_client(&self.endpoint, &token.token).await?;
        self.session.store(Some(Arc::new(TokenSession {
            client: client.clone(),
            expires_at: token.expires_at,
        })));
        info!(server = %self.endpoint.server, expires_at = %token.expires_at, "cluster session refreshed");
        Ok(client)
    }
}

/// Build a client for the endpoint from a synthesized single-context
/// kubeconfig carrying the bearer token.
async fn build_token_client(endpoint: &ClusterEndpoint, token: &str) -> Result<Client, ClusterError> {
    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "target",
            "cluster": {
                "server": endpoint.server,
                "insecure-skip-tls-verify": endpoint.accept_invalid_certs,
            },
        }],
        "users": [{
            "name": "provisioner",
            "user": { "token": token },
        }],
        "contexts": [{
            "name": "target",
            "context": { "cluster": "target", "user": "provisioner" },
        }],
        "current-context": "target",
    }))
    .map_err(|e| ClusterError::Auth(format!("assembling kubeconfig: {e}")))?;

    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| ClusterError::Auth(format!("building cluster config: {e}")))?;
    Client::try_from(config).map_err(|e| ClusterError::Auth(format!("building cluster client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        fetches: AtomicU32,
        ttl: Duration,
    }

    impl CountingProvider {
        fn new(ttl: Duration) -> Self {
            Self { fetches: AtomicU32::new(0), ttl }
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn fetch_token(&self) -> Result<BearerToken, ClusterError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(BearerToken::new(format!("token-{n}"), Utc::now() + self.ttl))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl TokenProvider for FailingProvider {
        async fn fetch_token(&self) -> Result<BearerToken, ClusterError> {
            Err(ClusterError::Transient("metadata service unreachable".into()))
        }
    }

    fn endpoint() -> ClusterEndpoint {
        ClusterEndpoint::new("https://127.0.0.1:6443").insecure()
    }

    #[tokio::test]
    async fn session_is_reused_until_expiry() {
        let provider = Arc::new(CountingProvider::new(Duration::hours(1)));
        let refreshing = RefreshingClient::new(endpoint(), provider.clone());
        refreshing.client().await.unwrap();
        refreshing.client().await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_session_fetches_a_new_token() {
        // Within the refresh skew from the start, so every call refreshes.
        let provider = Arc::new(CountingProvider::new(Duration::seconds(5)));
        let refreshing = RefreshingClient::new(endpoint(), provider.clone());
        refreshing.client().await.unwrap();
        refreshing.client().await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn provider_failures_become_auth_errors() {
        let refreshing = RefreshingClient::new(endpoint(), Arc::new(FailingProvider));
        // `Client` has no Debug impl, so unwrap_err is unavailable here.
        let err = refreshing.client().await.err().expect("auth failure");
        assert!(matches!(err, ClusterError::Auth(_)), "got {err:?}");
    }

    #[test]
    fn token_expiry_honors_skew() {
        let fresh = BearerToken::new("t", Utc::now() + Duration::hours(1));
        assert!(!fresh.is_expired());
        let stale = BearerToken::new("t", Utc::now() + Duration::seconds(TOKEN_REFRESH_SKEW_SECS - 5));
        assert!(stale.is_expired());
    }
}
