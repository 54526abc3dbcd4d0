// src/registry/mod.rs
mod backend;
mod index;

pub use backend::{Backend, BackendSnapshot, BackendStatus, CounterSnapshot, StatusPatch};
pub use index::SessionIndex;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{GatewayError, TransportKind};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Result of resolving a session to its owning backend.
pub struct FoundSession {
    pub backend: Arc<Backend>,
    /// True when the hit came from the index or the in-memory session sets;
    /// false when a live probe was needed.
    pub cached: bool,
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub backend_id: String,
    pub new_session_count: usize,
    pub upstream: Value,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryTotals {
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub full_servers: usize,
    pub unhealthy_servers: usize,
    pub total_sessions: usize,
}

#[derive(Debug, Deserialize)]
struct SessionsBody {
    #[serde(default)]
    sessions: Vec<SessionObject>,
}

/// Upstream session objects carry the identifier under `id` or `sessionId`.
#[derive(Debug, Deserialize)]
struct SessionObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
}

impl SessionObject {
    fn identifier(&self) -> Option<&str> {
        self.id.as_deref().or(self.session_id.as_deref())
    }
}

struct SessionsProbe {
    ids: Vec<String>,
    elapsed_ms: u64,
}

/// Authoritative in-memory record of the backend fleet, plus the advisory
/// session index and the session-count TTL cache.
pub struct ServerRegistry {
    backends: Vec<Arc<Backend>>,
    index: SessionIndex,
    counts: TtlCache<usize>,
    client: reqwest::Client,
    config: Arc<Config>,
}

impl ServerRegistry {
    pub fn from_config(config: &Arc<Config>) -> Self {
        let backends: Vec<Arc<Backend>> = config
            .backend_servers
            .iter()
            .enumerate()
            .map(|(i, url)| Arc::new(Backend::new(format!("server-{}", i + 1), url.clone())))
            .collect();

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(crate::USER_AGENT)
            .build()
            .expect("failed to build HTTP client");

        Self {
            backends,
            index: SessionIndex::new(),
            counts: TtlCache::new(config.session_cache_ttl()),
            client,
            config: config.clone(),
        }
    }

    /// All backends, in the stable order established at init.
    pub fn all_backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub async fn active_backends(&self) -> Vec<Arc<Backend>> {
        let mut active = Vec::new();
        for backend in &self.backends {
            if backend.is_active().await {
                active.push(backend.clone());
            }
        }
        active
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.iter().find(|b| b.id == id).cloned()
    }

    pub fn index(&self) -> &SessionIndex {
        &self.index
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: BackendStatus,
        patch: StatusPatch,
    ) -> Result<BackendSnapshot, GatewayError> {
        let backend = self
            .get(id)
            .ok_or_else(|| GatewayError::UnknownBackend(id.to_string()))?;
        let snapshot = backend.apply_update(status, patch).await;
        self.counts.delete(id);
        Ok(snapshot)
    }

    pub async fn mark_unhealthy(&self, backend: &Arc<Backend>, error: String) -> BackendSnapshot {
        let snapshot = backend
            .apply_update(
                BackendStatus::Unhealthy,
                StatusPatch {
                    error: Some(error),
                    ..Default::default()
                },
            )
            .await;
        self.counts.delete(&backend.id);
        snapshot
    }

    pub async fn reset_to_healthy(&self, id: &str) -> Result<BackendSnapshot, GatewayError> {
        self.update_status(id, BackendStatus::Healthy, StatusPatch::default())
            .await
    }

    /// Probes `GET <url>/sessions` and folds the outcome into the backend:
    /// status (FULL at capacity), session count and set, response time, the
    /// session index, and the count cache. Any failure drives the backend
    /// UNHEALTHY before the error surfaces.
    pub async fn refresh_backend(
        &self,
        backend: &Arc<Backend>,
    ) -> Result<BackendSnapshot, GatewayError> {
        match self.fetch_sessions(backend).await {
            Ok(probe) => {
                let count = probe.ids.len();
                let status = if count >= self.config.max_sessions_per_server {
                    BackendStatus::Full
                } else {
                    BackendStatus::Healthy
                };
                let snapshot = backend
                    .apply_update(
                        status,
                        StatusPatch {
                            session_count: Some(count),
                            sessions: Some(probe.ids.clone()),
                            response_time_ms: Some(probe.elapsed_ms),
                            error: None,
                        },
                    )
                    .await;
                for session_id in &probe.ids {
                    self.index.insert(session_id, &backend.id);
                }
                self.counts
                    .set(&backend.id, count, Some(self.config.session_cache_ttl()));
                debug!(
                    backend = %backend.id,
                    sessions = count,
                    status = status.as_str(),
                    "probe complete"
                );
                Ok(snapshot)
            }
            Err(err) => {
                self.mark_unhealthy(backend, err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn fetch_sessions(&self, backend: &Arc<Backend>) -> Result<SessionsProbe, GatewayError> {
        let started = Instant::now();
        let response = self
            .client
            .get(backend.endpoint("/sessions"))
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|err| GatewayError::transport(&backend.id, err))?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response
                .json()
                .await
                .unwrap_or_else(|_| json!({ "error": format!("HTTP {}", status.as_u16()) }));
            return Err(GatewayError::Upstream {
                backend: backend.id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let body: SessionsBody =
            response
                .json()
                .await
                .map_err(|err| GatewayError::MalformedUpstream {
                    backend: backend.id.clone(),
                    detail: err.to_string(),
                })?;

        let mut ids = Vec::with_capacity(body.sessions.len());
        for session in &body.sessions {
            match session.identifier() {
                Some(id) => ids.push(id.to_string()),
                None => warn!(
                    backend = %backend.id,
                    "session object carries neither id nor sessionId, dropped"
                ),
            }
        }

        Ok(SessionsProbe {
            ids,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Hot path for load balancing: cached count when fresh, live probe
    /// otherwise.
    pub async fn session_count(&self, id: &str) -> Result<usize, GatewayError> {
        let backend = self
            .get(id)
            .ok_or_else(|| GatewayError::UnknownBackend(id.to_string()))?;
        if let Some(count) = self.counts.get(id) {
            return Ok(count);
        }
        let snapshot = self.refresh_backend(&backend).await?;
        Ok(snapshot.session_count)
    }

    /// Resolves a session in three stages: index hint, in-memory session
    /// sets (repairing the index on a hit), then a sequential probe of each
    /// backend. First match wins.
    pub async fn find_session_backend(&self, session_id: &str) -> Option<FoundSession> {
        if let Some(backend_id) = self.index.lookup(session_id) {
            match self.get(&backend_id) {
                Some(backend) => {
                    return Some(FoundSession {
                        backend,
                        cached: true,
                    })
                }
                None => {
                    // hint names a backend this registry does not know
                    self.index.remove(session_id);
                }
            }
        }

        for backend in &self.backends {
            if backend.has_session(session_id).await {
                self.index.insert(session_id, &backend.id);
                return Some(FoundSession {
                    backend: backend.clone(),
                    cached: true,
                });
            }
        }

        for backend in &self.backends {
            match self.refresh_backend(backend).await {
                Ok(snapshot) if snapshot.sessions.iter().any(|s| s == session_id) => {
                    return Some(FoundSession {
                        backend: backend.clone(),
                        cached: false,
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(backend = %backend.id, "lookup probe failed: {err}");
                }
            }
        }

        None
    }

    /// Issues `POST <url>/logout/<sessionId>` and reconciles local state.
    /// An upstream 404 still cleans local state before surfacing; transport
    /// failures surface unchanged apart from the usual health transition.
    pub async fn delete_session(
        &self,
        backend_id: &str,
        session_id: &str,
    ) -> Result<DeleteOutcome, GatewayError> {
        let backend = self
            .get(backend_id)
            .ok_or_else(|| GatewayError::UnknownBackend(backend_id.to_string()))?;

        let response = match self
            .client
            .post(backend.endpoint(&format!("/logout/{session_id}")))
            .header("accept", "application/json")
            .header("x-proxy-server", &backend.id)
            .header("x-proxy-timestamp", Utc::now().to_rfc3339())
            .json(&json!({}))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let kind = TransportKind::from_reqwest(&err);
                if kind.marks_unhealthy() {
                    self.mark_unhealthy(&backend, err.to_string()).await;
                }
                return Err(GatewayError::Transport {
                    backend: backend.id.clone(),
                    kind,
                    source: err,
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            let upstream: Value = response.json().await.unwrap_or_else(|_| json!({}));
            let new_session_count = backend.forget_session(session_id).await;
            backend.record_deleted_session();
            self.index.remove(session_id);
            self.counts.delete(&backend.id);
            debug!(backend = %backend.id, session = session_id, "session deleted");
            return Ok(DeleteOutcome {
                backend_id: backend.id.clone(),
                new_session_count,
                upstream,
            });
        }

        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({ "error": format!("HTTP {}", status.as_u16()) }));

        if status == reqwest::StatusCode::NOT_FOUND {
            // the session is unknown upstream; local hints are stale
            backend.forget_session(session_id).await;
            self.index.remove(session_id);
            self.counts.delete(&backend.id);
        }

        Err(GatewayError::Upstream {
            backend: backend.id.clone(),
            status: status.as_u16(),
            body,
        })
    }

    pub async fn totals(&self) -> RegistryTotals {
        let mut totals = RegistryTotals {
            total_servers: self.backends.len(),
            healthy_servers: 0,
            full_servers: 0,
            unhealthy_servers: 0,
            total_sessions: 0,
        };
        for backend in &self.backends {
            match backend.status().await {
                BackendStatus::Healthy => totals.healthy_servers += 1,
                BackendStatus::Full => totals.full_servers += 1,
                BackendStatus::Unhealthy => totals.unhealthy_servers += 1,
            }
            totals.total_sessions += backend.session_count().await;
        }
        totals
    }

    pub async fn stats(&self) -> Vec<BackendSnapshot> {
        let mut snapshots = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            snapshots.push(backend.snapshot().await);
        }
        snapshots
    }

    pub fn index_info(&self) -> Value {
        let mut mappings = serde_json::Map::new();
        for (session_id, backend_id) in self.index.entries() {
            mappings.insert(session_id, Value::String(backend_id));
        }
        json!({ "entries": self.index.len(), "mappings": mappings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;

    fn test_config(backends: Vec<&str>, max_sessions: usize) -> Arc<Config> {
        Arc::new(Config {
            port: 0,
            backend_servers: backends.iter().map(|b| b.parse().unwrap()).collect(),
            max_sessions_per_server: max_sessions,
            request_timeout_ms: 2000,
            health_check_interval_ms: 10_000,
            session_cache_ttl_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 10,
            pair_trailing_slash: true,
            metrics: MetricsConfig::default(),
        })
    }

    fn sessions_body(ids: &[&str]) -> String {
        let sessions: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        json!({ "sessions": sessions }).to_string()
    }

    #[tokio::test]
    async fn ids_are_positional() {
        let config = test_config(vec!["http://127.0.0.1:3001", "http://127.0.0.1:3002"], 25);
        let registry = ServerRegistry::from_config(&config);
        let ids: Vec<&str> = registry
            .all_backends()
            .iter()
            .map(|b| b.id.as_str())
            .collect();
        assert_eq!(ids, vec!["server-1", "server-2"]);
    }

    #[tokio::test]
    async fn refresh_populates_count_index_and_cache() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(sessions_body(&["sess-alpha-0001", "sess-beta-0002"]))
            .expect(1)
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 25);
        let registry = ServerRegistry::from_config(&config);
        let backend = registry.get("server-1").unwrap();

        let snap = registry.refresh_backend(&backend).await.unwrap();
        assert_eq!(snap.status, BackendStatus::Healthy);
        assert_eq!(snap.session_count, 2);
        assert_eq!(
            registry.index().lookup("sess-alpha-0001").as_deref(),
            Some("server-1")
        );

        // second read is served from the count cache, no extra probe
        assert_eq!(registry.session_count("server-1").await.unwrap(), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn refresh_marks_full_at_capacity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(&["sess-aaaa-0001", "sess-bbbb-0002"]))
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 2);
        let registry = ServerRegistry::from_config(&config);
        let backend = registry.get("server-1").unwrap();

        let snap = registry.refresh_backend(&backend).await.unwrap();
        assert_eq!(snap.status, BackendStatus::Full);
        assert!(!snap.is_active);
    }

    #[tokio::test]
    async fn refresh_accepts_session_id_field_and_drops_anonymous_objects() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(
                json!({
                    "sessions": [
                        { "sessionId": "sess-byname-001" },
                        { "number": "336123" }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 25);
        let registry = ServerRegistry::from_config(&config);
        let backend = registry.get("server-1").unwrap();

        let snap = registry.refresh_backend(&backend).await.unwrap();
        assert_eq!(snap.sessions, vec!["sess-byname-001".to_string()]);
        assert_eq!(snap.session_count, 1);
    }

    #[tokio::test]
    async fn probe_failure_marks_unhealthy() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions")
            .with_status(500)
            .with_body(r#"{"error":"boom"}"#)
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 25);
        let registry = ServerRegistry::from_config(&config);
        let backend = registry.get("server-1").unwrap();

        assert!(registry.refresh_backend(&backend).await.is_err());
        assert_eq!(backend.status().await, BackendStatus::Unhealthy);
        assert_eq!(backend.failures(), 1);
    }

    #[tokio::test]
    async fn connection_refused_marks_unhealthy_before_surfacing() {
        // nothing listens on this origin
        let config = test_config(vec!["http://127.0.0.1:9"], 25);
        let registry = ServerRegistry::from_config(&config);

        let err = registry.session_count("server-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
        let backend = registry.get("server-1").unwrap();
        assert_eq!(backend.status().await, BackendStatus::Unhealthy);
    }

    #[tokio::test]
    async fn find_session_probes_then_hits_the_index() {
        let mut server_a = mockito::Server::new_async().await;
        let probe_a = server_a
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(&[]))
            .expect(1)
            .create_async()
            .await;

        let mut server_b = mockito::Server::new_async().await;
        let probe_b = server_b
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(&["sess-target-001"]))
            .expect(1)
            .create_async()
            .await;

        let config = test_config(vec![server_a.url().as_str(), server_b.url().as_str()], 25);
        let registry = ServerRegistry::from_config(&config);

        let found = registry.find_session_backend("sess-target-001").await.unwrap();
        assert_eq!(found.backend.id, "server-2");
        assert!(!found.cached);

        // resolved from the index this time, no further probes
        let found = registry.find_session_backend("sess-target-001").await.unwrap();
        assert_eq!(found.backend.id, "server-2");
        assert!(found.cached);

        probe_a.assert_async().await;
        probe_b.assert_async().await;
    }

    #[tokio::test]
    async fn find_session_returns_none_when_nobody_owns_it() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(&[]))
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 25);
        let registry = ServerRegistry::from_config(&config);
        assert!(registry
            .find_session_backend("sess-unknown-001")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn delete_session_cleans_local_state() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(&["sess-doomed-001"]))
            .create_async()
            .await;
        let logout = server
            .mock("POST", "/logout/sess-doomed-001")
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .expect(1)
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 25);
        let registry = ServerRegistry::from_config(&config);
        let backend = registry.get("server-1").unwrap();
        registry.refresh_backend(&backend).await.unwrap();
        assert!(registry.index().contains("sess-doomed-001"));

        let outcome = registry
            .delete_session("server-1", "sess-doomed-001")
            .await
            .unwrap();
        assert_eq!(outcome.new_session_count, 0);
        assert!(!registry.index().contains("sess-doomed-001"));
        assert!(!backend.has_session("sess-doomed-001").await);
        assert_eq!(backend.deleted_sessions(), 1);
        logout.assert_async().await;
    }

    #[tokio::test]
    async fn delete_session_404_cleans_local_state_then_surfaces() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(&["sess-stale-0001"]))
            .create_async()
            .await;
        server
            .mock("POST", "/logout/sess-stale-0001")
            .with_status(404)
            .with_body(r#"{"error":"session not found"}"#)
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 25);
        let registry = ServerRegistry::from_config(&config);
        let backend = registry.get("server-1").unwrap();
        registry.refresh_backend(&backend).await.unwrap();

        let err = registry
            .delete_session("server-1", "sess-stale-0001")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { status: 404, .. }));
        assert!(!registry.index().contains("sess-stale-0001"));
        assert!(!backend.has_session("sess-stale-0001").await);
        // nothing was deleted upstream
        assert_eq!(backend.deleted_sessions(), 0);
    }
}
