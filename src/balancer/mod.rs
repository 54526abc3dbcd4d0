// src/balancer/mod.rs
mod policy;

pub use policy::{LeastLoadedPolicy, ScoredBackend, SelectionPolicy};

use crate::config::Config;
use crate::error::{GatewayError, TransportKind};
use crate::metrics::MetricsCollector;
use crate::registry::{Backend, BackendStatus, ServerRegistry};
use chrono::Utc;
use futures::future::join_all;
use hyper::header::{HeaderValue, ACCEPT, CONTENT_LENGTH, HOST, USER_AGENT};
use hyper::{HeaderMap, Method};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// The inbound request fields that survive forwarding.
pub struct ForwardRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
    pub client_ip: Option<String>,
}

pub struct LoadBalancer {
    registry: Arc<ServerRegistry>,
    policy: Arc<dyn SelectionPolicy>,
    config: Arc<Config>,
    client: reqwest::Client,
    metrics: Arc<MetricsCollector>,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<ServerRegistry>,
        config: Arc<Config>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let client = registry.http_client();
        Self {
            registry,
            policy: Arc::new(LeastLoadedPolicy::new()),
            config,
            client,
            metrics,
        }
    }

    /// Selection cascade: enumerate active backends, score them with current
    /// session counts (a failed count excludes the backend from this round
    /// only), drop those at capacity, then least-loaded with round-robin
    /// tie-break.
    pub async fn select_optimal_backend(&self) -> Result<Arc<Backend>, GatewayError> {
        let active = self.registry.active_backends().await;
        if active.is_empty() {
            return Err(self.classify_outage().await);
        }

        let counts = join_all(
            active
                .iter()
                .map(|backend| self.registry.session_count(&backend.id)),
        )
        .await;

        let mut eligible = Vec::with_capacity(active.len());
        for (backend, count) in active.iter().zip(counts) {
            match count {
                Ok(sessions) if sessions < self.config.max_sessions_per_server => {
                    eligible.push(ScoredBackend {
                        backend: backend.clone(),
                        sessions,
                    });
                }
                Ok(sessions) => {
                    debug!(backend = %backend.id, sessions, "at capacity, skipped");
                }
                Err(err) => {
                    warn!(backend = %backend.id, "session count unavailable, skipped: {err}");
                }
            }
        }

        if eligible.is_empty() {
            return Err(GatewayError::AllFull {
                max: self.config.max_sessions_per_server,
            });
        }

        self.policy
            .select(&eligible)
            .await
            .ok_or(GatewayError::NoActiveServers)
    }

    async fn classify_outage(&self) -> GatewayError {
        let backends = self.registry.all_backends();
        let mut full = 0;
        let mut unhealthy = 0;
        for backend in backends {
            match backend.status().await {
                BackendStatus::Full => full += 1,
                BackendStatus::Unhealthy => unhealthy += 1,
                BackendStatus::Healthy => {}
            }
        }
        if full == backends.len() {
            GatewayError::AllFull {
                max: self.config.max_sessions_per_server,
            }
        } else if unhealthy == backends.len() {
            GatewayError::AllUnavailable
        } else {
            GatewayError::NoActiveServers
        }
    }

    /// Selects a backend and forwards the request, retrying transport
    /// failures with linear backoff and reselection. All HTTP statuses are
    /// returned as success; only transport-level errors raise. When
    /// reselection fails mid-retry, the original transport error surfaces.
    pub async fn forward(
        &self,
        request: &ForwardRequest,
    ) -> Result<(Arc<Backend>, reqwest::Response), GatewayError> {
        let trace_id = Uuid::new_v4();
        let mut backend = self.select_optimal_backend().await?;
        let mut attempt: u32 = 0;

        loop {
            debug!(
                %trace_id,
                backend = %backend.id,
                attempt,
                "forwarding {} {}",
                request.method,
                request.path
            );
            let started = Instant::now();
            match self.send_once(request, &backend).await {
                Ok(response) => {
                    self.metrics
                        .record_upstream(&backend.id, true, started.elapsed());
                    return Ok((backend, response));
                }
                Err(err) => {
                    self.metrics
                        .record_upstream(&backend.id, false, started.elapsed());
                    let kind = TransportKind::from_reqwest(&err);
                    warn!(
                        %trace_id,
                        backend = %backend.id,
                        kind = kind.as_str(),
                        "upstream transport error: {err}"
                    );
                    if kind.marks_unhealthy() {
                        self.registry.mark_unhealthy(&backend, err.to_string()).await;
                    }
                    if attempt >= self.config.max_retries {
                        return Err(GatewayError::Transport {
                            backend: backend.id.clone(),
                            kind,
                            source: err,
                        });
                    }

                    sleep(self.config.retry_delay() * (attempt + 1)).await;

                    match self.select_optimal_backend().await {
                        Ok(next) => backend = next,
                        Err(selection_err) => {
                            debug!(%trace_id, "reselection failed: {selection_err}");
                            return Err(GatewayError::Transport {
                                backend: backend.id.clone(),
                                kind,
                                source: err,
                            });
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &ForwardRequest,
        backend: &Arc<Backend>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let target = self.target_url(backend, &request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &target)
            .headers(proxy_headers(request, backend))
            .timeout(self.config.request_timeout());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder.send().await
    }

    fn target_url(&self, backend: &Backend, path: &str) -> String {
        let mut target = backend.endpoint(path);
        // the upstream pair endpoint expects a trailing slash
        if self.config.pair_trailing_slash && is_pair_path(path) {
            target.push('/');
        }
        target
    }

    pub fn describe(&self) -> Value {
        json!({
            "algorithm": self.policy.name(),
            "cursor": self.policy.cursor(),
            "maxRetries": self.config.max_retries,
            "retryDelayMs": self.config.retry_delay_ms,
            "requestTimeoutMs": self.config.request_timeout_ms,
        })
    }
}

/// Exact match of `^/pair/[^/]+$`.
fn is_pair_path(path: &str) -> bool {
    match path.strip_prefix("/pair/") {
        Some(rest) => !rest.is_empty() && !rest.contains('/'),
        None => false,
    }
}

fn proxy_headers(request: &ForwardRequest, backend: &Backend) -> HeaderMap {
    let mut headers = request.headers.clone();
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);

    if let Some(ip) = &request.client_ip {
        let forwarded = match headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert("x-forwarded-for", value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&backend.id) {
        headers.insert("x-proxy-server", value);
    }
    if let Ok(value) = HeaderValue::from_str(&Utc::now().to_rfc3339()) {
        headers.insert("x-proxy-timestamp", value);
    }
    headers.insert(USER_AGENT, HeaderValue::from_static(crate::USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers
}
