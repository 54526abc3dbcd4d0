// src/controller/mod.rs
use crate::balancer::{ForwardRequest, LoadBalancer};
use crate::config::Config;
use crate::error::GatewayError;
use crate::health::HealthMonitor;
use crate::metrics::MetricsCollector;
use crate::registry::ServerRegistry;
use chrono::Utc;
use futures::future::join_all;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Translates inbound HTTP operations into calls against the registry, the
/// load balancer, and the health monitor.
pub struct Controller {
    config: Arc<Config>,
    registry: Arc<ServerRegistry>,
    balancer: Arc<LoadBalancer>,
    monitor: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ServerRegistry>,
        balancer: Arc<LoadBalancer>,
        monitor: Arc<HealthMonitor>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            registry,
            balancer,
            monitor,
            metrics,
        }
    }

    pub async fn handle(&self, req: Request<Body>, peer: Option<SocketAddr>) -> Response<Body> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = self.route(req, peer).await;

        self.metrics.record_request(
            &route_label(&path),
            response.status().as_u16(),
            started.elapsed(),
        );
        info!(
            %method,
            %path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request"
        );
        response
    }

    async fn route(&self, req: Request<Body>, peer: Option<SocketAddr>) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let segs: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (method.as_str(), segs.as_slice()) {
            ("GET", []) => self.banner(),
            ("GET", ["pair", number]) => self.pair(number, req, peer).await,
            ("DELETE", ["delete-session", session_id]) => self.delete_session(session_id).await,
            ("GET", ["find-session", session_id]) => self.find_session(session_id).await,
            ("GET", ["health"]) => self.health().await,
            ("GET", ["stats"]) => self.stats().await,
            ("GET", ["servers"]) => self.servers().await,
            ("GET", ["total-sessions"]) => self.total_sessions().await,
            ("POST", ["health", "check", server_id]) => self.force_check(server_id).await,
            ("POST", ["servers", "reset", server_id]) => self.force_reset(server_id).await,
            _ => error_payload(StatusCode::NOT_FOUND, "Unknown route"),
        }
    }

    fn banner(&self) -> Response<Body> {
        json_response(
            StatusCode::OK,
            json!({
                "ok": true,
                "service": "session-gateway",
                "version": env!("CARGO_PKG_VERSION"),
                "description": "Session-aware HTTP gateway fronting the pairing API fleet",
                "endpoints": {
                    "GET /pair/:number": "Pair a phone number on the least-loaded server",
                    "DELETE /delete-session/:sessionId": "Remove a session wherever it lives",
                    "GET /find-session/:sessionId": "Locate the server owning a session",
                    "GET /health": "Fleet health snapshot",
                    "GET /stats": "Per-server counters",
                    "GET /servers": "Configured server list",
                    "GET /total-sessions": "Fleet capacity view",
                    "POST /health/check/:serverId": "Force a probe of one server",
                    "POST /servers/reset/:serverId": "Force a server back to healthy",
                },
            }),
        )
    }

    async fn pair(
        &self,
        number: &str,
        req: Request<Body>,
        peer: Option<SocketAddr>,
    ) -> Response<Body> {
        if !is_valid_number(number) {
            return error_payload(
                StatusCode::BAD_REQUEST,
                "Invalid phone number: expected 6-15 digits",
            );
        }

        let headers = req.headers().clone();
        let body_bytes = match hyper::body::to_bytes(req.into_body()).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to read request body: {err}");
                Default::default()
            }
        };
        let body = if body_bytes.is_empty() {
            None
        } else {
            match serde_json::from_slice(&body_bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!("non-JSON request body dropped: {err}");
                    None
                }
            }
        };

        let request = ForwardRequest {
            method: Method::GET,
            path: format!("/pair/{number}"),
            headers,
            body,
            client_ip: peer.map(|p| p.ip().to_string()),
        };

        let (backend, response) = match self.balancer.forward(&request).await {
            Ok(forwarded) => forwarded,
            Err(err) => return gateway_error_response(err),
        };

        let status = response.status();
        let bytes = response.bytes().await.unwrap_or_default();
        if bytes.is_empty() {
            return gateway_error_response(GatewayError::EmptyUpstream);
        }

        // bookkeeping failures are logged, never surfaced
        if let Ok(payload) = serde_json::from_slice::<Value>(&bytes) {
            self.record_pairing(&backend.id, &payload);
        }

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(bytes.to_vec()))
            .unwrap()
    }

    fn record_pairing(&self, backend_id: &str, payload: &Value) {
        if payload.get("ok").and_then(Value::as_bool) != Some(true) {
            return;
        }
        let session_id = payload
            .get("sessionId")
            .or_else(|| payload.get("cleanNumber"))
            .and_then(Value::as_str);
        match session_id {
            Some(session_id) => {
                self.registry.index().insert(session_id, backend_id);
                debug!(backend = %backend_id, session = session_id, "pairing indexed");
            }
            None => warn!(
                backend = %backend_id,
                "pair response carries neither sessionId nor cleanNumber"
            ),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Response<Body> {
        if !is_valid_session_id(session_id) {
            return error_payload(
                StatusCode::BAD_REQUEST,
                "Invalid session id: expected 10-100 chars of letters, digits, '_' or '-'",
            );
        }

        let found = match self.registry.find_session_backend(session_id).await {
            Some(found) => found,
            None => return session_not_found(session_id),
        };

        match self
            .registry
            .delete_session(&found.backend.id, session_id)
            .await
        {
            Ok(outcome) => json_response(
                StatusCode::OK,
                json!({
                    "ok": true,
                    "message": "Session deleted",
                    "sessionId": session_id,
                    "server": outcome.backend_id,
                    "newSessionCount": outcome.new_session_count,
                }),
            ),
            Err(err) => gateway_error_response(err),
        }
    }

    async fn find_session(&self, session_id: &str) -> Response<Body> {
        if !is_valid_session_id(session_id) {
            return error_payload(
                StatusCode::BAD_REQUEST,
                "Invalid session id: expected 10-100 chars of letters, digits, '_' or '-'",
            );
        }

        match self.registry.find_session_backend(session_id).await {
            Some(found) => {
                let snapshot = found.backend.snapshot().await;
                json_response(
                    StatusCode::OK,
                    json!({
                        "ok": true,
                        "found": true,
                        "sessionId": session_id,
                        "server": {
                            "id": snapshot.id,
                            "url": snapshot.url,
                            "status": snapshot.status,
                            "sessionCount": snapshot.session_count,
                        },
                        "cached": found.cached,
                    }),
                )
            }
            None => session_not_found(session_id),
        }
    }

    async fn health(&self) -> Response<Body> {
        let servers = self.registry.stats().await;
        let totals = self.registry.totals().await;
        let capacity_max = totals.total_servers * self.config.max_sessions_per_server;
        let status = if totals.healthy_servers > 0 {
            "ok"
        } else {
            "degraded"
        };

        json_response(
            StatusCode::OK,
            json!({
                "ok": true,
                "status": status,
                "summary": {
                    "totalServers": totals.total_servers,
                    "healthyServers": totals.healthy_servers,
                    "fullServers": totals.full_servers,
                    "unhealthyServers": totals.unhealthy_servers,
                    "totalSessions": totals.total_sessions,
                    "capacity": { "used": totals.total_sessions, "max": capacity_max },
                },
                "servers": servers,
                "loadBalancer": self.balancer.describe(),
                "healthMonitor": self.monitor.describe().await,
                "sessionMapping": self.registry.index_info(),
            }),
        )
    }

    async fn stats(&self) -> Response<Body> {
        let servers = self.registry.stats().await;
        json_response(
            StatusCode::OK,
            json!({
                "ok": true,
                "servers": servers,
                "index": { "entries": self.registry.index().len() },
            }),
        )
    }

    async fn servers(&self) -> Response<Body> {
        let snapshots = self.registry.stats().await;
        let max = self.config.max_sessions_per_server;
        let servers: Vec<Value> = snapshots
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "url": s.url,
                    "status": s.status,
                    "isActive": s.is_active,
                    "sessionCount": s.session_count,
                    "maxSessions": max,
                    "slotsAvailable": max.saturating_sub(s.session_count),
                })
            })
            .collect();
        json_response(
            StatusCode::OK,
            json!({ "ok": true, "count": servers.len(), "servers": servers }),
        )
    }

    /// Capacity view over fresh counts. Never raises: per-backend probe
    /// failures degrade to last-known counts, flagged in `alerts`.
    async fn total_sessions(&self) -> Response<Body> {
        let backends = self.registry.all_backends().to_vec();
        let refreshed = join_all(
            backends
                .iter()
                .map(|backend| self.registry.refresh_backend(backend)),
        )
        .await;

        let mut total = 0usize;
        let mut stale: Vec<String> = Vec::new();
        let mut servers = Vec::new();
        for (backend, outcome) in backends.iter().zip(refreshed) {
            let (count, fresh) = match outcome {
                Ok(snapshot) => (snapshot.session_count, true),
                Err(_) => {
                    stale.push(backend.id.clone());
                    (backend.session_count().await, false)
                }
            };
            total += count;
            servers.push(json!({ "id": backend.id, "sessions": count, "fresh": fresh }));
        }

        let totals = self.registry.totals().await;
        let max_capacity = backends.len() * self.config.max_sessions_per_server;
        let utilization = if max_capacity == 0 {
            0
        } else {
            total * 100 / max_capacity
        };

        let mut alerts = Vec::new();
        if !stale.is_empty() {
            alerts.push(format!(
                "Session counts are stale for: {}",
                stale.join(", ")
            ));
        }

        let mut recommendations = Vec::new();
        if utilization >= 90 {
            recommendations.push("Fleet is above 90% capacity, add servers".to_string());
        }
        if totals.unhealthy_servers > 0 {
            recommendations.push(format!(
                "{} server(s) unhealthy, investigate before adding load",
                totals.unhealthy_servers
            ));
        }
        if recommendations.is_empty() {
            recommendations.push("Capacity is healthy".to_string());
        }

        json_response(
            StatusCode::OK,
            json!({
                "ok": true,
                "summary": {
                    "totalSessions": total,
                    "totalServers": backends.len(),
                    "activeServers": totals.healthy_servers,
                },
                "capacity": {
                    "max": max_capacity,
                    "used": total,
                    "available": max_capacity.saturating_sub(total),
                    "utilizationPercent": utilization,
                },
                "servers": servers,
                "alerts": alerts,
                "recommendations": recommendations,
            }),
        )
    }

    async fn force_check(&self, server_id: &str) -> Response<Body> {
        match self.monitor.check_server(server_id).await {
            Ok(snapshot) => {
                json_response(StatusCode::OK, json!({ "ok": true, "server": snapshot }))
            }
            Err(err) => gateway_error_response(err),
        }
    }

    async fn force_reset(&self, server_id: &str) -> Response<Body> {
        match self.registry.reset_to_healthy(server_id).await {
            Ok(snapshot) => json_response(
                StatusCode::OK,
                json!({
                    "ok": true,
                    "message": "Server reset to healthy",
                    "server": snapshot,
                }),
            ),
            Err(err) => gateway_error_response(err),
        }
    }
}

pub(crate) fn is_valid_number(number: &str) -> bool {
    (6..=15).contains(&number.len()) && number.chars().all(|c| c.is_ascii_digit())
}

pub(crate) fn is_valid_session_id(session_id: &str) -> bool {
    (10..=100).contains(&session_id.len())
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn json_response(status: StatusCode, mut value: Value) -> Response<Body> {
    if let Value::Object(map) = &mut value {
        map.entry("timestamp")
            .or_insert_with(|| Value::String(timestamp()));
    }
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}

fn error_payload(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, json!({ "ok": false, "error": message }))
}

fn session_not_found(session_id: &str) -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        json!({
            "ok": false,
            "found": false,
            "error": format!("Session {session_id} not found on any server"),
            "sessionId": session_id,
        }),
    )
}

/// Surfaces upstream bodies verbatim; everything else gets the gateway's
/// error envelope with a capacity code where one applies.
fn gateway_error_response(err: GatewayError) -> Response<Body> {
    match err {
        GatewayError::Upstream { status, body, .. } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        }
        err => {
            let mut payload = json!({ "ok": false, "error": err.to_string() });
            if let Some(code) = err.code() {
                payload["code"] = json!(code);
            }
            json_response(err.status(), payload)
        }
    }
}

/// Collapses path parameters so metrics cardinality stays bounded.
fn route_label(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [] => "/".to_string(),
        ["pair", _] => "/pair/:number".to_string(),
        ["delete-session", _] => "/delete-session/:sessionId".to_string(),
        ["find-session", _] => "/find-session/:sessionId".to_string(),
        ["health", "check", _] => "/health/check/:serverId".to_string(),
        ["servers", "reset", _] => "/servers/reset/:serverId".to_string(),
        [first] => format!("/{first}"),
        _ => "unknown".to_string(),
    }
}
