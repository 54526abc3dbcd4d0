// src/health/monitor.rs
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics::MetricsCollector;
use crate::registry::{BackendSnapshot, ServerRegistry};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Periodic probe loop over the whole fleet. One sweep probes every backend
/// in parallel; individual failures never abort the sweep.
pub struct HealthMonitor {
    registry: Arc<ServerRegistry>,
    metrics: Arc<MetricsCollector>,
    interval_ms: u64,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    sweeps: AtomicU64,
    last_sweep_at: RwLock<Option<DateTime<Utc>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        metrics: Arc<MetricsCollector>,
        config: &Config,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            registry,
            metrics,
            interval_ms: config.health_check_interval_ms,
            running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            sweeps: AtomicU64::new(0),
            last_sweep_at: RwLock::new(None),
        })
    }

    /// Idempotent: a second start warns and is a no-op. Runs one immediate
    /// sweep, then one every `HEALTH_CHECK_INTERVAL` until `stop()`.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("health monitor already running, start ignored");
            return;
        }

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(monitor.interval_ms));
            let mut shutdown_rx = monitor.shutdown_rx.clone();
            info!(
                "starting health monitor, interval {}ms",
                monitor.interval_ms
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        monitor.sweep().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("health monitor shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Prevents further scheduling. In-flight probes run to completion or
    /// timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One pass across all backends, in parallel.
    pub async fn sweep(&self) {
        let backends = self.registry.all_backends().to_vec();
        let checks: Vec<_> = backends
            .iter()
            .map(|backend| {
                let registry = self.registry.clone();
                let backend = backend.clone();
                tokio::spawn(async move {
                    let outcome = registry.refresh_backend(&backend).await;
                    (backend, outcome)
                })
            })
            .collect();

        let mut healthy = 0usize;
        let mut degraded = 0usize;
        for joined in join_all(checks).await {
            match joined {
                Ok((backend, Ok(snapshot))) => {
                    if snapshot.is_active {
                        healthy += 1;
                    } else {
                        degraded += 1;
                    }
                    debug!(
                        backend = %backend.id,
                        status = snapshot.status.as_str(),
                        sessions = snapshot.session_count,
                        "probe ok"
                    );
                }
                Ok((backend, Err(err))) => {
                    degraded += 1;
                    warn!(backend = %backend.id, "health check failed: {err}");
                }
                Err(err) => {
                    degraded += 1;
                    error!("health check task failed: {err}");
                }
            }
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        *self.last_sweep_at.write().await = Some(Utc::now());
        self.refresh_gauges().await;
        info!("health sweep complete: {healthy} healthy, {degraded} degraded");
    }

    /// Single targeted probe. The backend is returned after the update even
    /// when the probe failed; only an unknown id raises.
    pub async fn check_server(&self, id: &str) -> Result<BackendSnapshot, GatewayError> {
        let backend = self
            .registry
            .get(id)
            .ok_or_else(|| GatewayError::UnknownBackend(id.to_string()))?;
        if let Err(err) = self.registry.refresh_backend(&backend).await {
            debug!(backend = %backend.id, "forced probe failed: {err}");
        }
        Ok(backend.snapshot().await)
    }

    async fn refresh_gauges(&self) {
        let mut healthy = 0usize;
        let backends = self.registry.all_backends();
        for backend in backends {
            let snapshot = backend.snapshot().await;
            if snapshot.is_active {
                healthy += 1;
            }
            self.metrics
                .update_backend(&backend.id, snapshot.is_active, snapshot.session_count);
        }
        self.metrics.update_fleet(healthy, backends.len());
        self.metrics.update_index_size(self.registry.index().len());
    }

    pub async fn describe(&self) -> Value {
        json!({
            "running": self.is_running(),
            "intervalMs": self.interval_ms,
            "sweeps": self.sweeps.load(Ordering::Relaxed),
            "lastSweepAt": self
                .last_sweep_at
                .read()
                .await
                .map(|t| t.to_rfc3339()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::metrics::MetricsRegistry;
    use crate::registry::BackendStatus;
    use serde_json::json;

    fn test_config(backends: Vec<&str>, max_sessions: usize) -> Arc<Config> {
        Arc::new(Config {
            port: 0,
            backend_servers: backends.iter().map(|b| b.parse().unwrap()).collect(),
            max_sessions_per_server: max_sessions,
            request_timeout_ms: 2000,
            health_check_interval_ms: 50,
            session_cache_ttl_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 10,
            pair_trailing_slash: true,
            metrics: MetricsConfig::default(),
        })
    }

    fn monitor_for(config: &Arc<Config>) -> (Arc<ServerRegistry>, Arc<HealthMonitor>) {
        let registry = Arc::new(ServerRegistry::from_config(config));
        let metrics = MetricsRegistry::new().unwrap().collector();
        let monitor = HealthMonitor::new(registry.clone(), metrics, config);
        (registry, monitor)
    }

    fn sessions_body(n: usize) -> String {
        let sessions: Vec<serde_json::Value> = (0..n)
            .map(|i| json!({ "id": format!("sess-{:04}", i) }))
            .collect();
        json!({ "sessions": sessions }).to_string()
    }

    #[tokio::test]
    async fn sweep_updates_every_backend() {
        let mut healthy_server = mockito::Server::new_async().await;
        healthy_server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(3))
            .create_async()
            .await;
        let mut failing_server = mockito::Server::new_async().await;
        failing_server
            .mock("GET", "/sessions")
            .with_status(503)
            .with_body(r#"{"error":"maintenance"}"#)
            .create_async()
            .await;

        let config = test_config(
            vec![healthy_server.url().as_str(), failing_server.url().as_str()],
            25,
        );
        let (registry, monitor) = monitor_for(&config);

        monitor.sweep().await;

        let a = registry.get("server-1").unwrap();
        let b = registry.get("server-2").unwrap();
        assert_eq!(a.status().await, BackendStatus::Healthy);
        assert_eq!(a.session_count().await, 3);
        assert_eq!(b.status().await, BackendStatus::Unhealthy);
    }

    #[tokio::test]
    async fn sweep_marks_full_at_threshold() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(2))
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 2);
        let (registry, monitor) = monitor_for(&config);

        monitor.sweep().await;
        assert_eq!(
            registry.get("server-1").unwrap().status().await,
            BackendStatus::Full
        );
    }

    #[tokio::test]
    async fn check_server_rejects_unknown_ids() {
        let config = test_config(vec!["http://127.0.0.1:9"], 25);
        let (_registry, monitor) = monitor_for(&config);

        let err = monitor.check_server("server-42").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownBackend(_)));
    }

    #[tokio::test]
    async fn check_server_returns_the_backend_even_on_probe_failure() {
        let config = test_config(vec!["http://127.0.0.1:9"], 25);
        let (_registry, monitor) = monitor_for(&config);

        let snapshot = monitor.check_server("server-1").await.unwrap();
        assert_eq!(snapshot.status, BackendStatus::Unhealthy);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_halts_scheduling() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions")
            .with_status(200)
            .with_body(sessions_body(0))
            .create_async()
            .await;

        let config = test_config(vec![server.url().as_str()], 25);
        let (_registry, monitor) = monitor_for(&config);

        monitor.start();
        monitor.start(); // warns, no second loop
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.stop();
        assert!(!monitor.is_running());

        // let any in-flight sweep run to completion
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sweeps_at_stop = monitor.sweeps.load(Ordering::Relaxed);
        assert!(sweeps_at_stop >= 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(monitor.sweeps.load(Ordering::Relaxed), sweeps_at_stop);
    }
}
