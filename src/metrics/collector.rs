// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);
        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("failed to encode metrics: {err}");
        }
        buffer
    }
}

pub struct MetricsCollector {
    // Inbound surface
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,

    // Upstream traffic
    pub upstream_requests_total: IntCounterVec,
    pub upstream_request_duration_seconds: HistogramVec,

    // Fleet state
    pub backend_health_status: IntGaugeVec,
    pub backend_sessions: IntGaugeVec,
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
    pub session_index_entries: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total inbound requests"),
            &["route", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Inbound request duration in seconds",
            ),
            &["route"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let upstream_requests_total = IntCounterVec::new(
            Opts::new(
                "gateway_upstream_requests_total",
                "Total forwarded upstream attempts",
            ),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(upstream_requests_total.clone()))?;

        let upstream_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_upstream_request_duration_seconds",
                "Upstream attempt duration in seconds",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(upstream_request_duration_seconds.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "gateway_backend_health_status",
                "Backend health (1=healthy, 0=full or unhealthy)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let backend_sessions = IntGaugeVec::new(
            Opts::new(
                "gateway_backend_sessions",
                "Last observed session count per backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_sessions.clone()))?;

        let healthy_backends =
            IntGauge::new("gateway_healthy_backends", "Number of healthy backends")?;
        registry.register(Box::new(healthy_backends.clone()))?;

        let total_backends =
            IntGauge::new("gateway_total_backends", "Total configured backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        let session_index_entries = IntGauge::new(
            "gateway_session_index_entries",
            "Entries in the session index",
        )?;
        registry.register(Box::new(session_index_entries.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            upstream_requests_total,
            upstream_request_duration_seconds,
            backend_health_status,
            backend_sessions,
            healthy_backends,
            total_backends,
            session_index_entries,
        })
    }

    pub fn record_request(&self, route: &str, status_code: u16, duration: std::time::Duration) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[route, &status])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    pub fn record_upstream(&self, backend: &str, success: bool, duration: std::time::Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.upstream_requests_total
            .with_label_values(&[backend, outcome])
            .inc();
        self.upstream_request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn update_backend(&self, backend: &str, active: bool, sessions: usize) {
        self.backend_health_status
            .with_label_values(&[backend])
            .set(if active { 1 } else { 0 });
        self.backend_sessions
            .with_label_values(&[backend])
            .set(sessions as i64);
    }

    pub fn update_fleet(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }

    pub fn update_index_size(&self, entries: usize) {
        self.session_index_entries.set(entries as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_exposes_recorded_series() {
        let metrics = MetricsRegistry::new().unwrap();
        let collector = metrics.collector();
        collector.record_request("/pair/:number", 200, std::time::Duration::from_millis(3));
        collector.update_fleet(2, 3);

        let text = String::from_utf8(metrics.gather()).unwrap();
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("gateway_healthy_backends 2"));
    }
}
