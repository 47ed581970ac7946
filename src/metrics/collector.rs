// src/metrics/collector.rs
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

use crate::proxy::BackendPool;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
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

    pub fn gather(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Sweep metrics
    pub sweeps_total: IntCounter,
    pub probes_total: IntCounterVec,
    pub backend_available: IntGaugeVec,
    pub backend_latency_ms: IntGaugeVec,
    pub available_backends: IntGauge,
    pub total_backends: IntGauge,

    // Front door metrics
    pub requests_total: IntCounterVec,
    pub upstream_duration_seconds: HistogramVec,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sweeps_total =
            IntCounter::new("license_proxy_sweeps_total", "Completed sweeps over the pool")?;
        registry.register(Box::new(sweeps_total.clone()))?;

        let probes_total = IntCounterVec::new(
            Opts::new("license_proxy_probes_total", "Probe outcomes per backend"),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let backend_available = IntGaugeVec::new(
            Opts::new(
                "license_proxy_backend_available",
                "Backend availability (1=available, 0=not)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_available.clone()))?;

        let backend_latency_ms = IntGaugeVec::new(
            Opts::new(
                "license_proxy_backend_latency_ms",
                "Last measured backend round trip in milliseconds",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_latency_ms.clone()))?;

        let available_backends = IntGauge::new(
            "license_proxy_available_backends",
            "Number of available backends",
        )?;
        registry.register(Box::new(available_backends.clone()))?;

        let total_backends =
            IntGauge::new("license_proxy_total_backends", "Number of configured backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        let requests_total = IntCounterVec::new(
            Opts::new("license_proxy_requests_total", "Front door requests"),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let upstream_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "license_proxy_upstream_duration_seconds",
                "Time until the backend produced a response",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(upstream_duration_seconds.clone()))?;

        Ok(Self {
            sweeps_total,
            probes_total,
            backend_available,
            backend_latency_ms,
            available_backends,
            total_backends,
            requests_total,
            upstream_duration_seconds,
        })
    }

    pub fn record_sweep(&self, pool: &BackendPool) {
        self.sweeps_total.inc();

        let mut available = 0;
        for backend in pool.backends() {
            let id = backend.endpoint().as_str();
            let outcome = if backend.is_available() {
                available += 1;
                "available"
            } else if backend.is_online() {
                "unavailable"
            } else {
                "offline"
            };

            self.probes_total.with_label_values(&[id, outcome]).inc();
            self.backend_available
                .with_label_values(&[id])
                .set(i64::from(backend.is_available()));
            self.backend_latency_ms
                .with_label_values(&[id])
                .set(i64::try_from(backend.last_latency_ms()).unwrap_or(i64::MAX));
        }

        self.available_backends.set(available);
        self.total_backends.set(pool.backends().len() as i64);
    }

    pub fn record_request(&self, route: &str, status_code: u16) {
        self.requests_total
            .with_label_values(&[route, &status_code.to_string()])
            .inc();
    }

    pub fn record_upstream(&self, backend: &str, duration: Duration) {
        self.upstream_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }
}
