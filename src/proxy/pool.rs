//
// src/proxy/pool.rs
//

use super::backend::Backend;
use crate::config::ProbeConfig;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Result of one sweep over the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub available: usize,
    pub online: usize,
    pub total: usize,
}

/// The fixed set of license servers, in configuration order.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    last_sweep: ArcSwapOption<DateTime<Utc>>,
    sweep_interval: Duration,
    probe: ProbeConfig,
    client: reqwest::Client,
}

impl BackendPool {
    pub fn new(
        endpoints: Vec<Url>,
        sweep_interval: Duration,
        probe: ProbeConfig,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("license-proxy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let backends = endpoints
            .into_iter()
            .map(|url| Arc::new(Backend::new(url)))
            .collect();

        Ok(Self {
            backends,
            last_sweep: ArcSwapOption::empty(),
            sweep_interval,
            probe,
            client,
        })
    }

    /// Backends in configuration order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Start time of the most recent sweep.
    pub fn last_sweep(&self) -> Option<DateTime<Utc>> {
        self.last_sweep.load_full().map(|at| *at)
    }

    /// Probes every backend concurrently and waits for all of them.
    pub async fn run_sweep(&self) -> SweepSummary {
        self.last_sweep.store(Some(Arc::new(Utc::now())));

        let tasks = self.backends.iter().map(|backend| {
            let backend = backend.clone();
            let client = self.client.clone();
            let probe = self.probe.clone();
            tokio::spawn(async move { backend.check(&client, &probe).await })
        });

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("Probe task join error: {}", e);
            }
        }

        let summary = SweepSummary {
            available: self.backends.iter().filter(|b| b.is_available()).count(),
            online: self.backends.iter().filter(|b| b.is_online()).count(),
            total: self.backends.len(),
        };

        tracing::info!(
            "Sweep complete: {}/{} available, {} online",
            summary.available,
            summary.total,
            summary.online
        );

        summary
    }

    /// Available backends, fastest first.
    pub fn available_ranked(&self) -> Vec<Arc<Backend>> {
        rank(self.backends.iter().filter(|b| b.is_available()))
    }

    /// Every backend, fastest first.
    pub fn all_ranked(&self) -> Vec<Arc<Backend>> {
        rank(self.backends.iter())
    }

    pub fn best(&self) -> Option<Arc<Backend>> {
        self.available_ranked().into_iter().next()
    }

    /// Seconds a client should wait before the next sweep has a chance of
    /// finding a backend; 0 before the first sweep.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let Some(last) = self.last_sweep() else {
            return 0;
        };
        let interval_ms = i64::try_from(self.sweep_interval.as_millis()).unwrap_or(i64::MAX);
        let wait_ms = (now - last).num_milliseconds().saturating_add(interval_ms);
        (wait_ms.max(0) as f64 / 1000.0).round() as u64
    }
}

// Latencies are read once so concurrent updates cannot upset the sort.
fn rank<'a>(backends: impl Iterator<Item = &'a Arc<Backend>>) -> Vec<Arc<Backend>> {
    let mut keyed: Vec<(u64, Arc<Backend>)> = backends
        .map(|backend| (backend.last_latency_ms(), backend.clone()))
        .collect();
    // stable: equal latencies keep configuration order
    keyed.sort_by_key(|(latency, _)| *latency);
    keyed.into_iter().map(|(_, backend)| backend).collect()
}
