// src/health/checker.rs
use crate::metrics::MetricsCollector;
use crate::proxy::{BackendPool, SweepSummary};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Drives the periodic sweep over a [`BackendPool`].
pub struct HealthChecker {
    pool: Arc<BackendPool>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(pool: Arc<BackendPool>, metrics: Option<Arc<MetricsCollector>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            pool,
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Runs one sweep now and logs availability changes.
    pub async fn sweep(&self) -> SweepSummary {
        let before: Vec<bool> = self.pool.backends().iter().map(|b| b.is_available()).collect();

        let summary = self.pool.run_sweep().await;

        for (backend, was_available) in self.pool.backends().iter().zip(before) {
            match (was_available, backend.is_available()) {
                (false, true) => info!(
                    "Backend {} is now available ({} ms)",
                    backend.endpoint(),
                    backend.last_latency_ms()
                ),
                (true, false) => warn!(
                    "Backend {} is no longer available: {}",
                    backend.endpoint(),
                    backend.last_status()
                ),
                _ => {}
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_sweep(&self.pool);
        }

        summary
    }

    /// Sweeps every interval until [`shutdown`](Self::shutdown). The first
    /// tick fires one full interval after the call, the initial sweep being
    /// the caller's job.
    pub async fn start(self: Arc<Self>) {
        let period = self.pool.sweep_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!("Starting health checker with interval: {:?}", period);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Health checker shutting down");
    }

    /// Stops the periodic sweep. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
