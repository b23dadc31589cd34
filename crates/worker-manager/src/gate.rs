//! System-load admission gate for offline batches

use crate::metrics::ManagerMetrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use worker_core::{MetadataStore, OfflineConfig, ResourceBlacklist, Result, WorkerId};
use worker_runtime::{cancellable, sleep_or_cancel};

/// What the gate observed before letting a batch through
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateReport {
    /// Utilization samples taken, including the passing one
    pub samples: u32,
    /// Utilization of the passing sample
    pub utilization: f64,
    pub waited: Duration,
}

/// Holds offline work back while the worker's CPU is busy.
///
/// Waits without bound; only cancellation ends a wait early.
pub struct LoadGate {
    metadata: Arc<dyn MetadataStore>,
    blacklist: Arc<dyn ResourceBlacklist>,
    worker: WorkerId,
    enabled: bool,
    threshold: f64,
    interval: Duration,
    last_sample: Mutex<Option<f64>>,
    metrics: Option<ManagerMetrics>,
}

impl LoadGate {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blacklist: Arc<dyn ResourceBlacklist>,
        worker: WorkerId,
        config: &OfflineConfig,
    ) -> Self {
        Self {
            metadata,
            blacklist,
            worker,
            enabled: config.gate_enabled,
            threshold: config.cpu_threshold,
            interval: config.gate_interval(),
            last_sample: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ManagerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn last_sample(&self) -> Option<f64> {
        *self.last_sample.lock()
    }

    /// Wait until utilization is at or below the threshold and no resource is
    /// blacklisted
    pub async fn wait_for_capacity(&self, cancel: &CancellationToken) -> Result<GateReport> {
        let started = Instant::now();
        if !self.enabled {
            return Ok(GateReport {
                samples: 0,
                utilization: self.last_sample().unwrap_or_default(),
                waited: Duration::ZERO,
            });
        }

        let mut samples = 0;
        loop {
            let utilization =
                cancellable(cancel, "load gate", self.metadata.get_cpu_util(&self.worker)).await?;
            samples += 1;
            *self.last_sample.lock() = Some(utilization);
            if let Some(metrics) = &self.metrics {
                metrics
                    .gate_cpu_utilization
                    .with_label_values(&[self.worker.as_str()])
                    .set(utilization);
            }

            let blacklisted = self.blacklist.has_blacklisted();
            if utilization <= self.threshold && !blacklisted {
                return Ok(GateReport {
                    samples,
                    utilization,
                    waited: started.elapsed(),
                });
            }
            debug!(
                utilization,
                threshold = self.threshold,
                blacklisted,
                "Offline batch held back"
            );
            sleep_or_cancel(cancel, self.interval, "load gate").await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use worker_core::{Error, InMemoryMetadataStore, NoBlacklist};

    fn gate(metadata: Arc<InMemoryMetadataStore>, blacklist: Arc<dyn ResourceBlacklist>) -> LoadGate {
        LoadGate::new(
            metadata,
            blacklist,
            WorkerId::new("worker-1"),
            &OfflineConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_low_utilization() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata.push_cpu_samples([90.0, 75.0, 41.0, 12.0]);
        let gate = gate(metadata.clone(), Arc::new(NoBlacklist));

        let report = gate.wait_for_capacity(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.samples, 4);
        assert_eq!(report.utilization, 12.0);
        assert_eq!(report.waited, Duration::from_secs(3));
        assert_eq!(metadata.cpu_util_calls(), 4);
        assert_eq!(gate.last_sample(), Some(12.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_is_inclusive() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata.push_cpu_samples([40.0]);
        let gate = gate(metadata, Arc::new(NoBlacklist));
        let report = gate.wait_for_capacity(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.samples, 1);
    }

    struct Toggle(AtomicBool);

    impl ResourceBlacklist for Toggle {
        fn has_blacklisted(&self) -> bool {
            // Blacklisted for the first check only.
            self.0.swap(false, Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklist_holds_batches() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let gate = gate(metadata, Arc::new(Toggle(AtomicBool::new(true))));
        let report = gate.wait_for_capacity(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.samples, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_unbounded_wait() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata.set_default_cpu_util(95.0);
        let gate = gate(metadata, Arc::new(NoBlacklist));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            trigger.cancel();
        });

        let err = gate.wait_for_capacity(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_disabled_gate_passes_immediately() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata.set_default_cpu_util(99.0);
        let config = OfflineConfig {
            gate_enabled: false,
            ..Default::default()
        };
        let gate = LoadGate::new(
            metadata.clone(),
            Arc::new(NoBlacklist),
            WorkerId::new("worker-1"),
            &config,
        );
        let report = gate.wait_for_capacity(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.samples, 0);
        assert_eq!(metadata.cpu_util_calls(), 0);
    }
}
