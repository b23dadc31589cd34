//! Prometheus metrics of the instance manager

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts};

/// Metrics for instance lifecycle and query routing
#[derive(Debug, Clone)]
pub struct ManagerMetrics {
    /// Load attempts by outcome (loaded, in_progress, failed)
    pub loads_total: CounterVec,

    /// Unload attempts by outcome (unloaded, already_unloaded, failed)
    pub unloads_total: CounterVec,

    /// Time from reservation to a servable instance
    pub load_duration_seconds: HistogramVec,

    /// Instances currently in each pool
    pub pooled_instances: GaugeVec,

    /// Online queries forwarded to a backend
    pub dispatches_total: CounterVec,

    /// Offline batches by outcome (success, rejected, failed)
    pub offline_batches_total: CounterVec,

    /// Last CPU utilization sampled by the load gate
    pub gate_cpu_utilization: GaugeVec,
}

impl ManagerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            loads_total: CounterVec::new(
                Opts::new("worker_instance_loads_total", "Instance load attempts"),
                &["variant", "mode", "outcome"],
            )?,
            unloads_total: CounterVec::new(
                Opts::new("worker_instance_unloads_total", "Instance unload attempts"),
                &["variant", "mode", "outcome"],
            )?,
            load_duration_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "worker_instance_load_duration_seconds",
                    "Time to bring an instance up",
                )
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
                &["variant", "backend"],
            )?,
            pooled_instances: GaugeVec::new(
                Opts::new("worker_pooled_instances", "Instances in each pool"),
                &["variant", "mode"],
            )?,
            dispatches_total: CounterVec::new(
                Opts::new("worker_dispatches_total", "Online queries forwarded"),
                &["variant", "backend", "outcome"],
            )?,
            offline_batches_total: CounterVec::new(
                Opts::new("worker_offline_batches_total", "Offline batches processed"),
                &["variant", "outcome"],
            )?,
            gate_cpu_utilization: GaugeVec::new(
                Opts::new("worker_gate_cpu_utilization", "CPU utilization seen by the load gate"),
                &["worker"],
            )?,
        })
    }

    /// Register all metrics with the given registry
    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.loads_total.clone()))?;
        registry.register(Box::new(self.unloads_total.clone()))?;
        registry.register(Box::new(self.load_duration_seconds.clone()))?;
        registry.register(Box::new(self.pooled_instances.clone()))?;
        registry.register(Box::new(self.dispatches_total.clone()))?;
        registry.register(Box::new(self.offline_batches_total.clone()))?;
        registry.register(Box::new(self.gate_cpu_utilization.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let metrics = ManagerMetrics::new().unwrap();
        let registry = prometheus::Registry::new();
        metrics.register(&registry).unwrap();

        metrics
            .loads_total
            .with_label_values(&["resnet50_4", "online", "loaded"])
            .inc();
        metrics
            .pooled_instances
            .with_label_values(&["resnet50_4", "online"])
            .set(2.0);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"worker_instance_loads_total".to_string()));
        assert!(names.contains(&"worker_pooled_instances".to_string()));
    }

    #[test]
    fn test_double_registration_fails() {
        let metrics = ManagerMetrics::new().unwrap();
        let registry = prometheus::Registry::new();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}
