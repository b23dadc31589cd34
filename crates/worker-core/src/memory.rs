//! In-memory collaborators for single-node operation and tests

use crate::traits::{Autoscaler, MetadataStore};
use crate::{Error, ModelVariant, Result, WorkerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct MetadataState {
    model_info: HashMap<(ModelVariant, String), String>,
    parents: HashMap<ModelVariant, ModelVariant>,
    running: HashSet<(WorkerId, ModelVariant)>,
    load_unload: HashSet<ModelVariant>,
    scaledown: HashSet<(WorkerId, ModelVariant)>,
    cpu_samples: VecDeque<f64>,
    default_cpu_util: f64,
    add_running_delay: Duration,
}

/// Metadata store kept in process memory.
///
/// CPU utilization can be scripted with [`InMemoryMetadataStore::push_cpu_samples`];
/// once the script runs out, the default utilization is reported.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    state: Mutex<MetadataState>,
    add_running_calls: AtomicUsize,
    remove_running_calls: AtomicUsize,
    cpu_util_calls: AtomicUsize,
    fail_add_running: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variant with its framework and input dimension
    pub fn register_model(&self, variant: &ModelVariant, framework: &str, input_dim: u32) {
        self.set_model_info(variant, crate::traits::FIELD_FRAMEWORK, framework);
        self.set_model_info(variant, crate::traits::FIELD_INPUT_DIM, &input_dim.to_string());
    }

    pub fn set_model_info(&self, variant: &ModelVariant, field: &str, value: &str) {
        self.state
            .lock()
            .model_info
            .insert((variant.clone(), field.to_string()), value.to_string());
    }

    pub fn set_parent(&self, variant: &ModelVariant, parent: &ModelVariant) {
        self.state.lock().parents.insert(variant.clone(), parent.clone());
    }

    /// Mark a parent as pending scale-down on a worker
    pub fn mark_parent_scaledown(&self, worker: &WorkerId, parent: &ModelVariant) {
        self.state
            .lock()
            .scaledown
            .insert((worker.clone(), parent.clone()));
    }

    pub fn is_parent_scaledown(&self, worker: &WorkerId, parent: &ModelVariant) -> bool {
        self.state
            .lock()
            .scaledown
            .contains(&(worker.clone(), parent.clone()))
    }

    pub fn push_cpu_samples(&self, samples: impl IntoIterator<Item = f64>) {
        self.state.lock().cpu_samples.extend(samples);
    }

    pub fn set_default_cpu_util(&self, value: f64) {
        self.state.lock().default_cpu_util = value;
    }

    /// Make the next `add_running_model` calls fail
    pub fn fail_add_running(&self, fail: bool) {
        self.fail_add_running.store(fail, Ordering::SeqCst);
    }

    /// Hold `add_running_model` for `delay` after the record is written
    pub fn delay_after_add_running(&self, delay: Duration) {
        self.state.lock().add_running_delay = delay;
    }

    pub fn running_on(&self, worker: &WorkerId, variant: &ModelVariant) -> bool {
        self.state
            .lock()
            .running
            .contains(&(worker.clone(), variant.clone()))
    }

    pub fn add_running_calls(&self) -> usize {
        self.add_running_calls.load(Ordering::SeqCst)
    }

    pub fn remove_running_calls(&self) -> usize {
        self.remove_running_calls.load(Ordering::SeqCst)
    }

    pub fn cpu_util_calls(&self) -> usize {
        self.cpu_util_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_model_info(&self, variant: &ModelVariant, field: &str) -> Result<String> {
        self.state
            .lock()
            .model_info
            .get(&(variant.clone(), field.to_string()))
            .cloned()
            .ok_or_else(|| Error::upstream(format!("no '{}' recorded for {}", field, variant)))
    }

    async fn add_running_model(&self, worker: &WorkerId, variant: &ModelVariant) -> Result<()> {
        self.add_running_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_add_running.load(Ordering::SeqCst) {
            return Err(Error::upstream(format!(
                "metadata store rejected running record for {}",
                variant
            )));
        }
        let delay = {
            let mut state = self.state.lock();
            state.running.insert((worker.clone(), variant.clone()));
            state.add_running_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn remove_running_model(
        &self,
        worker: &WorkerId,
        variant: &ModelVariant,
    ) -> Result<()> {
        self.remove_running_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .running
            .remove(&(worker.clone(), variant.clone()));
        Ok(())
    }

    async fn is_model_running(&self, variant: &ModelVariant, worker: &WorkerId) -> Result<bool> {
        Ok(self.running_on(worker, variant))
    }

    async fn set_model_load_unload(&self, variant: &ModelVariant) -> Result<()> {
        self.state.lock().load_unload.insert(variant.clone());
        Ok(())
    }

    async fn unset_model_load_unload(&self, variant: &ModelVariant) -> Result<()> {
        self.state.lock().load_unload.remove(variant);
        Ok(())
    }

    async fn is_model_load_unload(&self, variant: &ModelVariant) -> Result<bool> {
        Ok(self.state.lock().load_unload.contains(variant))
    }

    async fn get_parent_model(&self, variant: &ModelVariant) -> Result<ModelVariant> {
        Ok(self
            .state
            .lock()
            .parents
            .get(variant)
            .cloned()
            .unwrap_or_else(|| variant.clone()))
    }

    async fn unset_parent_scaledown(
        &self,
        worker: &WorkerId,
        parent: &ModelVariant,
    ) -> Result<()> {
        self.state
            .lock()
            .scaledown
            .remove(&(worker.clone(), parent.clone()));
        Ok(())
    }

    async fn get_cpu_util(&self, _worker: &WorkerId) -> Result<f64> {
        self.cpu_util_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let default = state.default_cpu_util;
        Ok(state.cpu_samples.pop_front().unwrap_or(default))
    }
}

/// Autoscaler counters kept in memory
#[derive(Debug, Default)]
pub struct InMemoryAutoscaler {
    avg_batch: Mutex<HashMap<ModelVariant, f64>>,
}

impl InMemoryAutoscaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn avg_batch(&self, variant: &ModelVariant) -> Option<f64> {
        self.avg_batch.lock().get(variant).copied()
    }
}

impl Autoscaler for InMemoryAutoscaler {
    fn set_avg_batch(&self, variant: &ModelVariant, value: f64) {
        self.avg_batch.lock().insert(variant.clone(), value);
    }
}
