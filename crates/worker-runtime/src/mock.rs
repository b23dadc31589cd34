//! In-process backend used for local development and tests
//!
//! Records every call, echoes online inputs, and answers offline batches by
//! writing one output file per input into the job's scratch output directory.

use crate::backend::{Backend, LaunchHandle, LaunchSpec, OfflineBatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use worker_core::{BackendKind, Error, InstanceName, ModelVariant, PathsConfig, Result};
use worker_proto::{QueryOfflineResponse, QueryOnlineRequest, QueryOnlineResponse, RequestStatus};

#[derive(Debug, Default)]
struct MockState {
    starts: Vec<LaunchSpec>,
    stops: Vec<InstanceName>,
    running: HashSet<InstanceName>,
    probes: HashMap<u16, u32>,
    online_ports: Vec<u16>,
    offline_batches: Vec<usize>,
}

#[derive(Debug)]
pub struct MockBackend {
    kind: BackendKind,
    ready_after: u32,
    start_delay: Duration,
    stop_delay: Duration,
    scratch: Option<(PathBuf, PathBuf)>,
    fail_start: AtomicBool,
    fail_offline_status: AtomicBool,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            ready_after: 1,
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            scratch: None,
            fail_start: AtomicBool::new(false),
            fail_offline_status: AtomicBool::new(false),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Report ready on the `probes`-th probe of a port; 0 never becomes ready
    pub fn ready_after(mut self, probes: u32) -> Self {
        self.ready_after = probes;
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Scratch directories offline batches read from and write to
    pub fn with_scratch(mut self, paths: &PathsConfig) -> Self {
        self.scratch = Some((paths.input_dir.clone(), paths.output_dir.clone()));
        self
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_offline_status(&self, fail: bool) {
        self.fail_offline_status.store(fail, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().starts.len()
    }

    pub fn starts(&self) -> Vec<LaunchSpec> {
        self.state.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<InstanceName> {
        self.state.lock().stops.clone()
    }

    pub fn is_running(&self, instance: &InstanceName) -> bool {
        self.state.lock().running.contains(instance)
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Ports online queries were sent to, in order
    pub fn online_ports(&self) -> Vec<u16> {
        self.state.lock().online_ports.clone()
    }

    /// Sizes of offline batches, in order
    pub fn offline_batches(&self) -> Vec<usize> {
        self.state.lock().offline_batches.clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<LaunchHandle> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        let mut state = self.state.lock();
        state.starts.push(spec.clone());
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::launch_failure(format!(
                "mock refused to start {}",
                spec.instance
            )));
        }
        if !state.running.insert(spec.instance.clone()) {
            return Err(Error::launch_failure(format!(
                "container name {} already in use",
                spec.instance
            )));
        }
        state.probes.insert(spec.port, 0);
        Ok(LaunchHandle {
            instance: spec.instance.clone(),
            container_id: format!("mock-{}-{}", spec.instance, state.starts.len()),
            port: spec.port,
        })
    }

    async fn stop(&self, instance: &InstanceName) -> Result<()> {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        let mut state = self.state.lock();
        state.stops.push(instance.clone());
        state.running.remove(instance);
        Ok(())
    }

    async fn probe_ready(&self, _variant: &ModelVariant, port: u16) -> Result<bool> {
        let mut state = self.state.lock();
        let probes = state.probes.entry(port).or_insert(0);
        *probes += 1;
        Ok(self.ready_after != 0 && *probes >= self.ready_after)
    }

    async fn query_online(
        &self,
        _variant: &ModelVariant,
        port: u16,
        request: QueryOnlineRequest,
    ) -> Result<QueryOnlineResponse> {
        self.state.lock().online_ports.push(port);
        Ok(QueryOnlineResponse {
            raw_output: request.raw_input,
            status: Some(RequestStatus::success()),
        })
    }

    async fn query_offline(&self, _port: u16, batch: &OfflineBatch) -> Result<QueryOfflineResponse> {
        self.state.lock().offline_batches.push(batch.inputs.len());
        if self.fail_offline_status.load(Ordering::SeqCst) {
            return Ok(QueryOfflineResponse {
                status: Some(RequestStatus::failure("mock rejected batch")),
            });
        }

        if let Some((input_base, output_base)) = &self.scratch {
            let input_dir = input_base.join(batch.job.as_str()).join("infer");
            let output_dir = output_base.join(batch.job.as_str());
            for name in &batch.inputs {
                let data = tokio::fs::read(input_dir.join(name)).await.map_err(|e| {
                    Error::upstream(format!("mock backend cannot read input {}: {}", name, e))
                })?;
                tokio::fs::write(output_dir.join(format!("{}.out", name)), data).await?;
            }
        }
        Ok(QueryOfflineResponse {
            status: Some(RequestStatus::success()),
        })
    }
}
