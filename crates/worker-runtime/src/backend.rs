//! Backend interface and registry
//!
//! A backend knows how to start, probe, query and stop instances of one
//! [`BackendKind`]. The pool looks backends up in a [`BackendRegistry`].

use crate::container::ContainerRuntime;
use crate::readiness::{poll_until, ReadinessPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use worker_core::{
    BackendKind, ContainerConfig, Error, InstanceName, ModelVariant, PathsConfig, Result,
    ServingMode,
};
use worker_proto::{QueryOfflineResponse, QueryOnlineRequest, QueryOnlineResponse};

/// Everything a backend needs to start one instance
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub variant: ModelVariant,
    pub instance: InstanceName,
    pub port: u16,
    pub mode: ServingMode,
    /// CPU cores the instance may use
    pub cpu_limit: f32,
    /// Input image dimension, required by image backends
    pub input_dim: Option<u32>,
    /// Staged artifacts of the variant
    pub model_dir: PathBuf,
}

/// Handle of a started instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchHandle {
    pub instance: InstanceName,
    pub container_id: String,
    pub port: u16,
}

/// One batch of an offline job
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineBatch {
    pub variant: ModelVariant,
    /// Job name, also the scratch directory name
    pub job: InstanceName,
    pub submitter: String,
    /// File names of the batch inside the job's input directory
    pub inputs: Vec<String>,
}

/// Backend implementation for one backend kind
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start an instance bound to `spec.port`
    async fn start(&self, spec: &LaunchSpec) -> Result<LaunchHandle>;

    /// Stop an instance. Stopping an absent instance succeeds.
    async fn stop(&self, instance: &InstanceName) -> Result<()>;

    /// Single readiness probe
    async fn probe_ready(&self, variant: &ModelVariant, port: u16) -> Result<bool>;

    /// Probe until ready; returns the number of probes it took
    async fn await_ready(
        &self,
        variant: &ModelVariant,
        port: u16,
        policy: ReadinessPolicy,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let what = format!("{} backend of {} on port {}", self.kind(), variant, port);
        poll_until(policy, cancel, &what, || self.probe_ready(variant, port)).await
    }

    async fn query_online(
        &self,
        variant: &ModelVariant,
        port: u16,
        request: QueryOnlineRequest,
    ) -> Result<QueryOnlineResponse>;

    async fn query_offline(&self, port: u16, batch: &OfflineBatch) -> Result<QueryOfflineResponse>;
}

/// Backends by kind
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the container backends of every supported kind
    pub fn with_containers(config: &ContainerConfig, paths: &PathsConfig) -> Self {
        let containers = Arc::new(ContainerRuntime::new(config));
        Self::new()
            .with(Arc::new(crate::pytorch::PyTorchBackend::new(
                containers.clone(),
                config.clone(),
                paths.clone(),
            )))
            .with(Arc::new(crate::tfserving::TfServingBackend::new(
                containers.clone(),
                config.clone(),
            )))
            .with(Arc::new(crate::gnmt::GnmtBackend::new(containers, config.clone())))
    }

    /// Register a backend, replacing any backend of the same kind
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        self.backends.insert(backend.kind(), backend)
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::unsupported(format!("no backend registered for {}", kind)))
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    #[test]
    fn test_registry_lookup() {
        let registry = BackendRegistry::new().with(Arc::new(MockBackend::new(BackendKind::PyTorch)));
        assert!(registry.get(BackendKind::PyTorch).is_ok());
        assert!(matches!(
            registry.get(BackendKind::Gnmt),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_container_registry_covers_every_kind() {
        let registry = BackendRegistry::with_containers(&ContainerConfig::default(), &PathsConfig::default());
        for kind in BackendKind::all() {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_uses_probe() {
        let backend = MockBackend::new(BackendKind::PyTorch).ready_after(3);
        let variant = ModelVariant::new("resnet50_4").unwrap();
        let policy = ReadinessPolicy::new(std::time::Duration::from_millis(100), 5);

        let attempts = backend
            .await_ready(&variant, 9001, policy, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempts, 3);
    }
}
