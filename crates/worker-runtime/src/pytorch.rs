//! PyTorch backend: a serving container spoken to over the binary RPC protocol

use crate::backend::{Backend, LaunchHandle, LaunchSpec, OfflineBatch};
use crate::container::{ContainerRuntime, ContainerSpec};
use crate::grpc::GrpcTransport;
use crate::readiness::ReadinessPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use worker_core::{
    BackendKind, ContainerConfig, Error, InstanceName, ModelVariant, PathsConfig, Result,
};
use worker_proto::{QueryOfflineRequest, QueryOfflineResponse, QueryOnlineRequest, QueryOnlineResponse};

/// Polling used while a previous container of the same name disappears
pub(crate) const NAME_RELEASE_POLICY: ReadinessPolicy = ReadinessPolicy {
    interval: Duration::from_millis(500),
    max_attempts: 20,
};

pub struct PyTorchBackend {
    containers: Arc<ContainerRuntime>,
    config: ContainerConfig,
    paths: PathsConfig,
    rpc: GrpcTransport,
}

impl PyTorchBackend {
    pub fn new(containers: Arc<ContainerRuntime>, config: ContainerConfig, paths: PathsConfig) -> Self {
        Self {
            containers,
            config,
            paths,
            rpc: GrpcTransport::default(),
        }
    }

    pub fn container_spec(&self, spec: &LaunchSpec) -> Result<ContainerSpec> {
        let input_dim = spec.input_dim.ok_or_else(|| {
            Error::invalid_argument(format!("{} has no input dimension recorded", spec.variant))
        })?;
        let nice = if self.config.offline_nice && !spec.mode.is_online() {
            "ON"
        } else {
            "OFF"
        };

        Ok(ContainerSpec::new(spec.instance.as_str(), &self.config.pytorch_image)
            .publish(spec.port, spec.port)
            .cpus(spec.cpu_limit)
            .flag("--ipc=host")
            .flag("--cap-add=sys_nice")
            .env("OFFLINENICE", nice)
            .volume(&spec.model_dir, &self.config.model_mount)
            .volume(&self.paths.input_dir, &self.config.input_mount)
            .volume(&self.paths.output_dir, &self.config.output_mount)
            .arg("workspace/containerstart.sh")
            .arg("pytorchcontainer.py")
            .arg(input_dim.to_string())
            .arg(spec.variant.as_str())
            .arg(spec.port.to_string()))
    }
}

#[async_trait]
impl Backend for PyTorchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PyTorch
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<LaunchHandle> {
        let container = self.container_spec(spec)?;
        self.containers
            .wait_until_absent(spec.instance.as_str(), NAME_RELEASE_POLICY, &CancellationToken::new())
            .await?;
        let container_id = self.containers.run(&container).await?;
        info!(instance = %spec.instance, port = spec.port, "PyTorch container started");
        Ok(LaunchHandle {
            instance: spec.instance.clone(),
            container_id,
            port: spec.port,
        })
    }

    async fn stop(&self, instance: &InstanceName) -> Result<()> {
        self.containers.stop(instance.as_str()).await
    }

    async fn probe_ready(&self, _variant: &ModelVariant, port: u16) -> Result<bool> {
        self.rpc.probe(port).await
    }

    async fn query_online(
        &self,
        _variant: &ModelVariant,
        port: u16,
        request: QueryOnlineRequest,
    ) -> Result<QueryOnlineResponse> {
        self.rpc.query_online(port, request).await
    }

    async fn query_offline(&self, port: u16, batch: &OfflineBatch) -> Result<QueryOfflineResponse> {
        self.rpc.query_offline(port, offline_request(batch)).await
    }
}

/// Offline request pointing the backend at the job's scratch directories
pub(crate) fn offline_request(batch: &OfflineBatch) -> QueryOfflineRequest {
    QueryOfflineRequest {
        input_url: batch.job.to_string(),
        model: vec![batch.variant.to_string()],
        output_url: batch.job.to_string(),
        slo: None,
        submitter: batch.submitter.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use worker_core::ServingMode;

    fn launch_spec(mode: ServingMode, input_dim: Option<u32>) -> LaunchSpec {
        LaunchSpec {
            variant: ModelVariant::new("resnet50_4").unwrap(),
            instance: InstanceName::new("resnet50_4").unwrap(),
            port: 9001,
            mode,
            cpu_limit: 4.0,
            input_dim,
            model_dir: PathBuf::from("/tmp/models/resnet50_4"),
        }
    }

    fn backend() -> PyTorchBackend {
        let config = ContainerConfig::default();
        PyTorchBackend::new(
            Arc::new(ContainerRuntime::new(&config)),
            config,
            PathsConfig::default(),
        )
    }

    #[test]
    fn test_container_spec() {
        let spec = backend()
            .container_spec(&launch_spec(ServingMode::Online, Some(224)))
            .unwrap();
        assert_eq!(spec.name, "resnet50_4");
        assert_eq!(spec.publish, vec![(9001, 9001)]);
        assert_eq!(spec.cpus, Some(4.0));
        assert!(spec.env.contains(&("OFFLINENICE".to_string(), "OFF".to_string())));
        assert_eq!(&spec.command[2..], &["224", "resnet50_4", "9001"]);
        assert_eq!(spec.volumes.len(), 3);
    }

    #[test]
    fn test_offline_instances_run_niced() {
        let spec = backend()
            .container_spec(&launch_spec(ServingMode::Offline, Some(224)))
            .unwrap();
        assert!(spec.env.contains(&("OFFLINENICE".to_string(), "ON".to_string())));
    }

    #[test]
    fn test_missing_input_dim_is_rejected() {
        let err = backend()
            .container_spec(&launch_spec(ServingMode::Online, None))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_offline_request_targets_job_directory() {
        let variant = ModelVariant::new("resnet50_4").unwrap();
        let batch = OfflineBatch {
            job: InstanceName::scoped(&variant, "alice").unwrap(),
            variant,
            submitter: "alice".to_string(),
            inputs: vec!["a.jpg".to_string()],
        };
        let request = offline_request(&batch);
        assert_eq!(request.input_url, "resnet50_4_alice");
        assert_eq!(request.output_url, "resnet50_4_alice");
        assert_eq!(request.model, vec!["resnet50_4"]);
    }
}
