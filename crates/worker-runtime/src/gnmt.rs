//! GNMT translation backend
//!
//! The variant name selects the build: `gpu` runs the GPU image, `fp16`
//! switches to half precision, and the numeric suffix is the beam width.

use crate::backend::{Backend, LaunchHandle, LaunchSpec, OfflineBatch};
use crate::container::{ContainerRuntime, ContainerSpec};
use crate::grpc::GrpcTransport;
use crate::pytorch::{offline_request, NAME_RELEASE_POLICY};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use worker_core::{BackendKind, ContainerConfig, InstanceName, ModelVariant, Result};
use worker_proto::{QueryOfflineResponse, QueryOnlineRequest, QueryOnlineResponse};

pub struct GnmtBackend {
    containers: Arc<ContainerRuntime>,
    config: ContainerConfig,
    rpc: GrpcTransport,
}

impl GnmtBackend {
    pub fn new(containers: Arc<ContainerRuntime>, config: ContainerConfig) -> Self {
        Self {
            containers,
            config,
            rpc: GrpcTransport::default(),
        }
    }

    pub fn container_spec(&self, spec: &LaunchSpec) -> ContainerSpec {
        let variant = &spec.variant;
        let cuda = if variant.wants_gpu() { "--cuda" } else { "--no-cuda" };
        let math = if variant.is_half_precision() { "fp16" } else { "fp32" };

        ContainerSpec::new(spec.instance.as_str(), &self.config.gnmt_image)
            .gpu(variant.wants_gpu())
            .publish(spec.port, spec.port)
            .cpus(self.config.gnmt_cpus)
            .flag("--ipc=host")
            .volume(&spec.model_dir, &self.config.model_mount)
            .arg("./gnmtcontainer.py")
            .arg("--model")
            .arg(variant.as_str())
            .arg("--port")
            .arg(spec.port.to_string())
            .arg(cuda)
            .arg("--math")
            .arg(math)
            .arg("--beam-size")
            .arg(variant.resource_units().to_string())
    }
}

#[async_trait]
impl Backend for GnmtBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gnmt
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<LaunchHandle> {
        let container = self.container_spec(spec);
        self.containers
            .wait_until_absent(spec.instance.as_str(), NAME_RELEASE_POLICY, &CancellationToken::new())
            .await?;
        let container_id = self.containers.run(&container).await?;
        info!(instance = %spec.instance, port = spec.port, gpu = container.gpu, "GNMT container started");
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use worker_core::ServingMode;

    fn spec_for(variant: &str) -> LaunchSpec {
        LaunchSpec {
            variant: ModelVariant::new(variant).unwrap(),
            instance: InstanceName::new(variant).unwrap(),
            port: 8999,
            mode: ServingMode::Online,
            cpu_limit: 1.0,
            input_dim: None,
            model_dir: PathBuf::from("/tmp/models").join(variant),
        }
    }

    fn backend() -> GnmtBackend {
        let config = ContainerConfig::default();
        GnmtBackend::new(Arc::new(ContainerRuntime::new(&config)), config)
    }

    #[test]
    fn test_gpu_half_precision_variant() {
        let spec = backend().container_spec(&spec_for("gnmt_gpu_fp16_5"));
        assert!(spec.gpu);
        assert_eq!(spec.cpus, Some(4.0));
        assert!(spec.command.contains(&"--cuda".to_string()));
        assert!(spec.command.ends_with(&[
            "--math".to_string(),
            "fp16".to_string(),
            "--beam-size".to_string(),
            "5".to_string(),
        ]));
    }

    #[test]
    fn test_cpu_variant_defaults() {
        let spec = backend().container_spec(&spec_for("gnmt_cpu"));
        assert!(!spec.gpu);
        assert!(spec.command.contains(&"--no-cuda".to_string()));
        assert!(spec.command.contains(&"fp32".to_string()));
        assert_eq!(spec.command.last().map(String::as_str), Some("1"));
    }
}
