//! Main agent implementation

use crate::config::AgentConfig;
use crate::server::{self, ApiState};
use crate::Result;
use std::sync::Arc;
use tracing::{error, info};
use worker_core::{
    Autoscaler, InMemoryAutoscaler, InMemoryMetadataStore, LocalObjectStorage, MetadataStore,
    NoBlacklist, ObjectStorage, ObjectUrl, ResourceBlacklist, FIELD_FRAMEWORK, FIELD_INPUT_DIM,
};
use worker_manager::{
    ArtifactStager, InstancePool, LoadGate, ManagerMetrics, OfflinePipeline, PoolDependencies,
    QueryDispatcher,
};
use worker_runtime::BackendRegistry;

/// Collaborators the agent is wired to
pub struct AgentComponents {
    pub backends: BackendRegistry,
    pub storage: Arc<dyn ObjectStorage>,
    pub metadata: Arc<dyn MetadataStore>,
    pub autoscaler: Arc<dyn Autoscaler>,
    pub blacklist: Arc<dyn ResourceBlacklist>,
}

/// The worker daemon
pub struct Agent {
    config: AgentConfig,
    pool: InstancePool,
    dispatcher: QueryDispatcher,
    pipeline: OfflinePipeline,
    registry: prometheus::Registry,
}

impl Agent {
    /// Single-node agent: container backends, filesystem storage and
    /// in-process metadata seeded from the configured models
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let metadata = InMemoryMetadataStore::new();
        for model in &config.models {
            metadata.set_model_info(&model.variant, FIELD_FRAMEWORK, &model.framework);
            if let Some(dim) = model.input_dim {
                metadata.set_model_info(&model.variant, FIELD_INPUT_DIM, &dim.to_string());
            }
            if let Some(parent) = &model.parent {
                metadata.set_parent(&model.variant, parent);
            }
        }

        let components = AgentComponents {
            backends: BackendRegistry::with_containers(&config.worker.container, &config.worker.paths),
            storage: Arc::new(LocalObjectStorage::new(&config.worker.storage.local_root)),
            metadata: Arc::new(metadata),
            autoscaler: Arc::new(InMemoryAutoscaler::new()),
            blacklist: Arc::new(NoBlacklist),
        };
        Self::with_components(config, components)
    }

    pub fn with_components(config: AgentConfig, components: AgentComponents) -> Result<Self> {
        let registry = prometheus::Registry::new();
        let metrics = ManagerMetrics::new()?;
        metrics.register(&registry)?;

        let worker = &config.worker;
        let repository = ObjectUrl::parse(&worker.storage.model_repository)?;
        let stager = ArtifactStager::new(components.storage.clone(), &worker.paths.model_dir, repository);

        let pool = InstancePool::new(
            worker,
            PoolDependencies {
                backends: components.backends,
                stager,
                metadata: components.metadata.clone(),
                autoscaler: components.autoscaler,
                metrics: Some(metrics.clone()),
            },
        );
        let gate = LoadGate::new(
            components.metadata,
            components.blacklist,
            worker.worker_id(),
            &worker.offline,
        )
        .with_metrics(metrics.clone());
        let pipeline = OfflinePipeline::new(
            pool.clone(),
            components.storage,
            Arc::new(gate),
            &worker.offline,
            &worker.paths,
        )
        .with_metrics(metrics.clone());
        let dispatcher = QueryDispatcher::new(pool.clone(), Some(metrics));

        Ok(Self {
            config,
            pool,
            dispatcher,
            pipeline,
            registry,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// HTTP API of this agent
    pub fn router(&self) -> axum::Router {
        server::router(ApiState::new(
            self.dispatcher.clone(),
            self.pipeline.clone(),
            self.registry.clone(),
            &self.config.server,
        ))
    }

    /// Serve the HTTP API until ctrl-c, then unload every instance
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.server.bind_addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| crate::AgentError::Server(format!("Failed to bind to {}: {}", addr, e)))?;
        info!(
            worker = %self.pool.worker(),
            addr = %addr,
            "Worker API listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| crate::AgentError::Server(format!("HTTP server failed: {}", e)))?;

        info!("Shutting down, draining instance pools");
        let drained = self.pool.shutdown().await?;
        info!(drained, "Worker stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_core::{BackendKind, ModelVariant, ServingMode};
    use worker_runtime::mock::MockBackend;

    #[tokio::test]
    async fn test_from_config_seeds_models() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.worker.storage.local_root = dir.path().join("objects");
        config.worker.paths.model_dir = dir.path().join("models");
        config.models.push(crate::ModelRegistration {
            variant: ModelVariant::new("resnet50_4").unwrap(),
            framework: "pytorch".to_string(),
            input_dim: Some(224),
            parent: None,
        });

        let agent = Agent::from_config(config).unwrap();
        assert_eq!(agent.pool().worker().as_str(), "worker-0");
        assert_eq!(agent.pool().ports_in_use(), 0);
    }

    #[tokio::test]
    async fn test_with_components_uses_given_backends() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.worker.paths.model_dir = dir.path().join("models");
        config.worker.storage.model_repository = "mem://models".to_string();

        let storage = Arc::new(worker_core::InMemoryObjectStorage::new());
        storage.put("models", "resnet50_4/model.pt", b"w".to_vec());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let variant = ModelVariant::new("resnet50_4").unwrap();
        metadata.register_model(&variant, "pytorch", 224);
        let backend = Arc::new(MockBackend::new(BackendKind::PyTorch));

        let agent = Agent::with_components(
            config,
            AgentComponents {
                backends: BackendRegistry::new().with(backend.clone()),
                storage,
                metadata,
                autoscaler: Arc::new(InMemoryAutoscaler::new()),
                blacklist: Arc::new(NoBlacklist),
            },
        )
        .unwrap();

        agent
            .pool()
            .load(&variant, None, ServingMode::Online, &Default::default())
            .await
            .unwrap();
        assert_eq!(backend.start_count(), 1);
        assert_eq!(agent.pool().shutdown().await.unwrap(), 1);
        assert_eq!(backend.running_count(), 0);
    }
}
