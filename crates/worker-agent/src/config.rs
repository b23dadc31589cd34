//! Configuration of the worker daemon

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use worker_core::{ModelVariant, WorkerConfig};

/// Complete configuration of `workerd`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Runtime configuration shared with the manager
    #[serde(flatten)]
    pub worker: WorkerConfig,

    pub logging: LoggingConfig,

    pub server: ServerConfig,

    /// Models seeded into the in-process metadata store
    pub models: Vec<ModelRegistration>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    pub show_target: bool,

    pub show_thread_ids: bool,

    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Deadline of query, load and unload requests
    pub request_timeout_ms: u64,

    /// Deadline of offline job requests; unbounded when unset
    pub offline_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_ms: 120_000,
            offline_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn offline_timeout(&self) -> Option<Duration> {
        self.offline_timeout_ms.map(Duration::from_millis)
    }
}

/// Model metadata known to a single-node worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRegistration {
    pub variant: ModelVariant,
    /// Backend framework, e.g. `pytorch` or `tensorflow-cpu`
    pub framework: String,
    #[serde(default)]
    pub input_dim: Option<u32>,
    #[serde(default)]
    pub parent: Option<ModelVariant>,
}

impl AgentConfig {
    /// Load configuration: defaults, then the file if given, then `WORKER__*`
    /// environment variables
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&Self::default())
                .map_err(|e| crate::AgentError::Config(format!("Failed to build defaults: {}", e)))?,
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("WORKER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AgentConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::AgentError::Config(format!("Failed to load config: {}", e)))?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::AgentError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AgentConfig = serde_yaml::from_str(&content)
            .map_err(|e| crate::AgentError::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| crate::AgentError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::AgentError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.worker
            .validate()
            .map_err(|e| crate::AgentError::Config(format!("Worker config validation failed: {}", e)))?;

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(crate::AgentError::Config(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => {
                return Err(crate::AgentError::Config(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        if self.server.request_timeout_ms == 0 {
            return Err(crate::AgentError::Config(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        for model in &self.models {
            model.framework.parse::<worker_core::BackendKind>().map_err(|e| {
                crate::AgentError::Config(format!("Model {}: {}", model.variant, e))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.server.offline_timeout(), None);
    }

    #[test]
    fn test_yaml_roundtrip_keeps_flattened_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workerd.yaml");

        let mut config = AgentConfig::default();
        config.worker.worker.id = "worker-7".to_string();
        config.worker.offline.batch_size = 8;
        config.models.push(ModelRegistration {
            variant: ModelVariant::new("resnet50_4").unwrap(),
            framework: "pytorch".to_string(),
            input_dim: Some(224),
            parent: None,
        });
        config.to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("worker:\n  id: worker-7"));

        let loaded = AgentConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workerd.yaml");
        std::fs::write(
            &path,
            "worker:\n  id: edge-3\nlogging:\n  level: debug\nmodels:\n  - variant: mobilenet_2\n    framework: tensorflow-cpu\n",
        )
        .unwrap();

        let config = AgentConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.worker.worker.id, "edge-3");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.worker.offline.batch_size, 4);
        assert_eq!(config.models.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AgentConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.models.push(ModelRegistration {
            variant: ModelVariant::new("bert_1").unwrap(),
            framework: "onnx".to_string(),
            input_dim: None,
            parent: None,
        });
        assert!(config.validate().is_err());
    }
}
