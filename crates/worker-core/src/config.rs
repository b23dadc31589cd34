//! Configuration management for the inference worker
//!
//! Layers built-in defaults, an optional YAML file and `WORKER__*`
//! environment variables through the `config` crate.

use crate::{Error, Result, WorkerId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure of the worker runtime
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identity
    pub worker: WorkerSection,

    /// Local directories for artifacts and offline scratch data
    pub paths: PathsConfig,

    /// Port allocation range
    pub ports: PortConfig,

    /// Instance pool polling and budgets
    pub pool: PoolConfig,

    /// Offline pipeline batching and load gate
    pub offline: OfflineConfig,

    /// Object storage locations
    pub storage: StorageConfig,

    /// Container launcher settings
    pub container: ContainerConfig,
}

impl WorkerConfig {
    /// Load configuration with precedence:
    /// 1. Environment variables (`WORKER__SECTION__KEY`)
    /// 2. Configuration file named by `WORKER_CONFIG`, or `./worker.yaml`
    /// 3. Defaults
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var("WORKER_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            builder = builder.add_source(config::File::with_name("./worker.yaml").required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WORKER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load configuration from a specific file on top of the defaults
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.worker.id.trim().is_empty() {
            return Err(Error::config("worker.id cannot be empty"));
        }
        self.ports.validate()?;
        self.pool.validate()?;
        self.offline.validate()?;
        crate::ObjectUrl::parse(&self.storage.model_repository)
            .map_err(|e| Error::config(format!("storage.model_repository: {}", e)))?;
        if self.container.binary.trim().is_empty() {
            return Err(Error::config("container.binary cannot be empty"));
        }
        Ok(())
    }

    pub fn worker_id(&self) -> WorkerId {
        WorkerId::new(self.worker.id.clone())
    }
}

/// Worker identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Name this worker registers under in the metadata store
    pub id: String,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            id: "worker-0".to_string(),
        }
    }
}

/// Local directory layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Staged model artifacts, one sub-directory per variant
    pub model_dir: PathBuf,
    /// Offline job inputs: `<input_dir>/<job>/infer/`
    pub input_dir: PathBuf,
    /// Offline job outputs: `<output_dir>/<job>/`
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("/tmp/models"),
            input_dir: PathBuf::from("/tmp/worker_input"),
            output_dir: PathBuf::from("/tmp/worker_output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// First port handed out; later ports count down from here
    pub base_port: u16,
    /// Lowest port that may be handed out
    pub floor_port: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base_port: 9001,
            floor_port: 1024,
        }
    }
}

impl PortConfig {
    pub fn validate(&self) -> Result<()> {
        if self.floor_port > self.base_port {
            return Err(Error::config(format!(
                "ports.floor_port ({}) must not exceed ports.base_port ({})",
                self.floor_port, self.base_port
            )));
        }
        Ok(())
    }
}

/// Instance pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Interval between checks while waiting for an instance
    pub wait_interval_ms: u64,
    /// Checks before a wait for an instance times out
    pub wait_max_attempts: u32,
    /// Readiness probe interval of the first phase
    pub ready_fast_interval_ms: u64,
    pub ready_fast_attempts: u32,
    /// Readiness probe interval of the retry phase
    pub ready_slow_interval_ms: u64,
    pub ready_slow_attempts: u32,
    /// Total CPU cores instances may reserve; unlimited when unset
    pub core_budget: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            wait_interval_ms: 500,
            wait_max_attempts: 60,
            ready_fast_interval_ms: 100,
            ready_fast_attempts: 100,
            ready_slow_interval_ms: 1000,
            ready_slow_attempts: 120,
            core_budget: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.wait_interval_ms == 0 || self.wait_max_attempts == 0 {
            return Err(Error::config("pool wait interval and attempts must be positive"));
        }
        if self.ready_fast_attempts == 0 && self.ready_slow_attempts == 0 {
            return Err(Error::config("at least one readiness phase needs attempts"));
        }
        if self.core_budget == Some(0) {
            return Err(Error::config("pool.core_budget must be positive when set"));
        }
        Ok(())
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub fn ready_fast_interval(&self) -> Duration {
        Duration::from_millis(self.ready_fast_interval_ms)
    }

    pub fn ready_slow_interval(&self) -> Duration {
        Duration::from_millis(self.ready_slow_interval_ms)
    }
}

/// Offline pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Inputs per offline RPC
    pub batch_size: usize,
    /// Wait for spare CPU before each batch
    pub gate_enabled: bool,
    /// Batches start only while utilization is at or below this percentage
    pub cpu_threshold: f64,
    /// Interval between utilization samples while gated
    pub gate_interval_ms: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            gate_enabled: true,
            cpu_threshold: 40.0,
            gate_interval_ms: 1000,
        }
    }
}

impl OfflineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("offline.batch_size must be positive"));
        }
        if !(0.0..=100.0).contains(&self.cpu_threshold) {
            return Err(Error::config(format!(
                "offline.cpu_threshold must be a percentage, got {}",
                self.cpu_threshold
            )));
        }
        if self.gate_interval_ms == 0 {
            return Err(Error::config("offline.gate_interval_ms must be positive"));
        }
        Ok(())
    }

    pub fn gate_interval(&self) -> Duration {
        Duration::from_millis(self.gate_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Location of model artifacts; each variant lives under `<repository>/<variant>/`
    pub model_repository: String,
    /// Root directory of the filesystem storage backend
    pub local_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            model_repository: "local://models".to_string(),
            local_root: PathBuf::from("/var/lib/worker/objects"),
        }
    }
}

/// Container launcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI used to run backends
    pub binary: String,
    /// Container CLI used for GPU backends
    pub gpu_binary: String,
    /// Grace period given to `stop` before the container is killed
    pub stop_timeout_secs: u64,
    /// Deadline for any single container CLI invocation
    pub command_timeout_secs: u64,
    pub pytorch_image: String,
    pub tensorflow_image: String,
    pub gnmt_image: String,
    /// Mount points inside the containers
    pub model_mount: String,
    pub input_mount: String,
    pub output_mount: String,
    /// Ask offline backends to lower their scheduling priority
    pub offline_nice: bool,
    /// CPU limit of GNMT containers
    pub gnmt_cpus: f32,
    /// Enables server-side batching for TensorFlow containers
    pub tf_batching_parameters: Option<PathBuf>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            gpu_binary: "nvidia-docker".to_string(),
            stop_timeout_secs: 1,
            command_timeout_secs: 60,
            pytorch_image: "worker/pytorch-serving:latest".to_string(),
            tensorflow_image: "tensorflow/serving:latest".to_string(),
            gnmt_image: "worker/gnmt-serving:latest".to_string(),
            model_mount: "/tmp/model".to_string(),
            input_mount: "/tmp/worker_input".to_string(),
            output_mount: "/tmp/worker_output".to_string(),
            offline_nice: true,
            gnmt_cpus: 4.0,
            tf_batching_parameters: None,
        }
    }
}

impl ContainerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
