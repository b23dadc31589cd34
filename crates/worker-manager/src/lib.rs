//! # worker-manager
//!
//! Instance lifecycle and query routing for the inference worker.
//!
//! - [`InstancePool`]: loads and unloads backend instances, owns ports and
//!   cores, keeps the metadata store's view of running variants in step
//! - [`QueryDispatcher`]: routes online queries round robin
//! - [`OfflinePipeline`]: runs batch jobs behind a CPU [`LoadGate`]
//! - [`ArtifactStager`]: stages model artifacts from object storage

pub mod dispatch;
pub mod gate;
pub mod metrics;
pub mod offline;
pub mod pool;
pub mod stager;

pub use dispatch::QueryDispatcher;
pub use gate::{GateReport, LoadGate};
pub use metrics::ManagerMetrics;
pub use offline::{OfflineJob, OfflinePipeline, OfflineReport};
pub use pool::{
    Instance, InstancePool, LoadOutcome, PoolDependencies, PoolSnapshot, UnloadOutcome,
};
pub use stager::{ArtifactStager, StageOutcome};
