//! Collaborator interfaces consumed by the worker
//!
//! The metadata store, object storage, autoscaler counters and the resource
//! blacklist live outside this process. The worker only talks to them through
//! these traits.

use crate::storage::ObjectUrl;
use crate::{ModelVariant, Result, WorkerId};
use async_trait::async_trait;
use std::path::Path;

/// Metadata field holding a variant's backend framework
pub const FIELD_FRAMEWORK: &str = "framework";

/// Metadata field holding a variant's input image dimension
pub const FIELD_INPUT_DIM: &str = "imgdim";

/// Shared metadata store
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read one field of a variant's model info
    async fn get_model_info(&self, variant: &ModelVariant, field: &str) -> Result<String>;

    /// Record that `variant` is servable on `worker`
    async fn add_running_model(&self, worker: &WorkerId, variant: &ModelVariant) -> Result<()>;

    /// Remove the running record of `variant` on `worker`
    async fn remove_running_model(&self, worker: &WorkerId, variant: &ModelVariant)
        -> Result<()>;

    async fn is_model_running(&self, variant: &ModelVariant, worker: &WorkerId) -> Result<bool>;

    /// Mark a variant as being loaded or torn down
    async fn set_model_load_unload(&self, variant: &ModelVariant) -> Result<()>;

    async fn unset_model_load_unload(&self, variant: &ModelVariant) -> Result<()>;

    async fn is_model_load_unload(&self, variant: &ModelVariant) -> Result<bool>;

    /// Parent (base model) of a variant
    async fn get_parent_model(&self, variant: &ModelVariant) -> Result<ModelVariant>;

    /// Clear a pending scale-down of `parent` on `worker`
    async fn unset_parent_scaledown(&self, worker: &WorkerId, parent: &ModelVariant)
        -> Result<()>;

    /// Latest CPU utilization of `worker`, in percent
    async fn get_cpu_util(&self, worker: &WorkerId) -> Result<f64>;
}

/// Object storage holding model artifacts and offline job data
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// List every object key under `prefix`, recursively
    async fn list(&self, prefix: &ObjectUrl) -> Result<Vec<String>>;

    /// Download `keys` from `bucket` into `dest_dir`.
    ///
    /// Each object lands at its key relative to `prefix`, so nested
    /// directories are preserved.
    async fn download(
        &self,
        bucket: &str,
        prefix: &str,
        keys: &[String],
        dest_dir: &Path,
    ) -> Result<()>;

    /// Upload `file_names` from `local_dir` to `bucket` under `prefix`
    async fn upload(
        &self,
        local_dir: &Path,
        file_names: &[String],
        bucket: &str,
        prefix: &str,
    ) -> Result<()>;
}

/// Autoscaler counters touched by the worker
pub trait Autoscaler: Send + Sync {
    fn set_avg_batch(&self, variant: &ModelVariant, value: f64);
}

/// Hook reporting whether a shared resource is blacklisted for offline work
pub trait ResourceBlacklist: Send + Sync {
    fn has_blacklisted(&self) -> bool;
}

/// Blacklist hook that never blocks
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlacklist;

impl ResourceBlacklist for NoBlacklist {
    fn has_blacklisted(&self) -> bool {
        false
    }
}
