//! # worker-core
//!
//! Core types, collaborator traits and utilities for the inference worker.
//!
//! This crate provides the foundational data structures and interfaces that
//! are shared by the runtime, the instance manager and the agent:
//!
//! - Value types for model variants, instance names and serving modes
//! - Traits for the metadata store, object storage, autoscaler and blacklist hook
//! - In-memory and filesystem implementations of those collaborators
//! - Configuration schema and loading
//! - Error handling types and utilities

pub mod config;
pub mod error;
pub mod memory;
pub mod storage;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    ContainerConfig, OfflineConfig, PathsConfig, PoolConfig, PortConfig, StorageConfig,
    WorkerConfig,
};
pub use error::{Error, ErrorContext, Result};
pub use memory::{InMemoryAutoscaler, InMemoryMetadataStore};
pub use storage::{InMemoryObjectStorage, LocalObjectStorage, ObjectUrl};
pub use traits::{
    Autoscaler, MetadataStore, NoBlacklist, ObjectStorage, ResourceBlacklist, FIELD_FRAMEWORK,
    FIELD_INPUT_DIM,
};
pub use types::{BackendKind, BackendProtocol, InstanceName, ModelVariant, ServingMode, WorkerId};
