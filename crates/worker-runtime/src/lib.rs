//! # worker-runtime
//!
//! Backend runtimes for inference instances.
//!
//! This crate provides:
//! - A [`Backend`] interface implemented once per backend kind
//! - Container backends for PyTorch, TensorFlow Serving and GNMT
//! - The binary RPC transport shared by the PyTorch and GNMT backends
//! - Port allocation for instances
//! - Bounded, cancellable readiness polling
//! - A recording [`mock::MockBackend`] for development and tests

pub mod backend;
pub mod container;
pub mod gnmt;
pub mod grpc;
pub mod mock;
pub mod ports;
pub mod pytorch;
pub mod readiness;
pub mod tfserving;

// Re-export main types
pub use backend::{Backend, BackendRegistry, LaunchHandle, LaunchSpec, OfflineBatch};
pub use container::{ContainerRuntime, ContainerSpec};
pub use ports::PortAllocator;
pub use readiness::{cancellable, poll_until, sleep_or_cancel, ReadinessPolicy};
