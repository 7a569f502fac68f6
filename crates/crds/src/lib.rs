//! Cluster API Resource Definitions
//!
//! Kubernetes resource types consumed by the SSH machine provider:
//! Cluster API v1alpha1 `Cluster` and `Machine`, plus the SSH provider
//! configuration embedded in `Machine.spec.providerConfig`.

pub mod cluster;
pub mod machine;
pub mod provider_config;

pub use cluster::*;
pub use machine::*;
pub use provider_config::*;
