//! Controller-specific error types.

use kube::Error as KubeError;
use machine_actuator::{ActuatorError, StoreError};
use machine_setup::SetupError;
use thiserror::Error;

/// Errors that can occur in the Machine Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Lifecycle operation failed
    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    /// Machine, Cluster or Secret access failed outside the actuator
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Setup catalog could not be opened
    #[error("Setup catalog error: {0}")]
    Setup(#[from] SetupError),

    /// A provisioned machine lost its cluster and cannot be shut down
    #[error("machine {machine} is provisioned but its cluster is unavailable: {source}")]
    OrphanedMachine {
        machine: String,
        #[source]
        source: StoreError,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether a quick retry is likely to succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Kube(_) | ControllerError::Store(_) => true,
            ControllerError::Actuator(e) => e.is_transient(),
            ControllerError::Setup(_)
            | ControllerError::OrphanedMachine { .. }
            | ControllerError::InvalidConfig(_)
            | ControllerError::Watch(_) => false,
        }
    }
}
