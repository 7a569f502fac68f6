//! Machine lifecycle actuator
//!
//! Turns a desired [`crds::Machine`] into remote side effects on an
//! already-running host: startup and shutdown scripts, control plane and
//! kubelet upgrades, drain and uncordon sequencing.
//!
//! All provisioning state lives in the `instance-status` annotation of the
//! Machine itself (see [`status`]). Every operation re-derives the node's
//! state from that annotation, so each call is safe to repeat from the top
//! after a partial failure. Nothing is rolled back.
//!
//! The actuator reaches the outside world only through traits:
//! [`store::ObjectStore`], [`secrets::SecretStore`], [`events::EventRecorder`],
//! [`ssh_client::SshConnector`] and [`machine_setup::MachineSetupConfigGetter`].

pub mod actuator;
pub mod commands;
pub mod error;
pub mod events;
pub mod secrets;
pub mod status;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;

pub use actuator::{
    ActuatorOptions, ActuatorParams, MachineActuator, MachineDeployer, ScriptDelivery, SshActuator,
    UpdateStrategy,
};
pub use error::ActuatorError;
pub use events::{EventKind, EventRecorder, KubeEventRecorder};
pub use secrets::{KubeSecretStore, SecretStore};
pub use status::{InstanceStatus, NodeState, StatusError, INSTANCE_STATUS_ANNOTATION, MACHINE_NAME_ANNOTATION};
pub use store::{KubeObjectStore, MachineStatusPatch, ObjectStore, StoreError};
