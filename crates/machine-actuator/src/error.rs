//! Actuator error taxonomy

use crds::ProviderConfigError;
use machine_setup::SetupError;
use ssh_client::SshError;
use thiserror::Error;

use crate::status::StatusError;
use crate::store::StoreError;

/// Machine status reason recorded for configuration and validation failures
pub const INVALID_CONFIGURATION_REASON: &str = "InvalidConfiguration";

/// Errors returned by lifecycle operations.
///
/// Nothing is retried internally. The controller re-invokes the same
/// operation on a later reconcile; [`ActuatorError::is_transient`] tells it
/// how soon.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// Provider config is missing or malformed
    #[error("invalid provider config: {0}")]
    Configuration(#[from] ProviderConfigError),

    /// Provider config decoded but a required field is missing
    #[error("invalid machine spec: {0}")]
    Validation(String),

    /// Setup catalog has zero or several entries for the machine
    #[error("machine setup config lookup failed: {0}")]
    Match(#[source] SetupError),

    /// Worker operation before any master published an API endpoint
    #[error("cluster {cluster} has no published API endpoint yet")]
    EndpointNotReady { cluster: String },

    /// Worker operation before any master finished provisioning
    #[error("no provisioned master found for cluster {cluster}")]
    MasterNotReady { cluster: String },

    /// Dial, authentication, session or non-zero exit on a host
    #[error("remote execution on {host} failed: {source}")]
    Remote {
        host: String,
        #[source]
        source: SshError,
    },

    /// Remote command printed something we could not interpret
    #[error("unexpected output from `{command}`: {details}")]
    UnexpectedOutput { command: String, details: String },

    /// Operation requested against a record in the wrong state
    #[error("invalid machine state: {0}")]
    State(String),

    /// Catalog unreadable or preamble failed to render
    #[error("machine setup failed: {0}")]
    Setup(#[source] SetupError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

impl ActuatorError {
    pub fn remote(host: impl Into<String>, source: SshError) -> Self {
        ActuatorError::Remote {
            host: host.into(),
            source,
        }
    }

    /// Failures expected to clear up on their own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ActuatorError::EndpointNotReady { .. }
                | ActuatorError::MasterNotReady { .. }
                | ActuatorError::Remote { .. }
                | ActuatorError::Store(_)
        )
    }
}

impl From<SetupError> for ActuatorError {
    fn from(error: SetupError) -> Self {
        match error {
            SetupError::EndpointNotReady { cluster } => ActuatorError::EndpointNotReady { cluster },
            e if e.is_match_error() => ActuatorError::Match(e),
            e => ActuatorError::Setup(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_errors_map_onto_taxonomy() {
        let err: ActuatorError = SetupError::EndpointNotReady {
            cluster: "c".to_string(),
        }
        .into();
        assert!(matches!(err, ActuatorError::EndpointNotReady { .. }));
        assert!(err.is_transient());

        let err: ActuatorError = SetupError::Ambiguous {
            params: "roles=[Node]".to_string(),
            count: 2,
        }
        .into();
        assert!(matches!(err, ActuatorError::Match(_)));
        assert!(!err.is_transient());

        let err: ActuatorError = SetupError::Io {
            path: "/missing".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        }
        .into();
        assert!(matches!(err, ActuatorError::Setup(_)));
    }

    #[test]
    fn test_configuration_errors_are_not_transient() {
        let err = ActuatorError::Validation("spec.versions.kubelet is required".to_string());
        assert!(!err.is_transient());
        assert!(!ActuatorError::State("gone".to_string()).is_transient());
    }
}
