//! SshClientTrait for mocking
//!
//! The actuator only talks to hosts through these traits, so tests can swap
//! in [`crate::mock::MockSshConnector`] (feature `test-util`).

use crate::credential::{SshCredential, SshEndpoint};
use crate::error::SshError;

/// Command printing the admin kubeconfig on a master
pub const GET_KUBECONFIG_COMMAND: &str = "cat /etc/kubernetes/admin.conf";

/// Operations on a single remote host
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait SshClientTrait: Send + Sync {
    /// Host this client talks to
    fn endpoint(&self) -> &SshEndpoint;

    /// Run a command and return its combined stdout/stderr.
    ///
    /// A non-zero exit status is reported as [`SshError::CommandFailed`]
    /// carrying the captured output.
    async fn run(&self, command: &str) -> Result<String, SshError>;

    /// Run a command and return only its stdout
    async fn run_capture(&self, command: &str) -> Result<String, SshError>;

    /// Write `content` to `remote_path` on the host
    async fn put_file(&self, content: &str, remote_path: &str) -> Result<(), SshError>;

    /// Admin kubeconfig of a master host
    async fn get_kubeconfig(&self) -> Result<String, SshError> {
        self.run_capture(GET_KUBECONFIG_COMMAND).await
    }
}

/// Builds clients for hosts
pub trait SshConnector: Send + Sync {
    fn client(&self, endpoint: SshEndpoint, credential: SshCredential) -> Box<dyn SshClientTrait>;
}
