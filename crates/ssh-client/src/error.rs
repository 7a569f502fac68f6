//! SSH client errors

use thiserror::Error;

/// Errors that can occur while talking to a remote host
#[derive(Debug, Error)]
pub enum SshError {
    /// TCP connection to the host could not be established
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// SSH handshake, channel, or transfer failure
    #[error("SSH session error: {0}")]
    Session(#[from] ssh2::Error),

    /// Neither the supplied key nor the local agent was accepted
    #[error("authentication as {username} failed: {details}")]
    Authentication { username: String, details: String },

    /// The remote command exited with a non-zero status
    #[error("command `{command}` exited with status {exit_status}: {output}")]
    CommandFailed {
        command: String,
        exit_status: i32,
        output: String,
    },

    /// Local IO error (temporary files, stream reads)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking worker running the session panicked or was cancelled
    #[error("SSH worker failed: {0}")]
    Worker(String),
}

impl SshError {
    /// Combined output of a failed command, if this is a command failure
    pub fn output(&self) -> Option<&str> {
        match self {
            SshError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}
