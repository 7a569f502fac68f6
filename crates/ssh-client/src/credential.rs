//! Where to connect and how to authenticate

use std::fmt;

/// Address and login user of a remote host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshEndpoint {
    pub username: String,
    pub host: String,
    pub port: u16,
}

impl SshEndpoint {
    pub fn new(username: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            username: username.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` form used when dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Private key material loaded from a secret
///
/// The key and passphrase never appear in `Debug` output.
#[derive(Clone, Default)]
pub struct SshCredential {
    private_key: String,
    passphrase: String,
}

impl SshCredential {
    pub fn new(private_key: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            passphrase: passphrase.into(),
        }
    }

    /// PEM/OpenSSH encoded private key
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Passphrase, or `None` when the key is not encrypted
    pub fn passphrase(&self) -> Option<&str> {
        if self.passphrase.is_empty() {
            None
        } else {
            Some(&self.passphrase)
        }
    }

    pub fn has_private_key(&self) -> bool {
        !self.private_key.trim().is_empty()
    }
}

impl fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredential")
            .field("private_key", &"<redacted>")
            .field("passphrase", &if self.passphrase.is_empty() { "<none>" } else { "<redacted>" })
            .finish()
    }
}
