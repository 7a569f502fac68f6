//! SSH client backed by libssh2
//!
//! libssh2 sessions are blocking, so every operation runs on Tokio's
//! blocking pool via `spawn_blocking`.

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use ssh2::{Channel, ExtendedData, Session};
use tracing::{debug, warn};

use crate::credential::{SshCredential, SshEndpoint};
use crate::error::SshError;
use crate::ssh_trait::{SshClientTrait, SshConnector};

/// Dial, handshake, and per-operation timeout
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(600);

const SCP_FILE_MODE: i32 = 0o644;

/// Client for a single host
///
/// Each call opens a fresh session; no connection state survives between calls.
#[derive(Debug, Clone)]
pub struct SshClient {
    endpoint: SshEndpoint,
    credential: SshCredential,
    timeout: Duration,
}

impl SshClient {
    pub fn new(endpoint: SshEndpoint, credential: SshCredential) -> Self {
        Self {
            endpoint,
            credential,
            timeout: DEFAULT_SSH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, SshError>
    where
        T: Send + 'static,
        F: FnOnce(Session) -> Result<T, SshError> + Send + 'static,
    {
        let endpoint = self.endpoint.clone();
        let credential = self.credential.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let session = connect(&endpoint, &credential, timeout)?;
            let result = op(session.clone());
            if let Err(e) = session.disconnect(None, "done", None) {
                debug!("Ignoring disconnect error from {}: {}", endpoint, e);
            }
            result
        })
        .await
        .map_err(|e| SshError::Worker(e.to_string()))?
    }
}

#[async_trait::async_trait]
impl SshClientTrait for SshClient {
    fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    async fn run(&self, command: &str) -> Result<String, SshError> {
        debug!("Running `{}` on {}", summarize(command), self.endpoint);
        let command = command.to_string();
        self.blocking(move |session| {
            let mut channel = session.channel_session()?;
            channel.handle_extended_data(ExtendedData::Merge)?;
            channel.exec(&command)?;

            let mut raw = Vec::new();
            channel.read_to_end(&mut raw)?;
            let output = String::from_utf8_lossy(&raw).into_owned();
            let exit_status = finish(&mut channel)?;
            if exit_status != 0 {
                return Err(SshError::CommandFailed {
                    command: summarize(&command),
                    exit_status,
                    output,
                });
            }
            Ok(output)
        })
        .await
    }

    async fn run_capture(&self, command: &str) -> Result<String, SshError> {
        debug!("Capturing `{}` on {}", summarize(command), self.endpoint);
        let command = command.to_string();
        let deadline = Instant::now() + self.timeout;
        self.blocking(move |session| {
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;

            // Both streams share one flow-control window, so they are read
            // in turn until each reports end of stream.
            session.set_blocking(false);
            let collected = collect_streams(&mut channel.stream(0), &mut channel.stderr(), deadline);
            session.set_blocking(true);
            let (stdout, stderr) = collected?;

            let exit_status = finish(&mut channel)?;
            if exit_status != 0 {
                return Err(SshError::CommandFailed {
                    command: summarize(&command),
                    exit_status,
                    output: if stderr.is_empty() { stdout } else { stderr },
                });
            }
            Ok(stdout)
        })
        .await
    }

    async fn put_file(&self, content: &str, remote_path: &str) -> Result<(), SshError> {
        debug!("Copying {} bytes to {}:{}", content.len(), self.endpoint, remote_path);

        // Stage locally first; the temp file is removed when `staged` drops,
        // whether or not the transfer succeeds.
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(content.as_bytes())?;
        staged.flush()?;
        let size = staged.as_file().metadata()?.len();

        let remote_path = remote_path.to_string();
        self.blocking(move |session| {
            let mut file = staged.reopen()?;
            file.seek(SeekFrom::Start(0))?;

            let mut channel = session.scp_send(Path::new(&remote_path), SCP_FILE_MODE, size, None)?;
            std::io::copy(&mut file, &mut channel)?;
            channel.send_eof()?;
            channel.wait_eof()?;
            channel.close()?;
            channel.wait_close()?;
            drop(staged);
            Ok(())
        })
        .await
    }
}

fn connect(endpoint: &SshEndpoint, credential: &SshCredential, timeout: Duration) -> Result<Session, SshError> {
    let address = endpoint.address();
    let dial_error = |source: std::io::Error| SshError::Dial {
        address: address.clone(),
        source,
    };

    let socket_addr = address
        .to_socket_addrs()
        .map_err(dial_error)?
        .next()
        .ok_or_else(|| dial_error(std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")))?;
    let tcp = TcpStream::connect_timeout(&socket_addr, timeout).map_err(dial_error)?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake()?;

    authenticate(&session, endpoint, credential)?;
    Ok(session)
}

/// Try the supplied private key, then fall back to the local agent
fn authenticate(session: &Session, endpoint: &SshEndpoint, credential: &SshCredential) -> Result<(), SshError> {
    let mut failures = Vec::new();

    if credential.has_private_key() {
        match session.userauth_pubkey_memory(
            &endpoint.username,
            None,
            credential.private_key(),
            credential.passphrase(),
        ) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => failures.push("private key not accepted".to_string()),
            Err(e) => {
                warn!("Private key authentication to {} failed: {}", endpoint, e);
                failures.push(format!("private key: {}", e));
            }
        }
    }

    match session.userauth_agent(&endpoint.username) {
        Ok(()) if session.authenticated() => Ok(()),
        Ok(()) => {
            failures.push("agent identities not accepted".to_string());
            Err(auth_error(endpoint, failures))
        }
        Err(e) => {
            failures.push(format!("agent: {}", e));
            Err(auth_error(endpoint, failures))
        }
    }
}

fn auth_error(endpoint: &SshEndpoint, failures: Vec<String>) -> SshError {
    SshError::Authentication {
        username: endpoint.username.clone(),
        details: failures.join("; "),
    }
}

/// Pause between polls when neither stream had data
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Read two non-blocking streams to their end, alternating between them.
///
/// Output is decoded lossily; remote tools are free to print bytes that are
/// not UTF-8.
fn collect_streams(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    deadline: Instant,
) -> Result<(String, String), SshError> {
    let mut out = StreamBuffer::default();
    let mut err = StreamBuffer::default();
    let mut chunk = [0u8; 8192];

    while !(out.done && err.done) {
        let progressed = out.poll(stdout, &mut chunk)? | err.poll(stderr, &mut chunk)?;
        if progressed {
            continue;
        }
        if Instant::now() >= deadline {
            return Err(SshError::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                "remote command produced no end of output before the timeout",
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    Ok((out.into_string(), err.into_string()))
}

#[derive(Default)]
struct StreamBuffer {
    data: Vec<u8>,
    done: bool,
}

impl StreamBuffer {
    /// One read attempt; true when it consumed bytes or hit end of stream
    fn poll(&mut self, stream: &mut impl Read, chunk: &mut [u8]) -> Result<bool, SshError> {
        if self.done {
            return Ok(false);
        }
        match stream.read(chunk) {
            Ok(0) => {
                self.done = true;
                Ok(true)
            }
            Ok(n) => {
                self.data.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(false),
            Err(e) => Err(SshError::Io(e)),
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

fn finish(channel: &mut Channel) -> Result<i32, SshError> {
    channel.wait_close()?;
    Ok(channel.exit_status()?)
}

/// First line of a command, shortened. Scripts are never logged in full.
fn summarize(command: &str) -> String {
    const MAX: usize = 80;
    let first = command.lines().next().unwrap_or_default().trim();
    let mut summary: String = first.chars().take(MAX).collect();
    if first.chars().count() > MAX || command.trim_end().contains('\n') {
        summary.push_str(" ...");
    }
    summary
}

/// Connector producing real SSH clients
#[derive(Debug, Clone)]
pub struct SshSessionConnector {
    timeout: Duration,
}

impl SshSessionConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SshSessionConnector {
    fn default() -> Self {
        Self::new(DEFAULT_SSH_TIMEOUT)
    }
}

impl SshConnector for SshSessionConnector {
    fn client(&self, endpoint: SshEndpoint, credential: SshCredential) -> Box<dyn SshClientTrait> {
        Box::new(SshClient::new(endpoint, credential).with_timeout(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn test_summarize_keeps_single_line_commands() {
        assert_eq!(summarize("kubelet --version"), "kubelet --version");
    }

    #[test]
    fn test_summarize_hides_script_bodies() {
        let script = "#!/bin/bash\nexport TOKEN=abc\nkubeadm join\n";
        assert_eq!(summarize(script), "#!/bin/bash ...");
    }

    #[test]
    fn test_summarize_truncates_long_lines() {
        let long = "x".repeat(200);
        let summary = summarize(&long);
        assert!(summary.ends_with(" ..."));
        assert_eq!(summary.len(), 84);
    }

    /// Reader replaying canned read results, then end of stream
    struct Scripted(VecDeque<std::io::Result<Vec<u8>>>);

    impl Scripted {
        fn new(reads: Vec<std::io::Result<Vec<u8>>>) -> Self {
            Self(reads.into())
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
            }
        }
    }

    fn pending() -> std::io::Result<Vec<u8>> {
        Err(ErrorKind::WouldBlock.into())
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_collect_streams_drains_stderr_while_stdout_waits() {
        // stdout only becomes readable after stderr has been consumed
        let mut stdout = Scripted::new(vec![pending(), pending(), pending(), Ok(b"v1.30.0\n".to_vec())]);
        let mut stderr = Scripted::new(vec![
            Ok(b"warning: a\n".to_vec()),
            Ok(b"warning: b\n".to_vec()),
            Ok(vec![0xff, b'\n']),
        ]);

        let (out, err) = collect_streams(&mut stdout, &mut stderr, far_deadline()).unwrap();

        assert_eq!(out, "v1.30.0\n");
        assert_eq!(err, "warning: a\nwarning: b\n\u{FFFD}\n");
    }

    #[test]
    fn test_collect_streams_decodes_invalid_utf8_lossily() {
        let mut stdout = Scripted::new(vec![Ok(vec![b'o', b'k', 0xc3, 0x28])]);
        let mut stderr = Scripted::new(vec![]);

        let (out, err) = collect_streams(&mut stdout, &mut stderr, far_deadline()).unwrap();

        assert_eq!(out, "ok\u{FFFD}(");
        assert!(err.is_empty());
    }

    #[test]
    fn test_collect_streams_times_out_on_silent_streams() {
        let mut stdout = Scripted::new((0..1000).map(|_| pending()).collect());
        let mut stderr = Scripted::new((0..1000).map(|_| pending()).collect());

        let err = collect_streams(&mut stdout, &mut stderr, Instant::now()).unwrap_err();

        assert!(matches!(err, SshError::Io(ref e) if e.kind() == ErrorKind::TimedOut), "unexpected error: {err}");
    }

    #[test]
    fn test_collect_streams_propagates_read_errors() {
        let mut stdout = Scripted::new(vec![Err(ErrorKind::ConnectionReset.into())]);
        let mut stderr = Scripted::new(vec![]);

        let err = collect_streams(&mut stdout, &mut stderr, far_deadline()).unwrap_err();

        assert!(matches!(err, SshError::Io(ref e) if e.kind() == ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_dial_error() {
        // Port 1 on localhost is closed on any sane test machine
        let client = SshClient::new(
            SshEndpoint::new("root", "127.0.0.1", 1),
            SshCredential::new("key", ""),
        )
        .with_timeout(Duration::from_secs(2));

        let err = client.run("true").await.unwrap_err();
        assert!(matches!(err, SshError::Dial { .. }), "unexpected error: {err}");
    }

    #[test]
    fn test_connector_builds_client_for_endpoint() {
        let connector = SshSessionConnector::default();
        let client = connector.client(SshEndpoint::new("root", "10.0.0.5", 22), SshCredential::default());
        assert_eq!(client.endpoint().host, "10.0.0.5");
    }
}
