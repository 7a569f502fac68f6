//! Mock SSH connector for unit testing
//!
//! Records every command and file transfer per host and answers from a
//! table of canned responses, so actuator tests can run without any hosts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::credential::{SshCredential, SshEndpoint};
use crate::error::SshError;
use crate::ssh_trait::{SshClientTrait, SshConnector};

/// Kind of remote operation that was issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshOperation {
    Run,
    RunCapture,
    PutFile { remote_path: String },
}

/// One operation against one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub host: String,
    pub operation: SshOperation,
    /// Command text, or file content for `PutFile`
    pub payload: String,
}

#[derive(Debug, Clone)]
struct Response {
    host: String,
    contains: String,
    result: Result<String, (i32, String)>,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<RecordedCall>,
    responses: Vec<Response>,
    unreachable: HashSet<String>,
    sessions_opened: usize,
}

/// Mock connector for testing
///
/// Unmatched commands succeed with empty output. When several responses
/// match a command, the one registered last wins.
#[derive(Debug, Clone, Default)]
pub struct MockSshConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockSshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands on `host` containing `contains` with `output`
    pub fn respond(&self, host: &str, contains: &str, output: &str) {
        self.push(host, contains, Ok(output.to_string()));
    }

    /// Fail commands on `host` containing `contains` with exit status 1
    pub fn fail(&self, host: &str, contains: &str, output: &str) {
        self.push(host, contains, Err((1, output.to_string())));
    }

    /// Make every operation on `host` fail with a dial error
    pub fn set_unreachable(&self, host: &str) {
        self.state.lock().unwrap().unreachable.insert(host.to_string());
    }

    /// All recorded calls, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Recorded calls against one host
    pub fn calls_to(&self, host: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.host == host).collect()
    }

    /// Number of operations that got as far as opening a session
    pub fn sessions_opened(&self) -> usize {
        self.state.lock().unwrap().sessions_opened
    }

    fn push(&self, host: &str, contains: &str, result: Result<String, (i32, String)>) {
        self.state.lock().unwrap().responses.push(Response {
            host: host.to_string(),
            contains: contains.to_string(),
            result,
        });
    }
}

impl SshConnector for MockSshConnector {
    fn client(&self, endpoint: SshEndpoint, _credential: SshCredential) -> Box<dyn SshClientTrait> {
        Box::new(MockSshClient {
            endpoint,
            state: Arc::clone(&self.state),
        })
    }
}

struct MockSshClient {
    endpoint: SshEndpoint,
    state: Arc<Mutex<MockState>>,
}

impl MockSshClient {
    fn record(&self, operation: SshOperation, payload: &str) -> Result<String, SshError> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(&self.endpoint.host) {
            return Err(SshError::Dial {
                address: self.endpoint.address(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }

        state.sessions_opened += 1;
        state.calls.push(RecordedCall {
            host: self.endpoint.host.clone(),
            operation,
            payload: payload.to_string(),
        });

        let matched = state
            .responses
            .iter()
            .rev()
            .find(|r| r.host == self.endpoint.host && payload.contains(&r.contains))
            .map(|r| r.result.clone());

        match matched {
            Some(Ok(output)) => Ok(output),
            Some(Err((exit_status, output))) => Err(SshError::CommandFailed {
                command: payload.lines().next().unwrap_or_default().to_string(),
                exit_status,
                output,
            }),
            None => Ok(String::new()),
        }
    }
}

#[async_trait::async_trait]
impl SshClientTrait for MockSshClient {
    fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    async fn run(&self, command: &str) -> Result<String, SshError> {
        self.record(SshOperation::Run, command)
    }

    async fn run_capture(&self, command: &str) -> Result<String, SshError> {
        self.record(SshOperation::RunCapture, command)
    }

    async fn put_file(&self, content: &str, remote_path: &str) -> Result<(), SshError> {
        self.record(
            SshOperation::PutFile {
                remote_path: remote_path.to_string(),
            },
            content,
        )
        .map(|_| ())
    }
}
