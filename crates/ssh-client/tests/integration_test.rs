//! Integration tests for the SSH client
//!
//! These tests require a reachable SSH server.
//! Set SSH_TEST_HOST, SSH_TEST_USER and SSH_TEST_KEY_FILE to run.

use ssh_client::{SshClient, SshClientTrait, SshCredential, SshEndpoint, SshError};

fn client_from_env() -> SshClient {
    let host = std::env::var("SSH_TEST_HOST").expect("SSH_TEST_HOST environment variable must be set");
    let user = std::env::var("SSH_TEST_USER").unwrap_or_else(|_| "root".to_string());
    let port = std::env::var("SSH_TEST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(22);
    let key_file = std::env::var("SSH_TEST_KEY_FILE").expect("SSH_TEST_KEY_FILE environment variable must be set");
    let key = std::fs::read_to_string(key_file).expect("Failed to read private key");
    let passphrase = std::env::var("SSH_TEST_PASSPHRASE").unwrap_or_default();

    SshClient::new(SshEndpoint::new(user, host, port), SshCredential::new(key, passphrase))
}

#[tokio::test]
#[ignore] // Requires reachable SSH server
async fn test_run_returns_combined_output() {
    let client = client_from_env();

    let output = client.run("echo out; echo err >&2").await.expect("Failed to run command");
    assert!(output.contains("out"));
    assert!(output.contains("err"));
}

#[tokio::test]
#[ignore]
async fn test_run_capture_returns_stdout_only() {
    let client = client_from_env();

    let output = client.run_capture("echo out; echo err >&2").await.expect("Failed to run command");
    assert_eq!(output.trim(), "out");
}

#[tokio::test]
#[ignore]
async fn test_non_zero_exit_is_an_error() {
    let client = client_from_env();

    let err = client.run("echo failing; exit 3").await.unwrap_err();
    match err {
        SshError::CommandFailed { exit_status, output, .. } => {
            assert_eq!(exit_status, 3);
            assert!(output.contains("failing"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
#[ignore]
async fn test_put_file_then_execute() {
    let client = client_from_env();
    let path = format!("/tmp/ssh-client-it-{}.sh", std::process::id());

    client
        .put_file("#!/bin/bash\necho staged-script\n", &path)
        .await
        .expect("Failed to copy file");
    let output = client.run(&format!("bash {path}; rm -f {path}")).await.expect("Failed to run script");
    assert_eq!(output.trim(), "staged-script");
}
