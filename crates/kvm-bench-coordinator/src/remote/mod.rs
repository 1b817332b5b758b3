//! Remote execution against ready guests
//!
//! [`RemoteExecutor::run`] opens a fresh session for every command, so a
//! session invalidated by the guest (reboot, sshd restart) never poisons
//! later steps. It never retries; the dispatcher owns retry policy.

mod ssh;

pub use ssh::SshSessions;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvm_bench_common::defaults::{default_connect_timeout_secs, default_ssh_port};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RemoteError;
use crate::lifecycle::VmInstance;

/// Guest login credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    /// Private key used for authentication
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// TCP connect timeout when opening a session, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            identity_file: None,
            port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Output of a command that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for diagnosing failed commands
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// An authenticated session to one guest
#[async_trait]
pub trait RemoteSession: Send {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, RemoteError>;
}

/// Opens sessions to guests
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// Runs single commands on ready instances
#[derive(Clone)]
pub struct RemoteExecutor {
    sessions: Arc<dyn SessionFactory>,
    credentials: Credentials,
}

impl RemoteExecutor {
    pub fn new(sessions: Arc<dyn SessionFactory>, credentials: Credentials) -> Self {
        Self {
            sessions,
            credentials,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Run `command` on the instance.
    ///
    /// Opening the session is bounded by the connect timeout and the command
    /// by `timeout`; an instance without an address is a connection error.
    pub async fn run(
        &self,
        instance: &VmInstance,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let host = instance
            .address()
            .ok_or_else(|| RemoteError::connection(instance.name(), "instance has no address"))?;
        self.run_on(host, command, timeout).await
    }

    /// Run `command` against a host address directly (readiness probes)
    pub async fn run_on(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        debug!(host = %host, command = %command, timeout_secs = timeout.as_secs(), "Executing remote command");

        let mut session = self.open_session(host).await?;
        match tokio::time::timeout(timeout, session.exec(command, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::TimedOut { timeout }),
        }
    }

    /// Whether a session to `host` can be opened right now
    pub async fn probe(&self, host: &str) -> Result<(), RemoteError> {
        self.open_session(host).await.map(|_| ())
    }

    /// Open a session; one that cannot be set up in time is a connection failure
    async fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let timeout = self.credentials.connect_timeout();
        match tokio::time::timeout(timeout, self.sessions.open(host, &self.credentials)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::connection(
                host,
                format!("session not established within {timeout:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_defaults() {
        let creds: Credentials = serde_yaml::from_str("username: bench\n").unwrap();
        assert_eq!(creds.port, 22);
        assert_eq!(creds.connect_timeout(), Duration::from_secs(10));
        assert!(creds.identity_file.is_none());
        assert_eq!(creds, Credentials::new("bench"));
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "partial".into(),
            stderr: "fio: file not found".into(),
        };
        assert_eq!(out.combined(), "partial\nfio: file not found");

        let out = CommandOutput {
            exit_code: 0,
            stdout: "ok".into(),
            stderr: String::new(),
        };
        assert_eq!(out.combined(), "ok");
    }
}
