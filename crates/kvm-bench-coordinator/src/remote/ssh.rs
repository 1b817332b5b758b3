//! Sessions backed by the system `ssh` client

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::{CommandOutput, Credentials, RemoteSession, SessionFactory};
use crate::command::{ProcessError, run_captured};
use crate::error::RemoteError;

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Opens sessions by checking the guest's SSH port, then runs each command
/// through `ssh` in batch mode
#[derive(Debug, Clone, Default)]
pub struct SshSessions;

impl SshSessions {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionFactory for SshSessions {
    async fn open(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let timeout = credentials.connect_timeout();
        match tokio::time::timeout(timeout, TcpStream::connect((host, credentials.port))).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(RemoteError::connection(host, e.to_string())),
            Err(_) => {
                return Err(RemoteError::connection(
                    host,
                    format!("connect timed out after {timeout:?}"),
                ));
            }
        }

        debug!(host = %host, port = credentials.port, "SSH port reachable");
        Ok(Box::new(SshSession {
            host: host.to_string(),
            credentials: credentials.clone(),
        }))
    }
}

struct SshSession {
    host: String,
    credentials: Credentials,
}

impl SshSession {
    fn args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.credentials.connect_timeout_secs),
            "-p".to_string(),
            self.credentials.port.to_string(),
        ];
        if let Some(identity) = &self.credentials.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push("--".to_string());
        args.push(format!("{}@{}", self.credentials.username, self.host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let args = self.args(command);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = run_captured("ssh", &args, timeout).await.map_err(|e| match e {
            ProcessError::TimedOut { timeout, .. } => RemoteError::TimedOut { timeout },
            ProcessError::Spawn { source, .. } => RemoteError::connection(&self.host, source.to_string()),
        })?;

        if output.exit_code == SSH_CONNECTION_FAILURE {
            return Err(RemoteError::connection(&self.host, output.diagnostic()));
        }

        Ok(CommandOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
