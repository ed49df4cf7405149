//! Remote command execution
//!
//! [`Remote`] is the seam every workflow goes through: one command in,
//! trimmed stdout or an error out. [`SshConnection`] is the production
//! implementation.

use crate::connection::{self, SshConnection};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

/// Something that can run shell commands on the mail host.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Run `command` to completion and return its stdout with trailing
    /// whitespace trimmed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if no connection can be made and
    /// [`Error::Command`] on a non-zero exit or session failure.
    async fn execute(&self, command: &str) -> Result<String>;

    /// Program used to elevate privileged commands, e.g. `doas`.
    fn privilege(&self) -> &str;

    /// `command` prefixed with the privilege program.
    fn privileged(&self, command: &str) -> String {
        format!("{} {command}", self.privilege())
    }
}

#[async_trait]
impl Remote for SshConnection {
    async fn execute(&self, command: &str) -> Result<String> {
        let handle = self.ensure_connected().await?;
        debug!("Executing: {}", command);

        let output = match self.config().command_timeout {
            Some(limit) => tokio::time::timeout(limit, connection::run(&handle, command))
                .await
                .map_err(|_| Error::Command {
                    command: command.to_string(),
                    status: None,
                    stderr: format!("timed out after {}s", limit.as_secs()),
                })??,
            None => connection::run(&handle, command).await?,
        };

        match output.status {
            Some(0) => Ok(output.stdout.trim_end().to_string()),
            status => Err(Error::Command {
                command: command.to_string(),
                status,
                stderr: output.stderr.trim_end().to_string(),
            }),
        }
    }

    fn privilege(&self) -> &str {
        &self.config().privilege
    }
}
