//! SSH and administration configuration

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Intermediate host the target is reached through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpHostConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Key for the jump host. `None` reuses the target key.
    pub key_path: Option<PathBuf>,
}

/// SSH connection configuration for the mail host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub jump: Option<JumpHostConfig>,
    /// Program prefixed to privileged commands (`doas`, `sudo -n`, ...).
    pub privilege: String,
    /// Upper bound for a single remote command. `None` waits forever.
    pub command_timeout: Option<Duration>,
}

impl SshConfig {
    /// Direct connection with the default privilege program and no timeout.
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            key_path: key_path.into(),
            jump: None,
            privilege: "doas".to_string(),
            command_timeout: None,
        }
    }

    /// Key used to authenticate against the jump host.
    #[must_use]
    pub fn jump_key_path(&self) -> Option<&PathBuf> {
        self.jump
            .as_ref()
            .map(|jump| jump.key_path.as_ref().unwrap_or(&self.key_path))
    }

    /// Load SSH configuration from environment variables
    ///
    /// Reads from `.env` file if present. All variables are optional:
    /// - `CMH_SSH_HOST` (default: `localhost`)
    /// - `CMH_SSH_PORT` (default: `22`)
    /// - `CMH_SSH_USER` (default: `postman`)
    /// - `CMH_SSH_KEY_PATH` (default: `/secrets/mailhub_key`)
    /// - `CMH_SSH_JUMP_HOST` (unset or empty: connect directly)
    /// - `CMH_SSH_JUMP_PORT` (default: `22`)
    /// - `CMH_SSH_JUMP_USER` (default: `ubuntu`)
    /// - `CMH_SSH_JUMP_KEY_PATH` (default: reuse `CMH_SSH_KEY_PATH`)
    /// - `CMH_SSH_COMMAND_TIMEOUT_SECS` (default: no timeout)
    /// - `CMH_PRIVILEGE_CMD` (default: `doas`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a port or timeout that is not a
    /// number.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let jump = match var("CMH_SSH_JUMP_HOST") {
            Some(host) => Some(JumpHostConfig {
                host,
                port: parse_port("CMH_SSH_JUMP_PORT", &or("CMH_SSH_JUMP_PORT", "22"))?,
                user: or("CMH_SSH_JUMP_USER", "ubuntu"),
                key_path: var("CMH_SSH_JUMP_KEY_PATH").map(PathBuf::from),
            }),
            None => None,
        };

        let command_timeout = var("CMH_SSH_COMMAND_TIMEOUT_SECS")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| Error::Config(format!("Invalid CMH_SSH_COMMAND_TIMEOUT_SECS: {e}")))
            })
            .transpose()?;

        Ok(Self {
            host: or("CMH_SSH_HOST", "localhost"),
            port: parse_port("CMH_SSH_PORT", &or("CMH_SSH_PORT", "22"))?,
            user: or("CMH_SSH_USER", "postman"),
            key_path: PathBuf::from(or("CMH_SSH_KEY_PATH", "/secrets/mailhub_key")),
            jump,
            privilege: or("CMH_PRIVILEGE_CMD", "doas"),
            command_timeout,
        })
    }
}

/// Everything needed to wire the administration services together
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub ssh: SshConfig,
    pub audit_path: PathBuf,
}

impl AdminConfig {
    /// Load the SSH configuration plus `AUDIT_LOG_PATH`
    /// (default: `/data/audit.db`).
    ///
    /// # Errors
    ///
    /// Same as [`SshConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        let ssh = SshConfig::from_env()?;
        let audit_path = env::var("AUDIT_LOG_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map_or_else(|| PathBuf::from("/data/audit.db"), PathBuf::from);
        Ok(Self { ssh, audit_path })
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {key}: {e}")))
}
