//! Error types for mailhub-admin

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Transport or authentication failure. The next call reconnects.
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// The remote command exited non-zero or its channel failed.
    #[error("Command `{command}` failed (exit status {status:?}): {stderr}")]
    Command {
        command: String,
        status: Option<u32>,
        stderr: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an error with a description of the workflow step that failed,
    /// keeping the variant so callers can still match on it.
    #[must_use]
    pub fn context(self, step: &str) -> Self {
        match self {
            Self::Command {
                command,
                status,
                stderr,
            } => Self::Command {
                command,
                status,
                stderr: format!("{step}: {stderr}"),
            },
            Self::Connection(msg) => Self::Connection(format!("{step}: {msg}")),
            other => other,
        }
    }

    /// Mask every occurrence of `secret` in the command and stderr text.
    #[must_use]
    pub fn redact(self, secret: &str) -> Self {
        if secret.is_empty() {
            return self;
        }
        match self {
            Self::Command {
                command,
                status,
                stderr,
            } => Self::Command {
                command: command.replace(secret, "********"),
                status,
                stderr: stderr.replace(secret, "********"),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
