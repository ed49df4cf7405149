//! SSH connection management
//!
//! Owns one lazily-established SSH connection to the mail host,
//! optionally tunnelled through a jump host. The connection is
//! checked before every use and replaced when it is found dead.

use crate::config::SshConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Client handler that accepts every host key.
///
/// The mail host and jump host live on a closed private network and
/// their keys are rotated without notice, so host identity is not
/// verified.
#[derive(Debug)]
pub struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH session to the target host.
pub type SshHandle = Handle<AcceptAnyHostKey>;

/// Live sessions. The jump session must outlive the target session
/// because the target transport is a channel inside it.
struct Link {
    target: Arc<SshHandle>,
    jump: Option<SshHandle>,
}

impl Link {
    async fn shutdown(self) -> Result<()> {
        let result = self
            .target
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::Connection(format!("disconnect failed: {e}")));

        if let Some(jump) = self.jump
            && let Err(e) = jump.disconnect(Disconnect::ByApplication, "", "en").await
        {
            debug!("Jump host disconnect failed: {}", e);
        }

        result
    }
}

/// Reusable SSH connection to the mail host.
///
/// Connecting, liveness checks, reconnecting and closing are serialized by an
/// internal lock. Commands run on their own channels and do not hold it.
pub struct SshConnection {
    config: SshConfig,
    link: Mutex<Option<Link>>,
}

impl SshConnection {
    #[must_use]
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Return a live session, connecting or reconnecting as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if a key cannot be loaded, a host
    /// cannot be reached, or authentication is rejected.
    pub async fn ensure_connected(&self) -> Result<Arc<SshHandle>> {
        let mut link = self.link.lock().await;

        if let Some(existing) = link.as_ref() {
            if is_alive(&existing.target).await {
                return Ok(Arc::clone(&existing.target));
            }
            warn!("SSH connection to {} failed liveness check, reconnecting", self.config.host);
            if let Some(stale) = link.take() {
                stale.shutdown().await.ok();
            }
        }

        let fresh = self.connect().await?;
        let target = Arc::clone(&fresh.target);
        *link = Some(fresh);
        drop(link);
        Ok(target)
    }

    /// Disconnect. The next [`ensure_connected`](Self::ensure_connected)
    /// establishes a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the disconnect message cannot be
    /// sent; the connection is dropped either way.
    pub async fn close(&self) -> Result<()> {
        let live = self.link.lock().await.take();
        match live {
            Some(live) => {
                info!("Closing SSH connection to {}", self.config.host);
                live.shutdown().await
            }
            None => Ok(()),
        }
    }

    async fn connect(&self) -> Result<Link> {
        let key = load_key(&self.config.key_path)?;
        let ssh_config = Arc::new(client::Config::default());

        let Some(jump) = &self.config.jump else {
            debug!("Connecting to {}:{}", self.config.host, self.config.port);
            let mut target = client::connect(
                ssh_config,
                (self.config.host.as_str(), self.config.port),
                AcceptAnyHostKey,
            )
            .await
            .map_err(|e| Error::Connection(format!("failed to connect: {e}")))?;

            authenticate(&mut target, &self.config.user, key, "target host").await?;
            info!("Connected to {}", self.config.host);
            return Ok(Link {
                target: Arc::new(target),
                jump: None,
            });
        };

        let jump_key_path = self.config.jump_key_path().unwrap_or(&self.config.key_path);
        let jump_key = load_key(jump_key_path)?;

        debug!("Connecting to jump host {}:{}", jump.host, jump.port);
        let mut jump_handle = client::connect(
            Arc::clone(&ssh_config),
            (jump.host.as_str(), jump.port),
            AcceptAnyHostKey,
        )
        .await
        .map_err(|e| Error::Connection(format!("failed to connect to jump host: {e}")))?;

        authenticate(&mut jump_handle, &jump.user, jump_key, "jump host").await?;

        debug!(
            "Opening tunnel from {} to {}:{}",
            jump.host, self.config.host, self.config.port
        );
        let channel = jump_handle
            .channel_open_direct_tcpip(
                self.config.host.clone(),
                u32::from(self.config.port),
                "127.0.0.1",
                0,
            )
            .await
            .map_err(|e| Error::Connection(format!("failed to dial target through jump: {e}")))?;

        let mut target = client::connect_stream(ssh_config, channel.into_stream(), AcceptAnyHostKey)
            .await
            .map_err(|e| Error::Connection(format!("failed to create client connection: {e}")))?;

        authenticate(&mut target, &self.config.user, key, "target host").await?;
        info!("Connected to {} via {}", self.config.host, jump.host);

        Ok(Link {
            target: Arc::new(target),
            jump: Some(jump_handle),
        })
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: Option<u32>,
}

/// Run one command on its own session channel and wait for it to exit.
///
/// # Errors
///
/// Returns [`Error::Command`] if the channel cannot be opened or the
/// exec request is refused. A non-zero exit is reported through
/// [`CommandOutput::status`], not as an error.
pub async fn run(handle: &SshHandle, command: &str) -> Result<CommandOutput> {
    let session_error = |e: russh::Error| Error::Command {
        command: command.to_string(),
        status: None,
        stderr: format!("session failed: {e}"),
    };

    let mut channel = handle.channel_open_session().await.map_err(session_error)?;
    channel.exec(true, command).await.map_err(session_error)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        status,
    })
}

async fn is_alive(handle: &SshHandle) -> bool {
    match handle.channel_open_session().await {
        Ok(channel) => {
            channel.close().await.ok();
            true
        }
        Err(e) => {
            debug!("Liveness check failed: {}", e);
            false
        }
    }
}

fn load_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .map_err(|e| Error::Connection(format!("failed to load SSH key {}: {e}", path.display())))
}

async fn authenticate(handle: &mut SshHandle, user: &str, key: KeyPair, peer: &str) -> Result<()> {
    let accepted = handle
        .authenticate_publickey(user, Arc::new(key))
        .await
        .map_err(|e| Error::Connection(format!("{peer} authentication failed: {e}")))?;

    if accepted {
        Ok(())
    } else {
        Err(Error::Connection(format!("{peer} rejected public key for {user}")))
    }
}
