//! Fake SSH server built on `russh::server`

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};

/// Generate an ed25519 client key, write it to `dir` in PKCS#8 PEM,
/// and return its path with the public half.
pub fn write_client_key(dir: &Path, name: &str) -> (PathBuf, PublicKey) {
    let key = KeyPair::generate_ed25519().expect("generate ed25519 key");
    let public = key.clone_public_key().expect("public half");
    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("create key file");
    russh_keys::encode_pkcs8_pem(&key, file).expect("write key file");
    (path, public)
}

#[derive(Default)]
struct State {
    /// User of every accepted authentication, in order.
    logins: Vec<String>,
    commands: Vec<String>,
    /// `host:port` of every forwarded channel.
    tunnels: Vec<String>,
    sessions: Vec<server::Handle>,
}

/// A fake SSH server that runs until dropped.
///
/// Commands are answered from a fixed table:
///
/// - `hostname` -> the server's name
/// - `echo <text>` -> `<text>`
/// - `false` -> exit status 1 with `false: failed` on stderr
/// - anything else -> empty output, exit status 0
pub struct FakeSshServer {
    port: u16,
    state: Arc<Mutex<State>>,
    /// Accept loop; aborted on drop.
    handle: tokio::task::JoinHandle<()>,
}

impl FakeSshServer {
    /// Start a server named `name` that accepts only `authorized`.
    pub async fn start(name: &str, authorized: PublicKey) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let config = Arc::new(server::Config {
            keys: vec![KeyPair::generate_ed25519().expect("generate host key")],
            auth_rejection_time: std::time::Duration::from_millis(10),
            auth_rejection_time_initial: Some(std::time::Duration::ZERO),
            ..Default::default()
        });

        let state = Arc::new(Mutex::new(State::default()));
        let name = name.to_string();

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handler = Connection {
                    name: name.clone(),
                    authorized: authorized.clone(),
                    state: accept_state.clone(),
                };
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, socket, handler).await {
                        session.await.ok();
                    }
                });
            }
        });

        Self { port, state, handle }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn logins(&self) -> Vec<String> {
        self.state.lock().unwrap().logins.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn tunnels(&self) -> Vec<String> {
        self.state.lock().unwrap().tunnels.clone()
    }

    /// Disconnect every authenticated client from the server side, as a
    /// restarted sshd or a dropped NAT mapping would.
    pub async fn drop_connections(&self) {
        let sessions: Vec<server::Handle> = self.state.lock().unwrap().sessions.drain(..).collect();
        for session in sessions {
            session
                .disconnect(Disconnect::ByApplication, "going away".into(), "en".into())
                .await
                .ok();
        }
        // Let the clients observe the disconnect.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

impl Drop for FakeSshServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Per-connection handler.
struct Connection {
    name: String,
    authorized: PublicKey,
    state: Arc<Mutex<State>>,
}

impl Connection {
    fn reply(&self, command: &str) -> (String, String, u32) {
        match command {
            "hostname" => (format!("{}\n", self.name), String::new(), 0),
            "false" => (String::new(), "false: failed\n".into(), 1),
            _ => match command.strip_prefix("echo ") {
                Some(text) => (format!("{text}\n"), String::new(), 0),
                None => (String::new(), String::new(), 0),
            },
        }
    }
}

#[async_trait]
impl server::Handler for Connection {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        if public_key.fingerprint() != self.authorized.fingerprint() {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }
        self.state.lock().unwrap().logins.push(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        self.state.lock().unwrap().sessions.push(session.handle());
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.state.lock().unwrap().commands.push(command.clone());
        let (stdout, stderr, status) = self.reply(&command);

        session.channel_success(channel);
        if !stdout.is_empty() {
            session.data(channel, CryptoVec::from(stdout));
        }
        if !stderr.is_empty() {
            session.extended_data(channel, 1, CryptoVec::from(stderr));
        }
        session.exit_status_request(channel, status);
        session.eof(channel);
        session.close(channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.state
            .lock()
            .unwrap()
            .tunnels
            .push(format!("{host_to_connect}:{port_to_connect}"));

        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let Ok(mut upstream) = TcpStream::connect((host_to_connect, port)).await else {
            return Ok(false);
        };

        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            tokio::io::copy_bidirectional(&mut stream, &mut upstream).await.ok();
        });
        Ok(true)
    }
}
