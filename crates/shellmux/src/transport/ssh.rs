//! Remote shells over SSH.
//!
//! [`SshConnector`] runs the whole handshake on the session's connect task:
//! TCP connect and key exchange, host key verification, authentication,
//! session channel, pty request and shell. The resulting channel is split
//! so the dispatcher can wait on the read half while writers use the write
//! half without contending for the same lock.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use russh::client::{self, Handle, Msg};
use russh::keys::{load_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect};

use super::{Connector, Transport};
use crate::known_hosts::{HostKeyDecision, HostKeyPolicy, KnownHost, KnownHostsStore};
use crate::session::SessionError;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How the client proves its identity.
#[derive(Clone)]
pub enum Credentials {
    /// Password authentication.
    Password(String),
    /// Public key authentication with a private key file.
    PrivateKeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// The `none` method; succeeds only on servers that allow it.
    None,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(..)"),
            Credentials::PrivateKeyFile { path, .. } => f
                .debug_struct("PrivateKeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
            Credentials::None => f.write_str("None"),
        }
    }
}

/// Where to connect and as whom.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
}

impl SshTarget {
    /// Creates a target on the default port.
    pub fn new(host: impl Into<String>, username: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            credentials,
        }
    }

    /// Overrides the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connects to an [`SshTarget`] and opens an interactive shell.
#[derive(Clone)]
pub struct SshConnector {
    target: SshTarget,
    term: String,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
    keepalive: Option<Duration>,
}

impl SshConnector {
    /// Creates a connector verifying host keys against `known_hosts`.
    pub fn new(target: SshTarget, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            target,
            term: "xterm-256color".to_string(),
            policy: HostKeyPolicy::default(),
            known_hosts,
            keepalive: None,
        }
    }

    /// Sets the terminal type sent with the pty request.
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    /// Sets the host key policy.
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sends keepalives at this interval once connected.
    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive = interval;
        self
    }

    /// Returns the target.
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn failed(&self, reason: impl std::fmt::Display) -> SessionError {
        SessionError::ConnectionFailed {
            target: self.target.address(),
            reason: reason.to_string(),
        }
    }

    async fn authenticate(&self, handle: &mut Handle<HostKeyVerifier>) -> Result<(), SessionError> {
        let user = self.target.username.clone();

        let result = match &self.target.credentials {
            Credentials::Password(password) => handle
                .authenticate_password(user.clone(), password.clone())
                .await
                .map_err(|e| self.failed(e))?,
            Credentials::PrivateKeyFile { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    self.failed(format!("cannot load key {}: {e}", path.display()))
                })?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| self.failed(e))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        user.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
                    .map_err(|e| self.failed(e))?
            }
            Credentials::None => handle
                .authenticate_none(user.clone())
                .await
                .map_err(|e| self.failed(e))?,
        };

        if result.success() {
            Ok(())
        } else {
            Err(SessionError::AuthenticationFailed {
                user,
                target: self.target.address(),
            })
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    fn describe(&self) -> String {
        format!("{}@{}", self.target.username, self.target.address())
    }

    async fn connect(&self, cols: u16, rows: u16) -> Result<Arc<dyn Transport>, SessionError> {
        let config = Arc::new(client::Config {
            keepalive_interval: self.keepalive,
            ..Default::default()
        });

        let rejection = Arc::new(Mutex::new(None));
        let verifier = HostKeyVerifier {
            host: self.target.host.clone(),
            port: self.target.port,
            policy: self.policy,
            store: Arc::clone(&self.known_hosts),
            rejection: Arc::clone(&rejection),
        };

        tracing::debug!(target_host = %self.describe(), "Opening SSH connection");

        let mut handle = match client::connect(
            config,
            (self.target.host.as_str(), self.target.port),
            verifier,
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let rejected = rejection
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                return Err(match rejected {
                    Some((fingerprint, reason)) => SessionError::HostKeyRejected {
                        host: self.target.address(),
                        fingerprint,
                        reason,
                    },
                    None => self.failed(e),
                });
            }
        };

        if let Err(e) = self.authenticate(&mut handle).await {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(e);
        }

        let opened = async {
            let channel = handle.channel_open_session().await?;
            channel
                .request_pty(false, &self.term, u32::from(cols), u32::from(rows), 0, 0, &[])
                .await?;
            channel.request_shell(false).await?;
            Ok::<_, russh::Error>(channel)
        }
        .await;

        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                return Err(self.failed(format!("cannot open shell: {e}")));
            }
        };

        tracing::info!(target_host = %self.describe(), cols, rows, "SSH shell opened");

        let (reader, writer) = channel.split();
        Ok(Arc::new(SshTransport {
            handle,
            reader: tokio::sync::Mutex::new(reader),
            writer,
            pending: Mutex::new(Pending::default()),
        }))
    }
}

/// Applies the host key policy during key exchange.
pub struct HostKeyVerifier {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    store: Arc<KnownHostsStore>,
    rejection: Arc<Mutex<Option<(String, String)>>>,
}

impl HostKeyVerifier {
    fn verify(&self, fingerprint: &str) -> Result<(), String> {
        let status = self
            .store
            .check(&self.host, self.port, fingerprint)
            .map_err(|e| e.to_string())?;

        match self.policy.evaluate(&status) {
            HostKeyDecision::Accept => {
                if let Err(e) = self.store.touch(&self.host, self.port) {
                    tracing::debug!(error = %e, "Failed to refresh known host");
                }
                Ok(())
            }
            HostKeyDecision::AcceptAndRecord => {
                self.store
                    .add(KnownHost::new(&self.host, self.port, fingerprint))
                    .map_err(|e| e.to_string())?;
                if let Err(e) = self.store.save() {
                    tracing::warn!(error = %e, "Failed to persist known hosts");
                }
                Ok(())
            }
            HostKeyDecision::Reject(reason) => Err(reason),
        }
    }
}

impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();

        match self.verify(&fingerprint) {
            Ok(()) => {
                tracing::debug!(host = %self.host, %fingerprint, "Host key accepted");
                Ok(true)
            }
            Err(reason) => {
                tracing::warn!(host = %self.host, %fingerprint, %reason, "Host key rejected");
                *self
                    .rejection
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some((fingerprint, reason));
                Ok(false)
            }
        }
    }
}

#[derive(Default)]
struct Pending {
    buf: BytesMut,
    eof: bool,
}

/// An open SSH shell channel.
pub struct SshTransport {
    handle: Handle<HostKeyVerifier>,
    reader: tokio::sync::Mutex<ChannelReadHalf>,
    writer: ChannelWriteHalf<Msg>,
    pending: Mutex<Pending>,
}

impl SshTransport {
    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_input(&self) -> bool {
        let pending = self.pending();
        !pending.buf.is_empty() || pending.eof
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn readable(&self) -> io::Result<()> {
        if self.has_input() {
            return Ok(());
        }

        // `wait` is cancel-safe, so dropping this future mid-wait loses nothing.
        let mut reader = self.reader.lock().await;
        loop {
            if self.has_input() {
                return Ok(());
            }
            match reader.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    self.pending().buf.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    self.pending().buf.extend_from_slice(&data);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    self.pending().eof = true;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    tracing::debug!(exit_status, "Remote shell exited");
                }
                Some(_) => {}
            }
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pending = self.pending();
        if !pending.buf.is_empty() {
            let n = buf.len().min(pending.buf.len());
            buf[..n].copy_from_slice(&pending.buf[..n]);
            pending.buf.advance(n);
            return Ok(n);
        }
        if pending.eof {
            return Ok(0);
        }
        Err(io::ErrorKind::WouldBlock.into())
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.writer
            .data(data)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    async fn resize_pty(&self, cols: u16, rows: u16) -> io::Result<()> {
        self.writer
            .window_change(u32::from(cols), u32::from(rows), 0, 0)
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }

    async fn close(&self) -> io::Result<()> {
        let _ = self.writer.eof().await;
        let _ = self.writer.close().await;
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }
}
