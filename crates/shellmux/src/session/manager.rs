//! Session manager facade.
//!
//! This module provides a thread-safe manager that creates sessions for the
//! different backends, keys them by id, and forwards input, resizes and
//! closes to them. It owns the [`Multiplexer`] all its sessions share.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use emulator::{Emulator, Vt100Emulator};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::multiplexer::{DispatcherStats, Multiplexer};
use super::state::{SessionError, SessionId, SessionState};
use super::terminal::TerminalSession;
use crate::config::Config;
use crate::known_hosts::KnownHostsStore;
#[cfg(unix)]
use crate::transport::PtyConnector;
use crate::transport::{Connector, SshConnector, SshTarget};

/// Information about a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// What the session connects to.
    pub target: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Number of raw output subscribers.
    pub subscribers: usize,
    /// When the session was created.
    pub created_at: SystemTime,
}

impl SessionInfo {
    fn of(session: &TerminalSession) -> Self {
        let (cols, rows) = session.size();
        Self {
            id: session.id().clone(),
            target: session.target().to_string(),
            state: session.state(),
            cols,
            rows,
            subscribers: session.subscriber_count(),
            created_at: session.created_at(),
        }
    }
}

/// Creates and tracks terminal sessions.
///
/// Sessions stay in the manager after they close or fail so their final
/// state and failure cause can still be inspected; [`SessionManager::cleanup`]
/// drops them.
pub struct SessionManager {
    config: Config,
    mux: Multiplexer,
    sessions: DashMap<SessionId, Arc<TerminalSession>>,
    /// Makes the session limit check and the insert one step.
    create_lock: Mutex<()>,
    known_hosts: Arc<KnownHostsStore>,
}

impl SessionManager {
    /// Creates a manager, loading the known hosts file named in `config`.
    pub fn new(config: Config) -> Self {
        let known_hosts = KnownHostsStore::new(config.ssh.known_hosts_path());
        if let Err(e) = known_hosts.load() {
            tracing::warn!(error = %e, "Failed to load known hosts, starting empty");
        }
        Self::with_known_hosts(config, Arc::new(known_hosts))
    }

    /// Creates a manager with an explicit known hosts store.
    pub fn with_known_hosts(config: Config, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            mux: Multiplexer::new(config.dispatcher.clone()),
            config,
            sessions: DashMap::new(),
            create_lock: Mutex::new(()),
            known_hosts,
        }
    }

    /// Opens an SSH session. Returns as soon as the handshake has started.
    pub fn create_ssh(
        &self,
        cols: u16,
        rows: u16,
        target: SshTarget,
    ) -> Result<SessionId, SessionError> {
        let ssh = &self.config.ssh;
        let connector = SshConnector::new(target, Arc::clone(&self.known_hosts))
            .with_term(ssh.term.clone())
            .with_host_key_policy(ssh.host_key_policy)
            .with_keepalive(ssh.keepalive());

        self.create_with(cols, rows, Arc::new(connector), self.new_emulator(cols, rows))
    }

    /// Spawns a local shell, `shell` or the configured one.
    #[cfg(unix)]
    pub fn create_local(
        &self,
        cols: u16,
        rows: u16,
        shell: Option<String>,
    ) -> Result<SessionId, SessionError> {
        let shell = shell.unwrap_or_else(|| self.config.pty.shell.clone());
        let connector = PtyConnector::new(Some(shell)).with_term(self.config.pty.term.clone());

        self.create_with(cols, rows, Arc::new(connector), self.new_emulator(cols, rows))
    }

    /// Creates a session over any connector and emulator.
    pub fn create_with(
        &self,
        cols: u16,
        rows: u16,
        connector: Arc<dyn Connector>,
        emulator: Box<dyn Emulator>,
    ) -> Result<SessionId, SessionError> {
        let reserved = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let live = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .count();
        if live >= self.config.session.max_sessions {
            return Err(SessionError::TooManySessions(self.config.session.max_sessions));
        }

        let session = TerminalSession::new(
            self.mux.clone(),
            connector,
            emulator,
            cols,
            rows,
            self.config.handshake.clone(),
        );
        let id = session.id().clone();

        tracing::info!(session_id = %id, target = %session.target(), cols, rows, "Created session");

        self.sessions.insert(id.clone(), Arc::clone(&session));
        drop(reserved);

        session.start();
        Ok(id)
    }

    fn new_emulator(&self, cols: u16, rows: u16) -> Box<dyn Emulator> {
        Box::new(Vt100Emulator::new(cols, rows, self.config.terminal.scrollback))
    }

    fn session(&self, id: &str) -> Result<Arc<TerminalSession>, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Sends input to a session.
    pub async fn send(&self, id: &str, data: &[u8]) -> Result<(), SessionError> {
        self.session(id)?.write(data).await
    }

    /// Resizes a session's terminal.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.session(id)?.resize(cols, rows).await
    }

    /// Closes a session and forgets it.
    pub async fn close(&self, id: &str) -> Result<(), SessionError> {
        let session = self.session(id)?;
        session.close().await;
        self.sessions.remove(id);
        Ok(())
    }

    /// Cursor position as `(x, y)`.
    pub fn cursor(&self, id: &str) -> Result<(u16, u16), SessionError> {
        Ok(self.session(id)?.cursor())
    }

    pub fn state(&self, id: &str) -> Result<SessionState, SessionError> {
        Ok(self.session(id)?.state())
    }

    /// Why a session failed, if it did.
    pub fn failure(&self, id: &str) -> Result<Option<Arc<SessionError>>, SessionError> {
        Ok(self.session(id)?.failure())
    }

    /// Waits for a session's handshake to finish.
    pub async fn wait_connected(&self, id: &str) -> Result<(), Arc<SessionError>> {
        let session = self.session(id).map_err(Arc::new)?;
        session.wait_connected().await
    }

    /// Subscribes to a session's raw output.
    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<Vec<u8>>, SessionError> {
        Ok(self.session(id)?.subscribe())
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|entry| SessionInfo::of(entry.value()))
    }

    /// Lists all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo::of(entry.value()))
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.mux.stats()
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn known_hosts(&self) -> &Arc<KnownHostsStore> {
        &self.known_hosts
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drops closed and failed sessions, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state().is_terminal())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in finished {
            if let Some((id, session)) = self.sessions.remove(&id) {
                tracing::info!(session_id = %id, state = %session.state(), "Cleaned up session");
                removed += 1;
            }
        }
        removed
    }

    /// Starts a background task that periodically runs [`SessionManager::cleanup`].
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.cleanup();
            }
        })
    }

    /// Closes every session and waits for the dispatcher to stop.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<TerminalSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in sessions {
            session.close().await;
        }
        self.mux.shutdown().await;
        self.sessions.clear();

        tracing::info!("Session manager shut down");
    }
}
