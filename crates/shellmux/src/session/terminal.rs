//! A shell session bound to one transport and one terminal emulator.
//!
//! The handshake runs on a task of its own. Once the transport is up the
//! session registers with its [`Multiplexer`], whose dispatcher calls
//! [`TerminalSession::read`] whenever the transport is readable. Everything
//! else (writes, resizes, close) may be called from any task.

use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::SystemTime;

use emulator::Emulator;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::multiplexer::Multiplexer;
use super::registry::ReadinessHandle;
use super::state::{new_session_id, SessionError, SessionId, SessionState};
use crate::config::HandshakeConfig;
use crate::transport::{Connector, Transport};

/// Capacity of the raw output broadcast channel.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One interactive shell.
pub struct TerminalSession {
    id: SessionId,
    target: String,
    created_at: SystemTime,
    connector: Arc<dyn Connector>,
    handshake: HandshakeConfig,
    mux: Multiplexer,
    size: Mutex<(u16, u16)>,
    state_tx: watch::Sender<SessionState>,
    failure: Mutex<Option<Arc<SessionError>>>,
    readiness: OnceLock<ReadinessHandle>,
    emulator: Mutex<Box<dyn Emulator>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    write_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl TerminalSession {
    /// Creates a session in the `Created` state. Nothing is connected until
    /// [`TerminalSession::start`] or [`TerminalSession::connect`] runs.
    ///
    /// Zero dimensions are clamped to 1.
    pub fn new(
        mux: Multiplexer,
        connector: Arc<dyn Connector>,
        mut emulator: Box<dyn Emulator>,
        cols: u16,
        rows: u16,
        handshake: HandshakeConfig,
    ) -> Arc<Self> {
        let cols = cols.max(1);
        let rows = rows.max(1);
        if emulator.size() != (cols, rows) {
            emulator.resize(cols, rows);
        }

        let (state_tx, _) = watch::channel(SessionState::Created);
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);

        Arc::new(Self {
            id: new_session_id(),
            target: connector.describe(),
            created_at: SystemTime::now(),
            connector,
            handshake,
            mux,
            size: Mutex::new((cols, rows)),
            state_tx,
            failure: Mutex::new(None),
            readiness: OnceLock::new(),
            emulator: Mutex::new(emulator),
            output_tx,
            write_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawns [`TerminalSession::connect`] and returns immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.connect().await })
    }

    /// Runs the handshake to completion.
    ///
    /// Only the first call does anything. On success the session is
    /// `Connected` and registered; on failure it is `Failed` with the cause
    /// available from [`TerminalSession::failure`].
    pub async fn connect(self: &Arc<Self>) {
        if !self.transition(|s| s == SessionState::Created, SessionState::Connecting) {
            tracing::debug!(session_id = %self.id, state = %self.state(), "Connect skipped");
            return;
        }

        tracing::info!(session_id = %self.id, target = %self.target, "Connecting session");

        match self.handshake().await {
            Ok(()) => {}
            Err(SessionError::Cancelled(_)) => {
                tracing::debug!(session_id = %self.id, "Handshake cancelled");
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn handshake(self: &Arc<Self>) -> Result<(), SessionError> {
        let (cols, rows) = self.size();

        let transport = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled(self.id.clone())),
            result = self.connector.connect(cols, rows) => result?,
        };

        if let Err(e) = self.wait_ready(transport.as_ref()).await {
            if let Err(close_err) = transport.close().await {
                tracing::debug!(session_id = %self.id, error = %close_err, "Close after failed handshake");
            }
            return Err(e);
        }

        // Dimensions may have changed while the handshake ran.
        let (cols, rows) = self.size();
        if let Err(e) = transport.resize_pty(cols, rows).await {
            tracing::warn!(session_id = %self.id, error = %e, "Initial pty resize failed");
        }

        if !self.establish(transport) {
            return Err(SessionError::Cancelled(self.id.clone()));
        }

        match self.mux.add_session(Arc::clone(self)) {
            Ok(()) => {
                tracing::info!(session_id = %self.id, target = %self.target, "Session connected");
                Ok(())
            }
            Err(SessionError::NotConnected(_)) if self.state().is_terminal() => {
                Err(SessionError::Cancelled(self.id.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Polls the transport until it first becomes readable.
    async fn wait_ready(&self, transport: &dyn Transport) -> Result<(), SessionError> {
        let interval = self.handshake.poll_interval();
        let attempts = self.handshake.poll_attempts;

        for attempt in 1..=attempts {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(SessionError::Cancelled(self.id.clone()));
                }
                polled = timeout(interval, transport.readable()) => match polled {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) => {
                        return Err(SessionError::ConnectionFailed {
                            target: self.target.clone(),
                            reason: e.to_string(),
                        });
                    }
                    Err(_) => {
                        tracing::trace!(session_id = %self.id, attempt, attempts, "Shell not ready yet");
                    }
                },
            }
        }

        Err(SessionError::HandshakeTimeout {
            target: self.target.clone(),
            attempts,
        })
    }

    /// Publishes the transport and moves `Connecting` to `Connected`.
    ///
    /// Returns false if the session left `Connecting` meanwhile, in which
    /// case the transport is closed in the background.
    fn establish(&self, transport: Arc<dyn Transport>) -> bool {
        if self.readiness.set(ReadinessHandle::new(Arc::clone(&transport))).is_err() {
            return false;
        }

        if self.transition(|s| s == SessionState::Connecting, SessionState::Connected) {
            return true;
        }

        // Closed between the handshake and here; close() may already have
        // seen the handle, closing twice is harmless.
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.close().await {
                tracing::debug!(session_id = %id, error = %e, "Close of abandoned transport");
            }
        });
        false
    }

    async fn fail(&self, error: SessionError) {
        {
            let mut failure = lock(&self.failure);
            if !self.transition(
                |s| matches!(s, SessionState::Connecting | SessionState::Connected),
                SessionState::Failed,
            ) {
                return;
            }
            tracing::error!(session_id = %self.id, target = %self.target, error = %error, "Session failed");
            *failure = Some(Arc::new(error));
        }

        self.mux.remove_and_close(&self.id);
        self.cancel.cancel();
        if let Some(handle) = self.readiness.get() {
            let _ = handle.transport().close().await;
        }
    }

    /// Reads one chunk from the transport into the emulator.
    ///
    /// Called by the dispatcher after the readiness handle fired. End of
    /// stream or a read error closes the session.
    pub(crate) async fn read(&self, buf: &mut [u8]) {
        let Some(handle) = self.readiness_handle() else {
            return;
        };

        match handle.transport().try_read(buf) {
            Ok(0) => {
                tracing::info!(session_id = %self.id, "Remote end closed the channel");
                self.close().await;
            }
            Ok(n) => {
                let chunk = &buf[..n];
                lock(&self.emulator).feed(chunk);
                if self.output_tx.receiver_count() > 0 {
                    let _ = self.output_tx.send(chunk.to_vec());
                }
                tracing::trace!(session_id = %self.id, bytes = n, "Delivered output");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::trace!(session_id = %self.id, "Spurious readiness");
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Read failed, closing session");
                self.close().await;
            }
        }
    }

    /// Sends bytes to the shell.
    ///
    /// Concurrent writers are serialized; a failed write closes the session.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let handle = self
            .readiness_handle()
            .ok_or_else(|| SessionError::NotConnected(self.id.clone()))?;

        let _guard = self.write_lock.lock().await;
        if let Err(e) = handle.transport().write_all(data).await {
            tracing::warn!(session_id = %self.id, error = %e, "Write failed, closing session");
            self.close().await;
            return Err(SessionError::TransportClosed(self.id.clone()));
        }
        Ok(())
    }

    /// Changes the terminal size.
    ///
    /// The emulator is always resized. The far end is told only while the
    /// session is connected; a pending handshake picks up the new size when
    /// it finishes. Zero dimensions are clamped to 1.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let cols = cols.max(1);
        let rows = rows.max(1);

        *lock(&self.size) = (cols, rows);
        lock(&self.emulator).resize(cols, rows);

        if let Some(handle) = self.readiness_handle() {
            handle
                .transport()
                .resize_pty(cols, rows)
                .await
                .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        }

        tracing::debug!(session_id = %self.id, cols, rows, "Session resized");
        Ok(())
    }

    /// Closes the session. Safe to call any number of times, in any state.
    pub async fn close(&self) {
        if !self.transition(|s| !s.is_terminal(), SessionState::Closed) {
            return;
        }

        self.cancel.cancel();
        self.mux.remove_and_close(&self.id);

        if let Some(handle) = self.readiness.get() {
            if let Err(e) = handle.transport().close().await {
                tracing::debug!(session_id = %self.id, error = %e, "Transport close failed");
            }
        }

        tracing::info!(session_id = %self.id, "Session closed");
    }

    /// Waits until the handshake finishes.
    ///
    /// Returns the failure cause if the session did not reach `Connected`.
    pub async fn wait_connected(&self) -> Result<(), Arc<SessionError>> {
        let mut rx = self.state_tx.subscribe();
        let state = match rx.wait_for(|s| !s.is_pending()).await {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        };

        match state {
            SessionState::Connected => Ok(()),
            SessionState::Failed => Err(self
                .failure()
                .unwrap_or_else(|| Arc::new(SessionError::NotConnected(self.id.clone())))),
            _ => Err(Arc::new(SessionError::NotConnected(self.id.clone()))),
        }
    }

    fn transition(&self, from: impl Fn(SessionState) -> bool, to: SessionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if from(*state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Description of what this session connects to.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Receives every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Receives raw output chunks in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.output_tx.receiver_count()
    }

    /// Why the session failed, if it did.
    pub fn failure(&self) -> Option<Arc<SessionError>> {
        lock(&self.failure).clone()
    }

    /// Current `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    /// The readiness handle, present only while connected.
    pub fn readiness_handle(&self) -> Option<ReadinessHandle> {
        if self.state() == SessionState::Connected {
            self.readiness.get().cloned()
        } else {
            None
        }
    }

    /// Cursor position as `(x, y)`.
    pub fn cursor(&self) -> (u16, u16) {
        lock(&self.emulator).cursor()
    }

    /// Rows changed since the last call, clearing the set.
    pub fn take_dirty(&self) -> BTreeSet<u16> {
        lock(&self.emulator).take_dirty()
    }

    pub fn dirty_rows(&self) -> BTreeSet<u16> {
        lock(&self.emulator).dirty_rows()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.emulator).history_len()
    }

    /// Visible screen text.
    pub fn contents(&self) -> String {
        lock(&self.emulator).contents()
    }

    /// Runs `f` with exclusive access to the emulator.
    pub fn with_emulator<R>(&self, f: impl FnOnce(&mut dyn Emulator) -> R) -> R {
        let mut emulator = lock(&self.emulator);
        f(emulator.as_mut())
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
