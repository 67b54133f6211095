//! Session registry plus the lifecycle of its dispatcher worker.
//!
//! A [`Multiplexer`] is a cheap, cloneable handle. Registering the first
//! session starts the dispatcher; removing the last one tells it to stop.
//! The registry, the "should continue" flag and the "worker running" bit
//! share one mutex, so deciding to start a worker and starting it happen
//! in one step and at most one worker ever runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::dispatcher;
use super::registry::SessionRegistry;
use super::state::{SessionError, SessionId, SessionState};
use super::terminal::TerminalSession;
use crate::config::DispatcherConfig;

pub(crate) struct MuxState {
    pub(crate) registry: SessionRegistry,
    pub(crate) should_continue: bool,
    pub(crate) worker_running: bool,
    /// Number of workers spawned so far; doubles as the current worker's epoch.
    pub(crate) starts: u64,
}

pub(crate) struct MuxInner {
    state: Mutex<MuxState>,
    /// Wakes the worker when the registry or the flag changes.
    pub(crate) changed: Notify,
    /// Signalled by a worker on its way out.
    pub(crate) worker_exit: Notify,
    pub(crate) config: DispatcherConfig,
}

impl MuxInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Observable dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Whether a worker is running.
    pub running: bool,
    /// Workers started over the multiplexer's lifetime.
    pub starts: u64,
    /// Registered sessions.
    pub sessions: usize,
}

/// Routes readiness of many sessions through a single worker.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Creates an empty multiplexer. No worker runs until a session is added.
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                state: Mutex::new(MuxState {
                    registry: SessionRegistry::new(),
                    should_continue: false,
                    worker_running: false,
                    starts: 0,
                }),
                changed: Notify::new(),
                worker_exit: Notify::new(),
                config,
            }),
        }
    }

    /// Registers a connected session and makes sure a worker serves it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_session(&self, session: Arc<TerminalSession>) -> Result<(), SessionError> {
        let mut state = self.inner.lock();

        if session.state() != SessionState::Connected {
            return Err(SessionError::NotConnected(session.id().clone()));
        }

        let id = session.id().clone();
        if let Err(e) = state.registry.add(session) {
            if matches!(e, SessionError::DuplicateIdentity(_)) {
                tracing::error!(session_id = %id, "Session registered twice");
            }
            return Err(e);
        }

        state.should_continue = true;
        if !state.worker_running {
            state.worker_running = true;
            state.starts += 1;
            let epoch = state.starts;
            tokio::spawn(dispatcher::run(Arc::clone(&self.inner), epoch));
            tracing::info!(epoch, "Dispatcher started");
        }

        tracing::debug!(session_id = %id, sessions = state.registry.size(), "Session registered");
        drop(state);

        self.inner.changed.notify_one();
        Ok(())
    }

    /// Deregisters a session; the dispatcher stops once none are left.
    ///
    /// Unknown ids are ignored. The session's transport is left to the
    /// session itself.
    pub fn remove_and_close(&self, id: &str) -> Option<Arc<TerminalSession>> {
        let mut state = self.inner.lock();
        let removed = state.registry.remove(id);

        if removed.is_some() {
            tracing::debug!(session_id = %id, sessions = state.registry.size(), "Session deregistered");
        }
        if state.registry.is_empty() && state.should_continue {
            state.should_continue = false;
            tracing::debug!("Last session gone, stopping dispatcher");
        }
        drop(state);

        self.inner.changed.notify_one();
        removed
    }

    /// Asks the worker to exit. Adding a session restarts it.
    pub fn stop(&self) {
        self.inner.lock().should_continue = false;
        self.inner.changed.notify_one();
    }

    /// Closes every registered session, stops the dispatcher and waits for
    /// the worker to exit.
    pub async fn shutdown(&self) {
        let sessions = self.inner.lock().registry.sessions();
        for session in sessions {
            session.close().await;
        }

        self.stop();

        loop {
            let exited = self.inner.worker_exit.notified();
            tokio::pin!(exited);
            exited.as_mut().enable();

            if !self.inner.lock().worker_running {
                break;
            }
            exited.await;
        }

        tracing::info!("Multiplexer shut down");
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.inner.lock();
        DispatcherStats {
            running: state.worker_running,
            starts: state.starts,
            sessions: state.registry.size(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().registry.size()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().registry.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.inner.lock().registry.get(id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.lock().registry.ids()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }
}
