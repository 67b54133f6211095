//! Session identity, lifecycle state and errors.

use thiserror::Error;
use uuid::Uuid;

use super::registry::ReadinessToken;

/// Unique identifier for a session.
pub type SessionId = String;

/// Generates a fresh process-unique session identifier.
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

/// Lifecycle state of a session.
///
/// ```text
/// Created ──► Connecting ──► Connected ──► Closed
///    │             │
///    │             └──────► Failed
///    └──────────────────────────────────► Closed
/// ```
///
/// `Closed` and `Failed` are terminal; reconnecting means creating a new
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Constructed, connect not started yet.
    Created,
    /// Handshake in progress on its own task.
    Connecting,
    /// Handshake complete and registered with the multiplexer.
    Connected,
    /// Closed by the caller or by the peer.
    Closed,
    /// Handshake could not complete; see [`super::TerminalSession::failure`].
    Failed,
}

impl SessionState {
    /// Returns true for `Closed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Returns true while the handshake has not finished.
    pub fn is_pending(self) -> bool {
        matches!(self, SessionState::Created | SessionState::Connecting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session is not in the `Connected` state.
    #[error("session not connected: {0}")]
    NotConnected(SessionId),

    /// A session with the same identity is already registered.
    #[error("duplicate session identity: {0}")]
    DuplicateIdentity(SessionId),

    /// A session with the same readiness handle is already registered.
    #[error("duplicate readiness handle: {0}")]
    DuplicateReadiness(ReadinessToken),

    /// The configured session limit was reached.
    #[error("too many sessions: limit is {0}")]
    TooManySessions(usize),

    /// The transport could not be established.
    #[error("connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    /// The remote side rejected the supplied credentials.
    #[error("authentication failed for {user}@{target}")]
    AuthenticationFailed { user: String, target: String },

    /// The host key policy refused the server's key.
    #[error("host key for {host} rejected ({fingerprint}): {reason}")]
    HostKeyRejected {
        host: String,
        fingerprint: String,
        reason: String,
    },

    /// The shell never signalled readiness within the handshake budget.
    #[error("shell on {target} not ready after {attempts} polls")]
    HandshakeTimeout { target: String, attempts: u32 },

    /// The session was closed while its handshake was in progress.
    #[error("handshake cancelled: {0}")]
    Cancelled(SessionId),

    /// The peer closed the channel or an I/O error ended it.
    #[error("transport closed: {0}")]
    TransportClosed(SessionId),

    /// Failed to spawn a local PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to resize the remote or local PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_generation() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
        assert!(!SessionState::Connecting.is_terminal());
    }

    #[test]
    fn test_pending_states() {
        assert!(SessionState::Created.is_pending());
        assert!(SessionState::Connecting.is_pending());
        assert!(!SessionState::Connected.is_pending());
        assert!(!SessionState::Failed.is_pending());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connected.to_string(), "connected");
        assert_eq!(SessionState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_error_messages() {
        let err = SessionError::HandshakeTimeout {
            target: "example.org:22".to_string(),
            attempts: 60,
        };
        assert_eq!(
            err.to_string(),
            "shell on example.org:22 not ready after 60 polls"
        );

        let err = SessionError::AuthenticationFailed {
            user: "root".to_string(),
            target: "10.0.0.1:22".to_string(),
        };
        assert!(err.to_string().contains("root@10.0.0.1:22"));
    }
}
