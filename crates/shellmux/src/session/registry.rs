//! Registered sessions, indexed by identity and by readiness handle.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::state::{SessionError, SessionId};
use super::terminal::TerminalSession;
use crate::transport::Transport;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a readiness handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadinessToken(u64);

impl ReadinessToken {
    /// Allocates a fresh token.
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ReadinessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The thing the dispatcher waits on for one session.
#[derive(Clone)]
pub struct ReadinessHandle {
    token: ReadinessToken,
    transport: Arc<dyn Transport>,
}

impl ReadinessHandle {
    /// Wraps `transport` under a fresh token.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            token: ReadinessToken::next(),
            transport,
        }
    }

    pub fn token(&self) -> ReadinessToken {
        self.token
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Resolves when the transport has something to read.
    pub async fn ready(&self) -> io::Result<()> {
        self.transport.readable().await
    }
}

impl PartialEq for ReadinessHandle {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for ReadinessHandle {}

impl std::fmt::Debug for ReadinessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessHandle")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Connected sessions known to one multiplexer.
///
/// The two maps always hold the same set of sessions. The registry has no
/// lock of its own; the multiplexer keeps it under the same mutex as the
/// dispatcher's lifecycle flag.
#[derive(Default)]
pub struct SessionRegistry {
    by_id: HashMap<SessionId, Arc<TerminalSession>>,
    by_token: HashMap<ReadinessToken, Arc<TerminalSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a connected session under its id and readiness token.
    pub fn add(&mut self, session: Arc<TerminalSession>) -> Result<(), SessionError> {
        let handle = session
            .readiness_handle()
            .ok_or_else(|| SessionError::NotConnected(session.id().clone()))?;

        if self.by_id.contains_key(session.id()) {
            return Err(SessionError::DuplicateIdentity(session.id().clone()));
        }
        if self.by_token.contains_key(&handle.token()) {
            return Err(SessionError::DuplicateReadiness(handle.token()));
        }

        self.by_token.insert(handle.token(), Arc::clone(&session));
        self.by_id.insert(session.id().clone(), session);
        Ok(())
    }

    /// Removes a session from both maps. Absent ids are ignored.
    pub fn remove(&mut self, id: &str) -> Option<Arc<TerminalSession>> {
        let session = self.by_id.remove(id)?;
        self.by_token.retain(|_, s| s.id() != session.id());
        Some(session)
    }

    /// Returns the readiness handles of every registered session, ordered
    /// by token.
    pub fn snapshot_readiness_handles(&self) -> Vec<ReadinessHandle> {
        let mut handles: Vec<ReadinessHandle> = self
            .by_token
            .values()
            .filter_map(|s| s.readiness_handle())
            .collect();
        handles.sort_by_key(|h| h.token());
        handles
    }

    pub fn size(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.by_id.get(id).cloned()
    }

    /// Finds the session owning a readiness token.
    pub fn lookup(&self, token: ReadinessToken) -> Option<Arc<TerminalSession>> {
        self.by_token.get(&token).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.by_id.keys().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<Arc<TerminalSession>> {
        self.by_id.values().cloned().collect()
    }

    /// Empties the registry, returning what it held.
    pub fn drain(&mut self) -> Vec<Arc<TerminalSession>> {
        self.by_token.clear();
        self.by_id.drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::terminal::tests::connected_session;

    #[test]
    fn test_tokens_are_unique() {
        let a = ReadinessToken::next();
        let b = ReadinessToken::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{}", ReadinessToken(7)), "#7");
    }

    #[tokio::test]
    async fn test_add_indexes_both_ways() {
        let (session, _peer) = connected_session("a").await;
        let token = session.readiness_handle().unwrap().token();

        let mut registry = SessionRegistry::new();
        registry.add(Arc::clone(&session)).unwrap();

        assert_eq!(registry.size(), 1);
        assert!(registry.contains(session.id()));
        assert_eq!(registry.lookup(token).unwrap().id(), session.id());
        assert_eq!(registry.get(session.id()).unwrap().id(), session.id());
        assert_eq!(registry.ids(), vec![session.id().clone()]);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let (session, _peer) = connected_session("a").await;

        let mut registry = SessionRegistry::new();
        registry.add(Arc::clone(&session)).unwrap();
        let err = registry.add(Arc::clone(&session)).unwrap_err();

        assert!(matches!(err, SessionError::DuplicateIdentity(id) if &id == session.id()));
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test]
    async fn test_unconnected_session_rejected() {
        let (session, _peer) = connected_session("a").await;
        session.close().await;

        let mut registry = SessionRegistry::new();
        assert!(matches!(
            registry.add(session),
            Err(SessionError::NotConnected(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_clears_both_maps() {
        let (session, _peer) = connected_session("a").await;
        let token = session.readiness_handle().unwrap().token();

        let mut registry = SessionRegistry::new();
        registry.add(Arc::clone(&session)).unwrap();

        assert!(registry.remove(session.id()).is_some());
        assert!(registry.lookup(token).is_none());
        assert!(registry.get(session.id()).is_none());
        assert!(registry.snapshot_readiness_handles().is_empty());

        // Removing again is a no-op.
        assert!(registry.remove(session.id()).is_none());
        assert!(registry.remove("missing").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_ordered_by_token() {
        let (a, _pa) = connected_session("a").await;
        let (b, _pb) = connected_session("b").await;
        let (c, _pc) = connected_session("c").await;

        let mut registry = SessionRegistry::new();
        registry.add(Arc::clone(&c)).unwrap();
        registry.add(Arc::clone(&a)).unwrap();
        registry.add(Arc::clone(&b)).unwrap();

        let tokens: Vec<_> = registry
            .snapshot_readiness_handles()
            .iter()
            .map(|h| h.token())
            .collect();
        let mut sorted = tokens.clone();
        sorted.sort();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens, sorted);
    }

    #[tokio::test]
    async fn test_drain() {
        let (a, _pa) = connected_session("a").await;
        let (b, _pb) = connected_session("b").await;

        let mut registry = SessionRegistry::new();
        registry.add(a).unwrap();
        registry.add(b).unwrap();

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.snapshot_readiness_handles().is_empty());
    }
}
