//! In-process loopback transport.
//!
//! A [`MemoryTransport`] is the session side of a pipe whose other end is a
//! [`MemoryPeer`]. The peer plays the role of the remote shell: it pushes
//! output with [`MemoryPeer::send`], receives the session's input with
//! [`MemoryPeer::recv`], and can hang up or inject readiness failures.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::sync::{mpsc, Notify};

use super::{Connector, Transport};
use crate::session::SessionError;

#[derive(Default)]
struct Inbound {
    buf: BytesMut,
    peer_closed: bool,
}

struct Shared {
    inbound: Mutex<Inbound>,
    readable: Notify,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    requested_size: Mutex<Option<(u16, u16)>>,
    pty_sizes: Mutex<Vec<(u16, u16)>>,
    session_closed: AtomicBool,
    fail_readiness: AtomicBool,
}

impl Shared {
    fn inbound(&self) -> std::sync::MutexGuard<'_, Inbound> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_input(&self) -> bool {
        let inbound = self.inbound();
        !inbound.buf.is_empty() || inbound.peer_closed || self.session_closed.load(Ordering::SeqCst)
    }
}

/// Session side of an in-memory pipe.
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Shell side of an in-memory pipe.
pub struct MemoryPeer {
    shared: Arc<Shared>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryTransport {
    /// Creates a connected transport/peer pair.
    pub fn pair() -> (Self, MemoryPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbound: Mutex::new(Inbound::default()),
            readable: Notify::new(),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            requested_size: Mutex::new(None),
            pty_sizes: Mutex::new(Vec::new()),
            session_closed: AtomicBool::new(false),
            fail_readiness: AtomicBool::new(false),
        });

        let transport = MemoryTransport {
            shared: Arc::clone(&shared),
        };
        let peer = MemoryPeer {
            shared,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn readable(&self) -> io::Result<()> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.fail_readiness.load(Ordering::SeqCst) {
                return Err(io::Error::other("readiness failure injected by peer"));
            }
            if self.shared.has_input() {
                return Ok(());
            }

            notified.await;
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.shared.inbound();

        if !inbound.buf.is_empty() {
            let n = buf.len().min(inbound.buf.len());
            buf[..n].copy_from_slice(&inbound.buf[..n]);
            inbound.buf.advance(n);
            return Ok(n);
        }

        if inbound.peer_closed {
            return Ok(0);
        }

        if self.shared.session_closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }

        Err(io::ErrorKind::WouldBlock.into())
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let sender = self
            .shared
            .outbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match sender {
            Some(tx) if !self.shared.inbound().peer_closed => tx
                .send(data.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped")),
            _ => Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed")),
        }
    }

    async fn resize_pty(&self, cols: u16, rows: u16) -> io::Result<()> {
        self.shared
            .pty_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((cols, rows));
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.shared.session_closed.store(true, Ordering::SeqCst);
        self.shared
            .outbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.readable.notify_waiters();
        Ok(())
    }
}

impl MemoryPeer {
    /// Queue output for the session to read.
    pub fn send(&self, data: impl AsRef<[u8]>) {
        self.shared.inbound().buf.extend_from_slice(data.as_ref());
        self.shared.readable.notify_waiters();
    }

    /// Hang up: the session's next read returns end of stream.
    pub fn close(&self) {
        self.shared.inbound().peer_closed = true;
        self.shared.readable.notify_waiters();
    }

    /// Receive the next chunk the session wrote.
    ///
    /// Returns `None` once the session has closed its side.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Echo every chunk the session writes back to it until the session
    /// closes. Behaves like a shell whose tty echoes input.
    pub async fn run_echo(&self) {
        while let Some(data) = self.recv().await {
            self.send(&data);
        }
    }

    /// Make every readiness wait fail (or stop failing).
    pub fn fail_readiness(&self, fail: bool) {
        self.shared.fail_readiness.store(fail, Ordering::SeqCst);
        self.shared.readable.notify_waiters();
    }

    /// The pty size requested during the handshake, if any.
    pub fn requested_size(&self) -> Option<(u16, u16)> {
        *self
            .shared
            .requested_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Every pty resize the session propagated, in order.
    pub fn pty_sizes(&self) -> Vec<(u16, u16)> {
        self.shared
            .pty_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns whether the session closed its side of the pipe.
    pub fn is_closed_by_session(&self) -> bool {
        self.shared.session_closed.load(Ordering::SeqCst)
    }
}

/// A [`Connector`] that hands out one pre-built [`MemoryTransport`].
pub struct MemoryConnector {
    name: String,
    transport: Mutex<Option<MemoryTransport>>,
    refusal: Option<String>,
    delay: Option<Duration>,
}

impl MemoryConnector {
    /// Creates a connector and the peer that will sit on the far end.
    pub fn pair(name: impl Into<String>) -> (Self, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let connector = Self {
            name: name.into(),
            transport: Mutex::new(Some(transport)),
            refusal: None,
            delay: None,
        };
        (connector, peer)
    }

    /// Creates a connector whose handshake always fails with `reason`.
    pub fn refusing(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: Mutex::new(None),
            refusal: Some(reason.into()),
            delay: None,
        }
    }

    /// Delay the handshake, simulating a slow network.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn connect(&self, cols: u16, rows: u16) -> Result<Arc<dyn Transport>, SessionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = &self.refusal {
            return Err(SessionError::ConnectionFailed {
                target: self.describe(),
                reason: reason.clone(),
            });
        }

        let transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SessionError::ConnectionFailed {
                target: self.describe(),
                reason: "memory transport already used".to_string(),
            })?;

        *transport
            .shared
            .requested_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((cols, rows));

        Ok(Arc::new(transport))
    }
}
