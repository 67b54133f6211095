//! Byte transports for shell sessions.
//!
//! A [`Connector`] performs a backend's handshake and yields a [`Transport`]:
//! a connected, bidirectional byte channel with readiness notification. The
//! dispatcher only ever calls [`Transport::readable`] and
//! [`Transport::try_read`]; sessions call the rest.
//!
//! Backends:
//! - [`ssh`]: remote shells over SSH (russh)
//! - [`pty`]: local shells on a pseudo-terminal (Unix)
//! - [`memory`]: in-process loopback, for embedding and tests

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::session::SessionError;

pub mod memory;
#[cfg(unix)]
pub mod pty;
pub mod ssh;

pub use memory::{MemoryConnector, MemoryPeer, MemoryTransport};
#[cfg(unix)]
pub use pty::{PtyConnector, PtyTransport};
pub use ssh::{Credentials, SshConnector, SshTarget, SshTransport};

/// A connected byte channel to one shell.
///
/// Readiness follows the tokio convention: [`Transport::readable`] resolves
/// once a read would not block (data, end of stream, or an error is pending)
/// and [`Transport::try_read`] then returns without blocking. A `WouldBlock`
/// error from `try_read` means the readiness was spurious.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait until the transport has something to read.
    async fn readable(&self) -> io::Result<()>;

    /// Read up to `buf.len()` bytes without blocking.
    ///
    /// `Ok(0)` means the peer closed the channel.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` to the shell.
    async fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Propagate a terminal size change to the far end.
    async fn resize_pty(&self, cols: u16, rows: u16) -> io::Result<()>;

    /// Close the channel. Closing an already-closed transport is not an error.
    async fn close(&self) -> io::Result<()>;
}

/// Establishes a [`Transport`] for a session.
///
/// `connect` runs on the session's own connect task and may block that task
/// for as long as the backend needs (network I/O, authentication). It must
/// leave the shell running with a pseudo-terminal of `cols` × `rows`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable description of the target, used in logs and errors.
    fn describe(&self) -> String;

    /// Perform the handshake.
    async fn connect(&self, cols: u16, rows: u16) -> Result<Arc<dyn Transport>, SessionError>;
}
