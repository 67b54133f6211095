//! Local shells on a pseudo-terminal.
//!
//! The pty master is switched to non-blocking mode and an owned duplicate of
//! it is registered with the tokio reactor through [`AsyncFd`], so a local
//! shell takes part in the dispatcher's readiness wait exactly like a network
//! channel.

use std::io::{self, Read, Write};
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::{Connector, Transport};
use crate::session::SessionError;

/// Spawns a local shell on a fresh pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtyConnector {
    shell: String,
    term: String,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
}

impl PtyConnector {
    /// Creates a connector for `shell`, or `$SHELL` / `/bin/sh` when `None`.
    pub fn new(shell: Option<String>) -> Self {
        Self {
            shell: detect_shell(shell),
            term: "xterm-256color".to_string(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Sets the `TERM` value exported to the shell.
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    /// Adds an environment variable for the shell.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the shell's working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Returns the shell command this connector spawns.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    fn spawn(&self, cols: u16, rows: u16) -> Result<PtyTransport, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.env("TERM", &self.term);
        if let Some(ref dir) = self.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let raw_fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| SessionError::SpawnFailed("pty master has no file descriptor".into()))?;
        set_nonblocking(raw_fd)?;
        let fd = duplicate_fd(raw_fd)?;

        tracing::debug!(
            shell = %self.shell,
            pid = ?child.process_id(),
            cols,
            rows,
            "Spawned local shell"
        );

        Ok(PtyTransport {
            fd: AsyncFd::new(fd)?,
            master: Mutex::new(pair.master),
            reader: Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Connector for PtyConnector {
    fn describe(&self) -> String {
        format!("local:{}", self.shell)
    }

    async fn connect(&self, cols: u16, rows: u16) -> Result<Arc<dyn Transport>, SessionError> {
        let connector = self.clone();
        let transport = tokio::task::spawn_blocking(move || connector.spawn(cols, rows))
            .await
            .map_err(|e| SessionError::SpawnFailed(format!("spawn task failed: {e}")))??;
        Ok(Arc::new(transport))
    }
}

/// A local shell's pty master.
pub struct PtyTransport {
    // A duplicate of the master sharing its file status flags.
    fd: AsyncFd<OwnedFd>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    reader: Mutex<Box<dyn Read + Send>>,
    writer: tokio::sync::Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    closed: AtomicBool,
}

impl PtyTransport {
    /// Returns the shell's process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process_id()
    }
}

#[async_trait]
impl Transport for PtyTransport {
    async fn readable(&self) -> io::Result<()> {
        // The guard is dropped without clearing readiness; `try_read` clears
        // it when the read would block.
        let _guard = self.fd.readable().await?;
        Ok(())
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.fd.try_io(Interest::READABLE, |_| {
            self.reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .read(buf)
        });

        match result {
            // Linux reports a hung-up pty master as EIO.
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(0),
            other => other,
        }
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty closed"));
        }

        let mut writer = self.writer.lock().await;
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|_| writer.write(remaining)) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => remaining = &remaining[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        writer.flush()
    }

    async fn resize_pty(&self, cols: u16, rows: u16) -> io::Result<()> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(pty_size(cols, rows))
            .map_err(|e| io::Error::other(e.to_string()))
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "Failed to kill local shell");
            }
        }
        let _ = child.try_wait();
        Ok(())
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), SessionError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

fn duplicate_fd(fd: RawFd) -> Result<OwnedFd, SessionError> {
    // SAFETY: `fd` belongs to the pty master, which is open for the whole call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    Ok(borrowed.try_clone_to_owned()?)
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    async fn read_until(transport: &dyn Transport, marker: &str) -> String {
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(5);

        while Instant::now() < deadline {
            if timeout(Duration::from_millis(200), transport.readable())
                .await
                .is_err()
            {
                continue;
            }
            match transport.try_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains(marker) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_detect_shell_with_provided() {
        let shell = detect_shell(Some("/bin/bash".to_string()));
        assert_eq!(shell, "/bin/bash");
    }

    #[test]
    fn test_detect_shell_from_env() {
        let shell = detect_shell(None);
        assert!(!shell.is_empty());
    }

    #[test]
    fn test_describe() {
        let connector = PtyConnector::new(Some("/bin/sh".to_string()));
        assert_eq!(connector.describe(), "local:/bin/sh");
        assert_eq!(connector.shell(), "/bin/sh");
    }

    #[tokio::test]
    async fn test_spawn_and_echo() {
        let connector = PtyConnector::new(Some("/bin/sh".to_string()));
        let transport = connector.connect(80, 24).await.unwrap();

        transport.write_all(b"echo PTY_MARKER_OK\n").await.unwrap();
        let output = read_until(transport.as_ref(), "PTY_MARKER_OK").await;
        assert!(
            output.contains("PTY_MARKER_OK"),
            "expected marker in output, got: {output}"
        );

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_vars_reach_shell() {
        let connector =
            PtyConnector::new(Some("/bin/sh".to_string())).with_env("SHELLMUX_TEST", "env_value");
        let transport = connector.connect(80, 24).await.unwrap();

        transport.write_all(b"echo $SHELLMUX_TEST\n").await.unwrap();
        let output = read_until(transport.as_ref(), "env_value").await;
        assert!(output.contains("env_value"), "got: {output}");

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize() {
        let connector = PtyConnector::new(Some("/bin/sh".to_string()));
        let transport = connector.connect(80, 24).await.unwrap();

        assert!(transport.resize_pty(120, 40).await.is_ok());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_reads_eof() {
        let connector = PtyConnector::new(Some("/bin/sh".to_string()));
        let transport = connector.connect(80, 24).await.unwrap();

        transport.write_all(b"exit 0\n").await.unwrap();

        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_eof = false;
        while Instant::now() < deadline {
            if timeout(Duration::from_millis(200), transport.readable())
                .await
                .is_err()
            {
                continue;
            }
            match transport.try_read(&mut buf) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    saw_eof = true;
                    break;
                }
            }
        }

        assert!(saw_eof, "shell exit should end the stream");
    }

    #[tokio::test]
    async fn test_reactor_fd_is_owned_and_nonblocking() {
        let connector = PtyConnector::new(Some("/bin/sh".to_string()));
        let transport = connector.spawn(80, 24).unwrap();

        let registered = transport.fd.get_ref().as_raw_fd();
        let master = MasterPty::as_raw_fd(&**transport.master.lock().unwrap()).unwrap();
        assert_ne!(registered, master);

        let flags = OFlag::from_bits_truncate(fcntl(registered, FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = PtyConnector::new(Some("/bin/sh".to_string()));
        let transport = connector.connect(80, 24).await.unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.write_all(b"x").await.is_err());
    }
}
