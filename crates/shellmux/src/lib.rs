//! # shellmux
//!
//! Multiplexes many interactive shell sessions, remote (SSH) and local
//! (pseudo-terminal), onto a single readiness dispatcher.
//!
//! ## Overview
//!
//! Each session runs its connect handshake on its own task so a slow or
//! unreachable host never holds up the others. Once connected, a session
//! registers with the [`Multiplexer`], whose one dispatcher worker waits on
//! the readiness of every session at once and feeds the bytes each session
//! produces into that session's terminal emulator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       SessionManager                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐  │
//! │  │ TerminalSession│  │ TerminalSession│  │ TerminalSession│  │
//! │  │  (connect task)│  │  (connect task)│  │  (connect task)│  │
//! │  └───────┬────────┘  └───────┬────────┘  └───────┬────────┘  │
//! │          │ add_session       │                   │           │
//! │  ┌───────▼───────────────────▼───────────────────▼────────┐  │
//! │  │          Multiplexer  (registry + dispatcher)          │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │ SSH (russh)  │  │ PTY (local)  │  │ Memory (tests)   │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shellmux::{Config, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let manager = SessionManager::new(config);
//!
//!     let id = manager.create_local(80, 24, None)?;
//!     manager.wait_connected(&id).await?;
//!     manager.send(&id, b"echo hello\n").await?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`known_hosts`]: SSH host key trust store
//! - [`session`]: Session lifecycle, registry and dispatcher
//! - [`transport`]: SSH, PTY and in-memory byte transports

pub mod config;
pub mod known_hosts;
pub mod session;
pub mod transport;

// Re-export the emulator crate for convenience
pub use emulator;

pub use config::Config;

pub use known_hosts::{HostKeyPolicy, KnownHost, KnownHostsStore};

pub use session::{
    DispatcherStats, Multiplexer, SessionError, SessionId, SessionInfo, SessionManager,
    SessionState, TerminalSession,
};

pub use transport::{Connector, Credentials, SshTarget, Transport};
