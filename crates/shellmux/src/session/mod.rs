//! Session lifecycle and readiness multiplexing.
//!
//! A [`TerminalSession`] connects on its own task and then registers with a
//! [`Multiplexer`]. The multiplexer's single dispatcher worker waits on the
//! readiness of every registered session and feeds incoming bytes to each
//! session's terminal emulator. [`SessionManager`] is the facade the CLI and
//! other front ends use.

mod dispatcher;
pub mod manager;
pub mod multiplexer;
pub mod registry;
pub mod state;
pub mod terminal;

pub use manager::{SessionInfo, SessionManager};
pub use multiplexer::{DispatcherStats, Multiplexer};
pub use registry::{ReadinessHandle, ReadinessToken, SessionRegistry};
pub use state::{new_session_id, SessionError, SessionId, SessionState};
pub use terminal::TerminalSession;
