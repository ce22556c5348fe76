//! Shell sessions.
//!
//! This module handles:
//! - Launching a login shell on a fresh PTY ([`pty`])
//! - Pumping bytes between the PTY and a connection ([`bridge`])
//! - Tracking live sessions per connection ([`registry`])
//! - Opening and tearing down sessions ([`manager`])

pub mod bridge;
pub mod handle;
pub mod manager;
pub mod pty;
pub mod registry;

/// Identifies one client connection, and therefore at most one session.
pub type ConnectionId = uuid::Uuid;

pub use bridge::{BridgeExit, BridgeReport, BridgeSettings, InputExit, InputReport, InputSink};
pub use handle::{Session, SessionHandle, SessionInfo};
pub use manager::{ManagerSettings, SessionError, SessionManager, TeardownReport};
pub use pty::{LaunchError, NativeLauncher, PtyProcess, ShellLauncher};
pub use registry::SessionRegistry;
