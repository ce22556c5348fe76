//! # termbridge
//!
//! Exposes an interactive login shell to remote clients over WebSocket.
//!
//! ## Overview
//!
//! Every accepted WebSocket connection gets its own shell running on a fresh
//! pseudo-terminal. Bytes flow both ways without interpretation: keystrokes
//! from the client are written to the PTY, and whatever the shell prints is
//! streamed back as binary frames. When either side goes away the session is
//! torn down: the shell is signaled, the PTY is closed, and the process is
//! reaped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  server: GET /health, GET /shell (WebSocket upgrade)     │
//! ├──────────────────────────────────────────────────────────┤
//! │  auth: credential extraction, Authenticator              │
//! ├──────────────────────────────────────────────────────────┤
//! │  session::manager   open / write / teardown / shutdown   │
//! │     ├── session::pty       ShellLauncher, PtyProcess     │
//! │     ├── session::bridge    output and input loops        │
//! │     └── session::registry  ConnectionId -> Session       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use termbridge::auth::TokenAuthenticator;
//! use termbridge::server::{serve, AppState};
//! use termbridge::session::{ManagerSettings, NativeLauncher, SessionManager};
//! use termbridge::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let launcher = Arc::new(NativeLauncher::from_config(&config.session));
//!     let manager = Arc::new(SessionManager::new(
//!         launcher,
//!         ManagerSettings::from_config(&config.session),
//!     ));
//!     let auth = Arc::new(TokenAuthenticator::from_config(&config.auth));
//!     let state = AppState::new(manager, auth, config.session.outbound_capacity);
//!
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr()?).await?;
//!     serve(listener, state).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Credential extraction and validation
//! - [`session`]: PTY launching, byte bridging, session tracking
//! - [`server`]: HTTP routes and per-connection pumping

pub mod auth;
pub mod config;
pub mod server;
pub mod session;

pub use config::Config;

pub use auth::{Authenticator, TokenAuthenticator, UserIdentity};

pub use session::{
    ConnectionId, LaunchError, NativeLauncher, SessionError, SessionManager, ShellLauncher,
};

pub use server::{router, serve, AppState};
