//! Session lifecycle: launch on connect, teardown on disconnect.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::join_all;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::Child;
use thiserror::Error;
use tokio::sync::mpsc;

use super::bridge::{BridgeReport, BridgeSettings, InputReport};
use super::handle::{Session, SessionInfo};
use super::pty::{LaunchError, ShellLauncher};
use super::registry::SessionRegistry;
use super::ConnectionId;
use crate::auth::UserIdentity;
use crate::config::SessionConfig;

/// How often the reaper checks whether a signaled shell has exited.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors that can occur when opening a session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("session limit reached ({0} active)")]
    LimitReached(usize),

    #[error("connection {0} already has a session")]
    AlreadyExists(ConnectionId),
}

/// Lifecycle settings derived from `[session]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    pub bridge: BridgeSettings,
    /// Maximum number of concurrent sessions; `open` refuses beyond it.
    pub max_sessions: usize,
    /// How long a shell gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl ManagerSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            bridge: BridgeSettings::from_config(config),
            max_sessions: config.max_sessions,
            kill_grace: config.kill_grace(),
        }
    }
}

/// What teardown observed while dismantling a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub id: ConnectionId,
    pub pid: u32,
    /// Whether SIGTERM was delivered to a live process.
    pub signaled: bool,
    /// Exit code, if the shell was reaped before teardown returned.
    pub exit_code: Option<u32>,
    /// Output loop summary, if it could be joined.
    pub bridge: Option<BridgeReport>,
    /// Input loop summary, if it could be joined.
    pub input: Option<InputReport>,
}

/// Owns the session registry and drives every session's lifecycle.
pub struct SessionManager {
    launcher: Arc<dyn ShellLauncher>,
    registry: SessionRegistry,
    settings: ManagerSettings,
    /// Sessions launching, live, or being dismantled. Never below the
    /// registry's length.
    slots: AtomicUsize,
}

/// A claimed session slot, returned to the pool on drop unless committed.
struct SlotReservation<'a> {
    slots: &'a AtomicUsize,
    armed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slots.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn ShellLauncher>, settings: ManagerSettings) -> Self {
        Self {
            launcher,
            registry: SessionRegistry::new(),
            settings,
            slots: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Launches a shell for `user` and starts streaming its output into
    /// `outbound`. Returns the shell's pid.
    ///
    /// Nothing is registered when this fails. The shell is launched on the
    /// blocking thread pool.
    pub async fn open(
        &self,
        id: ConnectionId,
        user: &UserIdentity,
        outbound: mpsc::Sender<Bytes>,
    ) -> Result<u32, SessionError> {
        if self.registry.contains(&id) {
            return Err(SessionError::AlreadyExists(id));
        }

        let slot = self.reserve_slot().map_err(|active| {
            tracing::warn!(connection = %id, active = active, "Session limit reached");
            SessionError::LimitReached(active)
        })?;

        let launcher = Arc::clone(&self.launcher);
        let launch_user = user.clone();
        let launched = tokio::task::spawn_blocking(move || launcher.spawn_shell(&launch_user))
            .await
            .unwrap_or_else(|e| Err(LaunchError::Spawn(format!("launcher task failed: {e}"))));

        let process = launched.map_err(|e| {
            tracing::error!(connection = %id, user = %user.name, error = %e, "Failed to launch shell");
            SessionError::from(e)
        })?;

        let session = Session::start(id, user.clone(), process, outbound, self.settings.bridge);
        let pid = session.pid();

        if let Err(duplicate) = self.registry.insert(session) {
            tracing::warn!(connection = %id, "Connection raced to open a second session");
            self.dispose(duplicate);
            return Err(SessionError::AlreadyExists(id));
        }
        slot.commit();

        tracing::info!(connection = %id, user = %user.name, pid = pid, "Session opened");
        Ok(pid)
    }

    /// Claims a slot under `max_sessions`, or returns the number in use.
    fn reserve_slot(&self) -> Result<SlotReservation<'_>, usize> {
        let max = self.settings.max_sessions;
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max).then_some(used + 1)
            })
            .map(|_| SlotReservation {
                slots: &self.slots,
                armed: true,
            })
    }

    /// Queues client input for a session's shell. Never waits on the PTY.
    ///
    /// Input for an unknown or closing session, or beyond a full input
    /// queue, is dropped; returns whether it was queued.
    pub fn write(&self, id: &ConnectionId, data: &[u8]) -> bool {
        let Some(handle) = self.registry.lookup(id) else {
            tracing::trace!(connection = %id, "Input for unknown session dropped");
            return false;
        };
        handle.write(data)
    }

    /// Tears down a session. Returns `None` if no session exists or another
    /// caller already claimed it.
    pub async fn teardown(&self, id: &ConnectionId) -> Option<TeardownReport> {
        let session = self.registry.remove(id)?;
        Some(self.dismantle(session).await)
    }

    /// Tears down every session. Returns how many were torn down.
    pub async fn shutdown(&self) -> usize {
        let sessions = self.registry.drain();
        let count = sessions.len();
        if count > 0 {
            tracing::info!(sessions = count, "Tearing down all sessions");
        }
        join_all(sessions.into_iter().map(|session| self.dismantle(session))).await;
        count
    }

    pub fn count(&self) -> usize {
        self.registry.len()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.registry.contains(id)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    /// Stops both loops, signals the shell, closes the PTY, and reaps.
    ///
    /// Each loop sees the cleared flag within one poll interval, so the join
    /// is bounded even if the shell has stopped reading its input.
    async fn dismantle(&self, session: Session) -> TeardownReport {
        let Session {
            id,
            pid,
            active,
            input,
            master,
            mut child,
            bridge,
            input_bridge,
            started_at,
            ..
        } = session;

        active.store(false, Ordering::SeqCst);
        let signaled = signal_shell(id, pid, Signal::SIGTERM);
        let mut exit_code = try_reap(id, child.as_mut());

        drop(input);
        drop(master.into_inner().unwrap_or_else(PoisonError::into_inner));

        let (bridge, input) = tokio::join!(bridge, input_bridge);
        let bridge = match bridge {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(connection = %id, error = %e, "Output bridge task failed");
                None
            }
        };
        let input = match input {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(connection = %id, error = %e, "Input bridge task failed");
                None
            }
        };

        if exit_code.is_none() {
            exit_code = try_reap(id, child.as_mut());
        }
        if exit_code.is_none() {
            spawn_reaper(id, pid, child, self.settings.kill_grace);
        }
        self.slots.fetch_sub(1, Ordering::SeqCst);

        tracing::info!(
            connection = %id,
            pid = pid,
            exit_code = ?exit_code,
            uptime_ms = started_at.elapsed().as_millis() as u64,
            "Session closed"
        );

        TeardownReport {
            id,
            pid,
            signaled,
            exit_code,
            bridge,
            input,
        }
    }

    /// Disposes of a session that never made it into the registry. Its loops
    /// stop on their own once the flag is cleared.
    fn dispose(&self, session: Session) {
        session.active.store(false, Ordering::SeqCst);
        signal_shell(session.id, session.pid, Signal::SIGTERM);
        spawn_reaper(session.id, session.pid, session.child, self.settings.kill_grace);
    }
}

/// Sends `signal` to the shell. A process that is already gone is not an error.
fn signal_shell(id: ConnectionId, pid: u32, signal: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(connection = %id, pid = pid, signal = ?signal, error = %e, "Failed to signal shell");
            false
        }
    }
}

fn try_reap(id: ConnectionId, child: &mut (dyn Child + Send + Sync)) -> Option<u32> {
    match child.try_wait() {
        Ok(Some(status)) => Some(status.exit_code()),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(connection = %id, error = %e, "Failed to poll shell status");
            None
        }
    }
}

/// Waits for a signaled shell off the async runtime, escalating to SIGKILL
/// once `grace` expires.
fn spawn_reaper(id: ConnectionId, pid: u32, mut child: Box<dyn Child + Send + Sync>, grace: Duration) {
    tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(connection = %id, pid = pid, code = status.exit_code(), "Shell reaped");
                    return;
                }
                Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
                Err(e) => {
                    tracing::debug!(connection = %id, pid = pid, error = %e, "Stopped waiting for shell");
                    return;
                }
            }
        }

        tracing::warn!(connection = %id, pid = pid, "Shell ignored SIGTERM, sending SIGKILL");
        signal_shell(id, pid, Signal::SIGKILL);
        if let Err(e) = child.wait() {
            tracing::debug!(connection = %id, pid = pid, error = %e, "Failed to reap shell");
        }
    });
}
