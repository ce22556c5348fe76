//! Per-connection session state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use portable_pty::{Child, MasterPty};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bridge::{
    spawn_input_bridge, spawn_output_bridge, BridgeReport, BridgeSettings, InputReport, InputSink,
};
use super::pty::PtyProcess;
use super::ConnectionId;
use crate::auth::UserIdentity;

/// Everything owned by one live shell session.
///
/// A `Session` lives in the registry from launch until teardown claims it.
/// Only the claimant may signal the child or close the PTY.
pub struct Session {
    pub(super) id: ConnectionId,
    pub(super) user: UserIdentity,
    pub(super) pid: u32,
    pub(super) started_at: Instant,
    pub(super) active: Arc<AtomicBool>,
    pub(super) input: InputSink,
    pub(super) master: Mutex<Box<dyn MasterPty + Send>>,
    pub(super) child: Box<dyn Child + Send + Sync>,
    pub(super) bridge: JoinHandle<BridgeReport>,
    pub(super) input_bridge: JoinHandle<InputReport>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user.name)
            .field("pid", &self.pid)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wires a freshly launched shell to `outbound` and starts both loops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        id: ConnectionId,
        user: UserIdentity,
        process: PtyProcess,
        outbound: mpsc::Sender<Bytes>,
        settings: BridgeSettings,
    ) -> Self {
        let PtyProcess {
            master,
            writer,
            reader,
            child,
            pid,
        } = process;

        let active = Arc::new(AtomicBool::new(true));
        let bridge = spawn_output_bridge(id, reader, Arc::clone(&active), outbound, settings);
        let (input, input_bridge) = spawn_input_bridge(id, writer, Arc::clone(&active), settings);

        Self {
            id,
            user,
            pid,
            started_at: Instant::now(),
            active,
            input,
            master: Mutex::new(master),
            child,
            bridge,
            input_bridge,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns a cheap handle for the input path.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            pid: self.pid,
            active: Arc::clone(&self.active),
            input: self.input.clone(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            user: self.user.name.clone(),
            pid: self.pid,
            active: self.is_active(),
            uptime: self.started_at.elapsed(),
        }
    }
}

/// Shared view of a session used to deliver client input.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: ConnectionId,
    pid: u32,
    active: Arc<AtomicBool>,
    input: InputSink,
}

impl SessionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Queues input for the shell without waiting on the PTY. Returns false
    /// if the session is shutting down or its input queue is full.
    pub fn write(&self, data: &[u8]) -> bool {
        if !self.is_active() {
            return false;
        }
        self.input.send(Bytes::copy_from_slice(data))
    }
}

/// Snapshot of a session for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub user: String,
    pub pid: u32,
    pub active: bool,
    pub uptime: Duration,
}
