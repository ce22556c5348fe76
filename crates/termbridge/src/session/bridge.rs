//! Byte pumping between a PTY and a connection.
//!
//! Each direction runs on its own blocking thread. Both wait on the PTY with a
//! bounded timeout, so they notice cancellation within one poll interval even
//! when the shell is silent or has stopped reading. Client input reaches the
//! input loop through a bounded queue behind an [`InputSink`].

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ConnectionId;
use crate::config::SessionConfig;

/// Default readiness wait between cancellation checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default size of a single PTY read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default number of input chunks queued per session.
pub const DEFAULT_INPUT_CAPACITY: usize = 256;

/// Tuning for the bridge loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub poll_interval: Duration,
    pub read_buffer_size: usize,
    pub input_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            input_capacity: DEFAULT_INPUT_CAPACITY,
        }
    }
}

impl BridgeSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            read_buffer_size: config.read_buffer_size,
            input_capacity: config.input_capacity,
        }
    }
}

/// Why the output loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The session's active flag was cleared.
    Cancelled,
    /// The PTY reported end of file; the shell is gone.
    Eof,
    /// Reading or polling the PTY failed.
    ReadError,
    /// The connection stopped accepting output.
    ChannelClosed,
}

/// Summary of one output loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeReport {
    pub exit: BridgeExit,
    pub bytes_forwarded: u64,
    pub chunks: u64,
    /// Poll timeouts that elapsed with nothing to read.
    pub idle_wakeups: u64,
}

impl BridgeReport {
    fn new() -> Self {
        Self {
            exit: BridgeExit::Cancelled,
            bytes_forwarded: 0,
            chunks: 0,
            idle_wakeups: 0,
        }
    }
}

/// Starts the output loop for a session on the blocking thread pool.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_output_bridge<R>(
    connection_id: ConnectionId,
    reader: R,
    active: Arc<AtomicBool>,
    outbound: mpsc::Sender<Bytes>,
    settings: BridgeSettings,
) -> JoinHandle<BridgeReport>
where
    R: Read + AsFd + Send + 'static,
{
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || {
        run_output_bridge(connection_id, reader, &active, &outbound, &runtime, settings)
    })
}

/// Forwards PTY output to `outbound` until cancelled, EOF, or disconnect.
///
/// Blocks the calling thread. `runtime` is used to wait for channel capacity
/// without spinning, so this must not run on an async worker thread.
pub fn run_output_bridge<R: Read + AsFd>(
    connection_id: ConnectionId,
    mut reader: R,
    active: &AtomicBool,
    outbound: &mpsc::Sender<Bytes>,
    runtime: &Handle,
    settings: BridgeSettings,
) -> BridgeReport {
    let timeout = poll_timeout(settings.poll_interval);
    let mut buffer = vec![0u8; settings.read_buffer_size.max(1)];
    let mut report = BridgeReport::new();

    tracing::debug!(connection = %connection_id, "Output bridge started");

    report.exit = loop {
        if !active.load(Ordering::SeqCst) {
            break BridgeExit::Cancelled;
        }

        match wait_readable(reader.as_fd(), timeout) {
            Ok(true) => {}
            Ok(false) => {
                report.idle_wakeups += 1;
                continue;
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::debug!(connection = %connection_id, error = %e, "PTY poll failed");
                break BridgeExit::ReadError;
            }
        }

        let n = match reader.read(&mut buffer) {
            Ok(0) => break BridgeExit::Eof,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            // Linux reports EIO on the master once the slave side is fully closed.
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => break BridgeExit::Eof,
            Err(e) => {
                tracing::debug!(connection = %connection_id, error = %e, "PTY read failed");
                break BridgeExit::ReadError;
            }
        };

        let chunk = Bytes::copy_from_slice(&buffer[..n]);
        match forward(chunk, outbound, active, runtime, settings.poll_interval) {
            Forwarded::Sent => {
                report.bytes_forwarded += n as u64;
                report.chunks += 1;
            }
            Forwarded::Cancelled => break BridgeExit::Cancelled,
            Forwarded::Closed => break BridgeExit::ChannelClosed,
        }
    };

    tracing::debug!(
        connection = %connection_id,
        exit = ?report.exit,
        bytes = report.bytes_forwarded,
        chunks = report.chunks,
        "Output bridge stopped"
    );

    report
}

enum Forwarded {
    Sent,
    Cancelled,
    Closed,
}

/// Hands one chunk to the connection, waiting for capacity in bounded steps.
fn forward(
    chunk: Bytes,
    outbound: &mpsc::Sender<Bytes>,
    active: &AtomicBool,
    runtime: &Handle,
    step: Duration,
) -> Forwarded {
    let chunk = match outbound.try_send(chunk) {
        Ok(()) => return Forwarded::Sent,
        Err(mpsc::error::TrySendError::Closed(_)) => return Forwarded::Closed,
        Err(mpsc::error::TrySendError::Full(chunk)) => chunk,
    };

    loop {
        match runtime.block_on(tokio::time::timeout(step, outbound.reserve())) {
            Ok(Ok(permit)) => {
                permit.send(chunk);
                return Forwarded::Sent;
            }
            Ok(Err(_)) => return Forwarded::Closed,
            Err(_) => {
                if !active.load(Ordering::SeqCst) {
                    return Forwarded::Cancelled;
                }
            }
        }
    }
}

/// Waits until `fd` is readable. Returns `Ok(false)` on timeout.
///
/// Hangup and error conditions count as readable so the following read
/// reports what happened.
fn wait_readable(fd: BorrowedFd<'_>, timeout: PollTimeout) -> nix::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    if poll(&mut fds, timeout)? == 0 {
        return Ok(false);
    }

    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    if revents.contains(PollFlags::POLLNVAL) {
        return Err(Errno::EBADF);
    }
    Ok(true)
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    let millis = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(millis.max(1))
}

/// Why the input loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputExit {
    /// The session's active flag was cleared.
    Cancelled,
    /// Every [`InputSink`] was dropped.
    SinkClosed,
    /// Writing to or polling the PTY failed.
    WriteError,
}

/// Summary of one input loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputReport {
    pub exit: InputExit,
    pub bytes_written: u64,
    pub chunks: u64,
}

/// Queue end of a session's input loop.
///
/// Sending never blocks: a chunk that does not fit in the queue is dropped.
#[derive(Debug, Clone)]
pub struct InputSink {
    tx: mpsc::Sender<Bytes>,
}

impl InputSink {
    /// Queues `data` for the shell. Returns false if it was dropped.
    pub fn send(&self, data: Bytes) -> bool {
        match self.tx.try_send(data) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                tracing::warn!(bytes = chunk.len(), "Input queue full, dropping client input");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the input loop is still accepting chunks.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Starts the input loop for a session on the blocking thread pool and
/// returns the sink that feeds it.
///
/// `writer` must be non-blocking. Must be called from within a Tokio runtime.
pub fn spawn_input_bridge<W>(
    connection_id: ConnectionId,
    writer: W,
    active: Arc<AtomicBool>,
    settings: BridgeSettings,
) -> (InputSink, JoinHandle<InputReport>)
where
    W: Write + AsFd + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(settings.input_capacity.max(1));
    let runtime = Handle::current();
    let handle = tokio::task::spawn_blocking(move || {
        run_input_bridge(connection_id, writer, &active, &mut rx, &runtime, settings)
    });
    (InputSink { tx }, handle)
}

/// Writes queued input to the PTY until cancelled, every sink is dropped, or
/// the PTY fails.
///
/// Blocks the calling thread, but never for longer than one poll interval
/// between checks of `active`, even when the shell stops reading.
pub fn run_input_bridge<W: Write + AsFd>(
    connection_id: ConnectionId,
    mut writer: W,
    active: &AtomicBool,
    inbound: &mut mpsc::Receiver<Bytes>,
    runtime: &Handle,
    settings: BridgeSettings,
) -> InputReport {
    let step = settings.poll_interval.max(Duration::from_millis(1));
    let timeout = poll_timeout(settings.poll_interval);
    let mut report = InputReport {
        exit: InputExit::Cancelled,
        bytes_written: 0,
        chunks: 0,
    };

    tracing::debug!(connection = %connection_id, "Input bridge started");

    report.exit = loop {
        if !active.load(Ordering::SeqCst) {
            break InputExit::Cancelled;
        }

        let chunk = match runtime.block_on(tokio::time::timeout(step, inbound.recv())) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break InputExit::SinkClosed,
            Err(_) => continue,
        };

        match write_chunk(&mut writer, &chunk, active, timeout) {
            Ok(true) => {
                report.bytes_written += chunk.len() as u64;
                report.chunks += 1;
            }
            Ok(false) => break InputExit::Cancelled,
            Err(e) => {
                tracing::debug!(connection = %connection_id, error = %e, "PTY write failed");
                break InputExit::WriteError;
            }
        }
    };

    // Queued input is dropped with the receiver.
    inbound.close();

    tracing::debug!(
        connection = %connection_id,
        exit = ?report.exit,
        bytes = report.bytes_written,
        chunks = report.chunks,
        "Input bridge stopped"
    );

    report
}

/// Writes all of `data`, waiting for the PTY to drain in bounded steps.
/// Returns `Ok(false)` if `active` was cleared first.
fn write_chunk<W: Write + AsFd>(
    writer: &mut W,
    mut data: &[u8],
    active: &AtomicBool,
    timeout: PollTimeout,
) -> io::Result<bool> {
    while !data.is_empty() {
        if !active.load(Ordering::SeqCst) {
            return Ok(false);
        }

        match writer.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match wait_writable(writer.as_fd(), timeout) {
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Waits until `fd` can take more bytes. Returns `Ok(false)` on timeout.
fn wait_writable(fd: BorrowedFd<'_>, timeout: PollTimeout) -> nix::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    if poll(&mut fds, timeout)? == 0 {
        return Ok(false);
    }

    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    if revents.contains(PollFlags::POLLNVAL) {
        return Err(Errno::EBADF);
    }
    Ok(true)
}
