//! PTY process launching.
//!
//! A launcher allocates a pseudo-terminal pair and starts a login shell on
//! the slave side. The parent keeps the master side plus two private,
//! non-blocking duplicates of it: one for the output reader and one for the
//! input writer. Neither bridge loop can then block past its poll interval.

use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use crate::auth::UserIdentity;
use crate::config::SessionConfig;

/// `PATH` handed to the shell when the server itself has none.
const FALLBACK_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Initial window size; the bridge does not propagate resizes.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Errors that can occur while launching a shell.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The pseudo-terminal pair could not be allocated.
    #[error("could not allocate PTY: {0}")]
    PtyAllocation(String),

    /// The shell process could not be started.
    #[error("could not start shell: {0}")]
    Spawn(String),

    /// The shell started but its PTY handles could not be prepared.
    #[error("failed to set up PTY handles: {0}")]
    Setup(String),
}

/// A running shell attached to a PTY.
///
/// Every field is owned: whoever holds a `PtyProcess` is responsible for
/// signaling the child and closing the descriptors.
pub struct PtyProcess {
    /// The PTY master.
    pub master: Box<dyn MasterPty + Send>,
    /// Non-blocking duplicate of the master descriptor for shell input.
    pub writer: File,
    /// Non-blocking duplicate of the master descriptor for the output reader.
    pub reader: File,
    /// The shell process.
    pub child: Box<dyn Child + Send + Sync>,
    /// Process ID of the shell.
    pub pid: u32,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Starts a shell for a user on a fresh PTY.
pub trait ShellLauncher: Send + Sync {
    fn spawn_shell(&self, user: &UserIdentity) -> Result<PtyProcess, LaunchError>;
}

/// Launcher backed by the host's native PTY implementation.
#[derive(Debug, Clone)]
pub struct NativeLauncher {
    shell: String,
    args: Vec<String>,
    term: String,
    prompt: String,
}

impl NativeLauncher {
    /// Creates a launcher for `shell` invoked with `args`.
    pub fn new(shell: impl Into<String>, args: Vec<String>) -> Self {
        let defaults = SessionConfig::default();
        Self {
            shell: shell.into(),
            args,
            term: defaults.term,
            prompt: defaults.prompt,
        }
    }

    /// Creates a launcher from the `[session]` configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            args: config.shell_args.clone(),
            term: config.term.clone(),
            prompt: config.prompt.clone(),
        }
    }

    /// Builds the shell command with a controlled environment.
    fn command(&self, user: &UserIdentity) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.args(&self.args);

        cmd.env_clear();
        let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
        cmd.env("PATH", path);
        cmd.env("TERM", &self.term);
        cmd.env("HOME", &user.home);
        cmd.env("USER", &user.name);
        cmd.env("LOGNAME", &user.name);
        cmd.env("SHELL", &self.shell);
        cmd.env("PS1", &self.prompt);

        cmd.cwd(working_dir(&user.home));
        cmd
    }
}

impl ShellLauncher for NativeLauncher {
    fn spawn_shell(&self, user: &UserIdentity) -> Result<PtyProcess, LaunchError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| LaunchError::PtyAllocation(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(self.command(user))
            .map_err(|e| LaunchError::Spawn(e.to_string()))?;

        // The master must be the last open handle so EOF reaches the reader
        // once the shell exits.
        drop(pair.slave);

        match prepare_handles(pair.master.as_ref(), child.as_ref()) {
            Ok((writer, reader, pid)) => {
                tracing::debug!(pid = pid, shell = %self.shell, user = %user.name, "Spawned shell");
                Ok(PtyProcess {
                    master: pair.master,
                    writer,
                    reader,
                    child,
                    pid,
                })
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }
}

fn prepare_handles(
    master: &(dyn MasterPty + Send),
    child: &(dyn Child + Send + Sync),
) -> Result<(File, File, u32), LaunchError> {
    let pid = child
        .process_id()
        .ok_or_else(|| LaunchError::Setup("shell has no process id".to_string()))?;

    let reader = duplicate_master(master)?;
    let writer = reader
        .try_clone()
        .map_err(|e| LaunchError::Setup(e.to_string()))?;

    // Duplicates share one open file description, so this covers both.
    set_nonblocking(&reader)?;

    Ok((writer, reader, pid))
}

fn set_nonblocking(file: &File) -> Result<(), LaunchError> {
    let fd = file.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| LaunchError::Setup(e.to_string()))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| LaunchError::Setup(e.to_string()))?;
    Ok(())
}

/// Duplicates the master descriptor so the reader owns an independent handle.
fn duplicate_master(master: &(dyn MasterPty + Send)) -> Result<File, LaunchError> {
    let raw = master
        .as_raw_fd()
        .ok_or_else(|| LaunchError::Setup("PTY master has no descriptor".to_string()))?;

    // SAFETY: `raw` is owned by `master`, which stays open for this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    let owned: OwnedFd = borrowed
        .try_clone_to_owned()
        .map_err(|e| LaunchError::Setup(e.to_string()))?;

    Ok(File::from(owned))
}

/// Returns the user's home, or `/` if it does not exist on this host.
fn working_dir(home: &Path) -> PathBuf {
    if home.is_dir() {
        home.to_path_buf()
    } else {
        tracing::warn!(home = %home.display(), "Home directory missing, starting shell in /");
        PathBuf::from("/")
    }
}
