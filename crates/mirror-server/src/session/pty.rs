//! PTY process management using portable-pty.
//!
//! Spawns the shell on the slave side of a fresh pseudo-terminal and hands
//! the caller the master-side byte stream plus a control handle that can
//! terminate and reap the child.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Shell used when neither the config nor `$SHELL` names one.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Interval between exit checks while waiting for a signalled child.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors that prevent a terminal session from starting.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open PTY: {0}")]
    OpenPty(String),

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("failed to open PTY device handle: {0}")]
    Device(String),

    #[error("session limit reached ({0} active)")]
    AtCapacity(usize),
}

/// Errors from tearing a child down. Teardown is best-effort; callers log
/// these and carry on.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("signal delivery failed: {0}")]
    Signal(String),

    #[error("wait failed: {0}")]
    Wait(#[from] std::io::Error),
}

/// How a `terminate` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The child had already been reaped (by an earlier call or on its own).
    AlreadyExited,
    /// The child exited within the grace period.
    Exited(u32),
    /// The grace period ran out and the child was killed.
    Killed,
}

/// Command line and terminal parameters for the shell.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
}

impl ShellCommand {
    /// Resolve the shell: explicit value, then `$SHELL`, then [`DEFAULT_SHELL`].
    pub fn resolve(configured: Option<&str>, args: Vec<String>) -> Self {
        let program = configured
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());
        Self {
            program,
            args,
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 24,
            cwd: dirs::home_dir(),
        }
    }
}

/// Parent side of the terminal device: the byte stream to and from the shell.
pub struct DeviceIo {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Control handle for a child running on a pseudo-terminal.
pub trait TerminalProcess: Send {
    /// OS process id of the child, if known.
    fn pid(&self) -> Option<u32>;

    /// Signal the child, wait up to `grace` for it to exit, force-kill it if
    /// it has not, reap it and close the terminal device.
    ///
    /// Must succeed when the child is already gone, and a repeated call must
    /// be a no-op.
    fn terminate(&mut self, grace: Duration) -> Result<TerminateOutcome, TeardownError>;
}

/// Everything a successful spawn hands to its caller.
pub struct SpawnedTerminal {
    pub pid: Option<u32>,
    pub process: Box<dyn TerminalProcess>,
    pub io: DeviceIo,
}

/// Creates shells attached to pseudo-terminals.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &ShellCommand) -> Result<SpawnedTerminal, SpawnError>;
}

/// [`ProcessSpawner`] backed by the platform's native PTY implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, command: &ShellCommand) -> Result<SpawnedTerminal, SpawnError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: command.rows,
                cols: command.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::OpenPty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        cmd.env("TERM", &command.term);
        if let Some(ref cwd) = command.cwd {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::Spawn {
                program: command.program.clone(),
                reason: e.to_string(),
            })?;
        // The parent must not hold the slave open, or reads on the master
        // never see EOF after the shell exits.
        drop(pair.slave);

        let mut process = PtyProcess {
            pid: child.process_id(),
            child,
            master: Some(pair.master),
            reaped: false,
        };

        let io = match process.open_io() {
            Ok(io) => io,
            Err(e) => {
                // The caller never sees this process, so clean it up here.
                if let Err(te) = process.terminate(Duration::from_millis(200)) {
                    warn!(error = %te, "failed to clean up shell after device error");
                }
                return Err(e);
            }
        };

        info!(
            pid = ?process.pid,
            shell = %command.program,
            cols = command.cols,
            rows = command.rows,
            "PTY spawned"
        );

        Ok(SpawnedTerminal {
            pid: process.pid,
            process: Box::new(process),
            io,
        })
    }
}

/// A shell child plus the master side of its pseudo-terminal.
pub struct PtyProcess {
    pid: Option<u32>,
    child: Box<dyn Child + Send + Sync>,
    master: Option<Box<dyn MasterPty + Send>>,
    reaped: bool,
}

impl PtyProcess {
    fn open_io(&self) -> Result<DeviceIo, SpawnError> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| SpawnError::Device("PTY master already closed".into()))?;
        let reader = master
            .try_clone_reader()
            .map_err(|e| SpawnError::Device(format!("failed to clone PTY reader: {e}")))?;
        let writer = master
            .take_writer()
            .map_err(|e| SpawnError::Device(format!("failed to take PTY writer: {e}")))?;
        Ok(DeviceIo { reader, writer })
    }

    /// Poll until the child exits or `deadline` passes.
    fn wait_until(&mut self, deadline: Instant) -> Result<Option<u32>, TeardownError> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(Some(status.exit_code()));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn close_device(&mut self) {
        if self.master.take().is_some() {
            debug!(pid = ?self.pid, "PTY master closed");
        }
    }
}

impl TerminalProcess for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&mut self, grace: Duration) -> Result<TerminateOutcome, TeardownError> {
        if self.reaped {
            return Ok(TerminateOutcome::AlreadyExited);
        }

        if let Some(status) = self.child.try_wait()? {
            self.reaped = true;
            self.close_device();
            debug!(pid = ?self.pid, code = status.exit_code(), "shell had already exited");
            return Ok(TerminateOutcome::Exited(status.exit_code()));
        }

        // Hang up the terminal, then ask politely. Interactive shells ignore
        // SIGTERM but honour SIGHUP.
        let mut delivered = true;
        if let Some(pid) = self.pid {
            delivered = signal_group(pid, Signal::Hangup)? && signal_group(pid, Signal::Terminate)?;
        }

        // Without delivery (ESRCH) the group is gone and the child is at most
        // a zombie, so this returns on the first check. It stays bounded
        // either way.
        let outcome = match self.wait_until(Instant::now() + grace)? {
            Some(code) => TerminateOutcome::Exited(code),
            None => {
                warn!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "shell ignored termination, killing");
                if let (true, Some(pid)) = (delivered, self.pid) {
                    if let Err(e) = signal_group(pid, Signal::Kill) {
                        warn!(pid, error = %e, "SIGKILL to process group failed");
                    }
                }
                if let Err(e) = self.child.kill() {
                    debug!(pid = ?self.pid, error = %e, "direct kill failed");
                }
                self.child.wait()?;
                TerminateOutcome::Killed
            }
        };

        self.reaped = true;
        self.close_device();
        Ok(outcome)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Hangup,
    Terminate,
    Kill,
}

/// Send `signal` to the process group led by `pid`.
///
/// Returns `Ok(false)` when no such process exists.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> Result<bool, TeardownError> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal as NixSignal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| TeardownError::Signal(format!("pid {pid} out of range")))?;
    let sig = match signal {
        Signal::Hangup => NixSignal::SIGHUP,
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(TeardownError::Signal(format!("{sig}: {e}"))),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> Result<bool, TeardownError> {
    // No process groups; the force-kill path does the work.
    Ok(true)
}
