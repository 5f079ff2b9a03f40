//! In-memory terminal devices and connections for session tests.

use super::pty::{
    DeviceIo, ProcessSpawner, ShellCommand, SpawnError, SpawnedTerminal, TeardownError,
    TerminalProcess, TerminateOutcome,
};
use super::relay::Inbound;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// Device output fed from a channel; EOF once every sender is gone.
pub struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.leftover = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

/// Records everything written to the device. Optionally echoes input back
/// as device output, the way a terminal in cooked mode does.
#[derive(Clone, Default)]
pub struct SharedWriter {
    buf: Arc<Mutex<Vec<u8>>>,
    echo: Option<mpsc::Sender<Vec<u8>>>,
    fail: bool,
}

impl SharedWriter {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shell is gone"));
        }
        self.buf.lock().unwrap().extend_from_slice(data);
        if let Some(ref echo) = self.echo {
            let _ = echo.send(data.to_vec());
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A device that yields `output` and then reports EOF.
pub fn eof_device(output: Vec<u8>, writer: SharedWriter) -> DeviceIo {
    DeviceIo {
        reader: Box::new(Cursor::new(output)),
        writer: Box::new(writer),
    }
}

/// A device whose reads block until the returned feed produces data or is
/// dropped.
pub fn blocking_device(writer: SharedWriter) -> (DeviceIo, mpsc::Sender<Vec<u8>>) {
    let (tx, rx) = mpsc::channel();
    let io = DeviceIo {
        reader: Box::new(ChannelReader {
            rx,
            leftover: Vec::new(),
        }),
        writer: Box::new(writer),
    };
    (io, tx)
}

/// A device that echoes everything written to it, like a terminal in
/// cooked mode. Reads block until the feed is dropped and no writer is left.
pub fn echo_device(mut writer: SharedWriter) -> (DeviceIo, mpsc::Sender<Vec<u8>>) {
    let (tx, rx) = mpsc::channel();
    writer.echo = Some(tx.clone());
    let io = DeviceIo {
        reader: Box::new(ChannelReader {
            rx,
            leftover: Vec::new(),
        }),
        writer: Box::new(writer),
    };
    (io, tx)
}

pub type ClientSender = UnboundedSender<Result<Inbound, String>>;

/// A mock connection: (sink the relay writes to, what the client sees,
/// handle the client sends with, stream the relay reads from).
pub fn connection() -> (
    UnboundedSender<String>,
    UnboundedReceiver<String>,
    ClientSender,
    UnboundedReceiver<Result<Inbound, String>>,
) {
    let (out_tx, out_rx) = unbounded();
    let (in_tx, in_rx) = unbounded();
    (out_tx, out_rx, in_tx, in_rx)
}

/// How a [`MockSpawner`] behaves.
#[derive(Clone)]
pub enum MockShell {
    /// Blocks until terminated; echoes input.
    Interactive,
    /// Prints the output and exits straight away.
    Exits(Vec<u8>),
    /// Spawning fails.
    Broken,
}

/// Spawner that hands out in-memory devices and counts teardown calls.
#[derive(Clone)]
pub struct MockSpawner {
    pub shell: MockShell,
    pub written: SharedWriter,
    pub spawns: Arc<AtomicUsize>,
    pub terminations: Arc<AtomicUsize>,
    /// Time `spawn` blocks its thread for, like a slow fork/exec.
    pub spawn_delay: Duration,
}

impl MockSpawner {
    pub fn new(shell: MockShell) -> Self {
        Self {
            shell,
            written: SharedWriter::default(),
            spawns: Arc::new(AtomicUsize::new(0)),
            terminations: Arc::new(AtomicUsize::new(0)),
            spawn_delay: Duration::ZERO,
        }
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, command: &ShellCommand) -> Result<SpawnedTerminal, SpawnError> {
        if !self.spawn_delay.is_zero() {
            std::thread::sleep(self.spawn_delay);
        }
        let pid = 40_000 + self.spawns.fetch_add(1, Ordering::SeqCst) as u32;
        let (io, feed) = match self.shell {
            MockShell::Broken => {
                return Err(SpawnError::Spawn {
                    program: command.program.clone(),
                    reason: "No such file or directory (os error 2)".into(),
                })
            }
            MockShell::Exits(ref output) => (eof_device(output.clone(), self.written.clone()), None),
            MockShell::Interactive => {
                let (io, feed) = echo_device(self.written.clone());
                (io, Some(feed))
            }
        };
        Ok(SpawnedTerminal {
            pid: Some(pid),
            process: Box::new(MockProcess {
                pid,
                feed,
                reaped: false,
                terminations: Arc::clone(&self.terminations),
            }),
            io,
        })
    }
}

/// Process whose termination hangs up its device.
pub struct MockProcess {
    pid: u32,
    feed: Option<mpsc::Sender<Vec<u8>>>,
    reaped: bool,
    terminations: Arc<AtomicUsize>,
}

impl TerminalProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&mut self, _grace: Duration) -> Result<TerminateOutcome, TeardownError> {
        if self.reaped {
            return Ok(TerminateOutcome::AlreadyExited);
        }
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.feed.take();
        self.reaped = true;
        Ok(TerminateOutcome::Exited(0))
    }
}
