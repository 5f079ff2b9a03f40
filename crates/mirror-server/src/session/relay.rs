//! Duplex relay between a terminal device and a message-oriented connection.
//!
//! The device side is blocking, so it is driven from two blocking tasks: a
//! reader that forwards chunks over a bounded channel and a writer that
//! drains a channel into the device. The async side (`pump`) selects over
//! both directions plus the session's shutdown request and returns the
//! first termination condition.

use super::pty::DeviceIo;
use super::registry::{command_count, Session};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest read from the device, in bytes.
pub const DEFAULT_READ_CHUNK: usize = 8192;

/// Chunks buffered between the device reader and the connection.
const DEVICE_CHANNEL_DEPTH: usize = 64;

/// Messages buffered between the connection and the device writer.
const INPUT_CHANNEL_DEPTH: usize = 64;

/// What the device reader observed.
#[derive(Debug)]
pub enum DeviceEvent {
    Data(Vec<u8>),
    Eof,
    Error(io::Error),
}

/// A message from the client, already stripped of transport framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Vec<u8>),
    Close,
}

/// Why the relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The device reported end-of-file: the shell exited.
    ShellExited,
    /// Reading from the device failed.
    DeviceRead(io::Error),
    /// Writing to the device failed.
    DeviceWrite(Option<io::Error>),
    /// The client closed the connection.
    ClientClosed,
    /// The connection failed.
    Network(String),
    /// Shutdown was requested for this session.
    Shutdown,
}

impl RelayEnd {
    /// Whether this end should be reported as a failure. Clean closes from
    /// either side are not.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            RelayEnd::DeviceRead(_) | RelayEnd::DeviceWrite(_) | RelayEnd::Network(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RelayEnd::ShellExited => "shell_exited",
            RelayEnd::DeviceRead(_) => "device_read_error",
            RelayEnd::DeviceWrite(_) => "device_write_error",
            RelayEnd::ClientClosed => "client_closed",
            RelayEnd::Network(_) => "network_error",
            RelayEnd::Shutdown => "shutdown",
        }
    }

    /// Whether the connection can still carry output.
    pub fn connection_usable(&self) -> bool {
        !matches!(self, RelayEnd::ClientClosed | RelayEnd::Network(_))
    }
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::DeviceRead(e) => write!(f, "{}: {e}", self.label()),
            RelayEnd::DeviceWrite(Some(e)) => write!(f, "{}: {e}", self.label()),
            RelayEnd::Network(e) => write!(f, "{}: {e}", self.label()),
            _ => f.write_str(self.label()),
        }
    }
}

/// Incremental UTF-8 decoding of terminal output.
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives; malformed sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more.
                            rest = &rest[valid..];
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        out
    }

    /// Flush whatever is held back, lossily.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// A running relay for one session.
pub struct Relay {
    session: Arc<Session>,
    from_device: mpsc::Receiver<DeviceEvent>,
    to_device: Option<mpsc::Sender<Vec<u8>>>,
    write_error: oneshot::Receiver<io::Error>,
    decoder: Utf8Decoder,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Relay {
    /// Start the device-side tasks. Must be called from within a tokio runtime.
    pub fn start(io: DeviceIo, session: Arc<Session>, read_chunk: usize) -> Self {
        let DeviceIo { reader, writer } = io;
        let (device_tx, from_device) = mpsc::channel(DEVICE_CHANNEL_DEPTH);
        let (to_device, input_rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);
        let (error_tx, write_error) = oneshot::channel();

        let chunk = read_chunk.max(1);
        let reader_session = Arc::clone(&session);
        let reader = tokio::task::spawn_blocking(move || {
            read_device(reader, device_tx, reader_session, chunk);
        });

        let writer_session = Arc::clone(&session);
        let writer = tokio::task::spawn_blocking(move || {
            write_device(writer, input_rx, error_tx, writer_session);
        });

        Self {
            session,
            from_device,
            to_device: Some(to_device),
            write_error,
            decoder: Utf8Decoder::default(),
            reader,
            writer,
        }
    }

    /// Relay in both directions until the first termination condition.
    pub async fn pump<S, St, E>(&mut self, sink: &mut S, stream: &mut St) -> RelayEnd
    where
        S: Sink<String> + Unpin,
        S::Error: fmt::Display,
        St: Stream<Item = Result<Inbound, E>> + Unpin,
        E: fmt::Display,
    {
        let Self {
            session,
            from_device,
            to_device,
            write_error,
            decoder,
            ..
        } = self;

        let to_device = match to_device.as_ref() {
            Some(tx) => tx.clone(),
            None => return RelayEnd::DeviceWrite(None),
        };

        let outbound = async {
            loop {
                match from_device.recv().await {
                    Some(DeviceEvent::Data(bytes)) => {
                        let text = decoder.decode(&bytes);
                        if text.is_empty() {
                            continue;
                        }
                        if let Err(e) = sink.send(text).await {
                            return RelayEnd::Network(e.to_string());
                        }
                    }
                    Some(DeviceEvent::Eof) | None => {
                        let tail = decoder.finish();
                        if !tail.is_empty() {
                            let _ = sink.send(tail).await;
                        }
                        return RelayEnd::ShellExited;
                    }
                    Some(DeviceEvent::Error(e)) => return RelayEnd::DeviceRead(e),
                }
            }
        };

        let inbound = async {
            loop {
                let message = tokio::select! {
                    _ = to_device.closed() => return RelayEnd::DeviceWrite(None),
                    message = stream.next() => message,
                };
                match message {
                    Some(Ok(Inbound::Data(bytes))) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        let (len, commands) = (bytes.len(), command_count(&bytes));
                        if to_device.send(bytes).await.is_err() {
                            return RelayEnd::DeviceWrite(None);
                        }
                        // Counted before this task can forward the echo.
                        session.record_input(len, commands);
                    }
                    Some(Ok(Inbound::Close)) | None => return RelayEnd::ClientClosed,
                    Some(Err(e)) => return RelayEnd::Network(e.to_string()),
                }
            }
        };

        let end = tokio::select! {
            end = outbound => end,
            end = inbound => end,
            _ = session.shutdown_requested() => RelayEnd::Shutdown,
        };

        match end {
            RelayEnd::DeviceWrite(None) => RelayEnd::DeviceWrite(write_error.try_recv().ok()),
            other => other,
        }
    }

    /// Stop accepting client input. The device writer exits once it has
    /// written what is already queued.
    pub fn close_input(&mut self) {
        self.to_device.take();
    }

    /// Forward output the shell produced before it went away, for at most
    /// `budget`. Used after teardown when the connection is still open.
    pub async fn flush_pending<S>(&mut self, sink: &mut S, budget: Duration)
    where
        S: Sink<String> + Unpin,
    {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.from_device.recv()).await {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                Some(DeviceEvent::Data(bytes)) => {
                    let text = self.decoder.decode(&bytes);
                    if !text.is_empty() && sink.send(text).await.is_err() {
                        return;
                    }
                }
                Some(DeviceEvent::Eof) | Some(DeviceEvent::Error(_)) | None => break,
            }
        }
        let tail = self.decoder.finish();
        if !tail.is_empty() {
            let _ = sink.send(tail).await;
        }
    }

    /// Stop feeding the device and wait for both device tasks to finish.
    ///
    /// The reader only returns once the device reports EOF or an error, so
    /// the process must already have been terminated. Returns false if the
    /// tasks did not finish within `timeout`.
    pub async fn join(self, timeout: Duration) -> bool {
        let Self {
            session,
            from_device,
            to_device,
            reader,
            writer,
            ..
        } = self;
        drop(to_device);
        drop(from_device);

        let both = async {
            let r = reader.await;
            let w = writer.await;
            (r, w)
        };
        match tokio::time::timeout(timeout, both).await {
            Ok((r, w)) => {
                if let Err(e) = r {
                    warn!(session_id = %session.id, error = %e, "device reader task failed");
                }
                if let Err(e) = w {
                    warn!(session_id = %session.id, error = %e, "device writer task failed");
                }
                true
            }
            Err(_) => {
                warn!(
                    session_id = %session.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "device tasks still running after teardown"
                );
                false
            }
        }
    }
}

fn read_device(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<DeviceEvent>,
    session: Arc<Session>,
    chunk: usize,
) {
    let mut buf = vec![0u8; chunk];
    loop {
        let event = match reader.read(&mut buf) {
            Ok(0) => DeviceEvent::Eof,
            Ok(n) => {
                session.record_output(n);
                DeviceEvent::Data(buf[..n].to_vec())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once every slave fd is closed.
            Err(e) if is_hangup(&e) => DeviceEvent::Eof,
            Err(e) => DeviceEvent::Error(e),
        };
        let last = !matches!(event, DeviceEvent::Data(_));
        if tx.blocking_send(event).is_err() || last {
            break;
        }
    }
    debug!(session_id = %session.id, "device reader finished");
}

fn write_device(
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    error_tx: oneshot::Sender<io::Error>,
    session: Arc<Session>,
) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            debug!(session_id = %session.id, error = %e, "device write failed");
            let _ = error_tx.send(e);
            return;
        }
    }
    debug!(session_id = %session.id, "device writer finished");
}

#[cfg(unix)]
fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::libc::EIO)
}

#[cfg(not(unix))]
fn is_hangup(_e: &io::Error) -> bool {
    false
}
