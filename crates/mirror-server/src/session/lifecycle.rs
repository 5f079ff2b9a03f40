//! Per-connection terminal session lifecycle.
//!
//! `Accepted → ProcessSpawned → Relaying → Terminating → Closed`, or
//! `Accepted → Closed` when the shell cannot be started. Teardown runs
//! exactly once per session, including when the controlling future is
//! dropped mid-session.

use super::pty::{ProcessSpawner, ShellCommand, SpawnError, SpawnedTerminal, TerminalProcess};
use super::registry::{Session, SessionRegistry, SessionState};
use super::relay::{Inbound, Relay, RelayEnd, DEFAULT_READ_CHUNK};
use futures_util::{Sink, SinkExt, Stream};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Knobs for spawning and tearing down terminal sessions.
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub command: ShellCommand,
    /// How long a signalled shell gets to exit before it is killed.
    pub terminate_grace: Duration,
    pub read_chunk: usize,
    /// Upper bound on waiting for the device tasks after teardown.
    pub join_timeout: Duration,
    /// How long to keep forwarding leftover output after teardown.
    pub flush_budget: Duration,
}

impl TerminalSettings {
    pub fn new(command: ShellCommand) -> Self {
        Self {
            command,
            terminate_grace: Duration::from_secs(2),
            read_chunk: DEFAULT_READ_CHUNK,
            join_timeout: Duration::from_secs(5),
            flush_budget: Duration::from_millis(250),
        }
    }
}

/// Statistics for a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub pid: Option<u32>,
    /// Why the relay stopped (`client_closed`, `shell_exited`, ...).
    pub end: &'static str,
    pub clean: bool,
    pub duration: Duration,
    pub commands_executed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Runs terminal sessions against a shared registry.
#[derive(Clone)]
pub struct SessionController {
    registry: Arc<SessionRegistry>,
    spawner: Arc<dyn ProcessSpawner>,
    settings: Arc<TerminalSettings>,
}

impl SessionController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        spawner: Arc<dyn ProcessSpawner>,
        settings: TerminalSettings,
    ) -> Self {
        Self {
            registry,
            spawner,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Drive one accepted connection from spawn to cleanup.
    ///
    /// The only error surfaced is a failure to start the session; the
    /// connection has already been closed when it is returned. Everything
    /// that goes wrong afterwards ends the session and is reported in the
    /// returned [`SessionReport`].
    pub async fn run<S, St, E>(&self, mut sink: S, mut stream: St) -> Result<SessionReport, SpawnError>
    where
        S: Sink<String> + Unpin,
        S::Error: fmt::Display,
        St: Stream<Item = Result<Inbound, E>> + Unpin,
        E: fmt::Display,
    {
        let Some(permit) = self.registry.admit() else {
            let max = self.registry.max_sessions();
            warn!(max_sessions = max, "terminal connection refused: session limit reached");
            let _ = sink.close().await;
            return Err(SpawnError::AtCapacity(max));
        };

        let session_id = self.registry.next_id();
        debug!(session_id = %session_id, state = SessionState::Accepted.as_str(), "terminal connection accepted");

        let SpawnedTerminal { pid, process, io } = match self.spawn_shell().await {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "failed to start shell");
                let _ = sink.close().await;
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(session_id.clone(), pid));
        self.registry.insert(Arc::clone(&session));
        let mut teardown = SessionTeardown {
            registry: Arc::clone(&self.registry),
            session: Arc::clone(&session),
            process: Some(process),
            grace: self.settings.terminate_grace,
            finished: false,
        };
        info!(
            session_id = %session_id,
            pid = ?pid,
            shell = %self.settings.command.program,
            "terminal session started"
        );

        session.set_state(SessionState::Relaying);
        let mut relay = Relay::start(io, Arc::clone(&session), self.settings.read_chunk);
        let end = relay.pump(&mut sink, &mut stream).await;
        if end.is_error() {
            warn!(session_id = %session_id, reason = %end, "terminal relay failed");
        } else {
            info!(session_id = %session_id, reason = %end, "terminal relay ended");
        }

        session.set_state(SessionState::Terminating);
        relay.close_input();
        teardown.terminate().await;
        if end.connection_usable() {
            relay.flush_pending(&mut sink, self.settings.flush_budget).await;
        }
        let _ = sink.close().await;
        relay.join(self.settings.join_timeout).await;
        teardown.finish();
        drop(permit);

        let report = report(&session, &end);
        info!(
            session_id = %report.session_id,
            pid = ?report.pid,
            duration_seconds = report.duration.as_secs_f64(),
            commands_executed = report.commands_executed,
            bytes_sent = report.bytes_sent,
            bytes_received = report.bytes_received,
            end = report.end,
            "terminal session closed"
        );
        Ok(report)
    }

    /// openpty and fork/exec block, so they run off the async workers.
    async fn spawn_shell(&self) -> Result<SpawnedTerminal, SpawnError> {
        let spawner = Arc::clone(&self.spawner);
        let settings = Arc::clone(&self.settings);
        tokio::task::spawn_blocking(move || spawner.spawn(&settings.command))
            .await
            .unwrap_or_else(|e| {
                Err(SpawnError::Spawn {
                    program: self.settings.command.program.clone(),
                    reason: format!("spawn task failed: {e}"),
                })
            })
    }
}

fn report(session: &Session, end: &RelayEnd) -> SessionReport {
    SessionReport {
        session_id: session.id.clone(),
        pid: session.pid,
        end: end.label(),
        clean: !end.is_error(),
        duration: session.created_at.elapsed(),
        commands_executed: session.commands_executed(),
        bytes_sent: session.bytes_sent(),
        bytes_received: session.bytes_received(),
    }
}

/// One-shot cleanup for a session: terminate the process, then drop the
/// registry entry.
struct SessionTeardown {
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    process: Option<Box<dyn TerminalProcess>>,
    grace: Duration,
    finished: bool,
}

impl SessionTeardown {
    async fn terminate(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        let grace = self.grace;
        let result = tokio::task::spawn_blocking(move || process.terminate(grace)).await;
        match result {
            Ok(Ok(outcome)) => {
                debug!(session_id = %self.session.id, outcome = ?outcome, "shell terminated")
            }
            Ok(Err(e)) => warn!(session_id = %self.session.id, error = %e, "shell teardown failed"),
            Err(e) => warn!(session_id = %self.session.id, error = %e, "shell teardown task failed"),
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.registry.remove(&self.session.id);
        self.session.set_state(SessionState::Closed);
    }
}

impl Drop for SessionTeardown {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            // The controlling future was dropped mid-session.
            warn!(session_id = %self.session.id, "terminal session abandoned, cleaning up");
            let grace = self.grace;
            let id = self.session.id.clone();
            let spawned = std::thread::Builder::new()
                .name("mirror-teardown".into())
                .spawn(move || {
                    if let Err(e) = process.terminate(grace) {
                        warn!(session_id = %id, error = %e, "shell teardown failed");
                    }
                });
            if let Err(e) = spawned {
                warn!(session_id = %self.session.id, error = %e, "failed to start teardown thread");
            }
        }
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{connection, MockShell, MockSpawner};
    use futures_util::StreamExt;
    use std::time::Instant;

    fn controller(spawner: &MockSpawner, max_sessions: usize) -> SessionController {
        let mut settings = TerminalSettings::new(ShellCommand::resolve(Some("/bin/sh"), Vec::new()));
        settings.terminate_grace = Duration::from_millis(100);
        settings.join_timeout = Duration::from_secs(2);
        SessionController::new(
            Arc::new(SessionRegistry::new(max_sessions)),
            Arc::new(spawner.clone()),
            settings,
        )
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn ls_then_disconnect() {
        let spawner = MockSpawner::new(MockShell::Interactive);
        let ctl = controller(&spawner, 4);
        let registry = Arc::clone(ctl.registry());

        let (sink, mut out_rx, client, stream) = connection();
        let task = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run(sink, stream).await }
        });

        client.unbounded_send(Ok(Inbound::Data(b"ls\n".to_vec()))).unwrap();
        let mut seen = String::new();
        while !seen.contains("ls\n") {
            seen.push_str(&out_rx.next().await.expect("frame"));
        }

        let live = registry.snapshot();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].pid, Some(40_000));
        assert_eq!(live[0].state, "relaying");

        drop(client);
        let report = task.await.unwrap().unwrap();
        assert!(report.clean);
        assert_eq!(report.end, "client_closed");
        assert_eq!(report.pid, Some(40_000));
        assert_eq!(report.bytes_received, 3);
        assert_eq!(report.commands_executed, 1);
        assert_eq!(report.bytes_sent, 3);
        assert!(report.duration > Duration::ZERO);

        assert_eq!(spawner.terminations(), 1);
        assert!(!registry.contains(&report.session_id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shell_exit_closes_connection() {
        let spawner = MockSpawner::new(MockShell::Exits(b"bye\r\n".to_vec()));
        let ctl = controller(&spawner, 4);

        let (sink, out_rx, _client, stream) = connection();
        let report = ctl.run(sink, stream).await.unwrap();
        assert_eq!(report.end, "shell_exited");
        assert!(report.clean);
        assert_eq!(report.bytes_sent, 5);

        // The stream only ends once the connection has been closed.
        let frames: Vec<String> = out_rx.collect().await;
        assert_eq!(frames.concat(), "bye\r\n");
        assert_eq!(spawner.terminations(), 1);
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn simultaneous_ends_terminate_once() {
        let spawner = MockSpawner::new(MockShell::Exits(Vec::new()));
        let ctl = controller(&spawner, 4);

        let (sink, _out_rx, client, stream) = connection();
        drop(client);
        let report = ctl.run(sink, stream).await.unwrap();
        assert!(report.clean);
        assert_eq!(spawner.terminations(), 1);
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_closes_without_output() {
        let spawner = MockSpawner::new(MockShell::Broken);
        let ctl = controller(&spawner, 1);

        let (sink, out_rx, _client, stream) = connection();
        let err = ctl.run(sink, stream).await.unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }), "got {err}");

        let frames: Vec<String> = out_rx.collect().await;
        assert!(frames.is_empty());
        assert_eq!(spawner.terminations(), 0);
        assert!(ctl.registry().is_empty());
        // The slot was given back.
        assert!(ctl.registry().admit().is_some());
    }

    #[tokio::test]
    async fn refuses_beyond_capacity() {
        let spawner = MockSpawner::new(MockShell::Interactive);
        let ctl = controller(&spawner, 1);
        let registry = Arc::clone(ctl.registry());

        let (sink, _out_rx, client, stream) = connection();
        let first = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run(sink, stream).await }
        });
        wait_for("first session", || registry.len() == 1).await;

        let (sink2, out_rx2, _client2, stream2) = connection();
        let err = ctl.run(sink2, stream2).await.unwrap_err();
        assert!(matches!(err, SpawnError::AtCapacity(1)));
        assert!(out_rx2.collect::<Vec<_>>().await.is_empty());
        assert_eq!(spawner.spawns(), 1);

        drop(client);
        first.await.unwrap().unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_request_ends_session() {
        let spawner = MockSpawner::new(MockShell::Interactive);
        let ctl = controller(&spawner, 4);
        let registry = Arc::clone(ctl.registry());

        let (sink, _out_rx, _client, stream) = connection();
        let task = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run(sink, stream).await }
        });
        wait_for("session", || registry.len() == 1).await;

        let id = registry.snapshot()[0].session_id.clone();
        assert!(registry.shutdown(&id));
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.end, "shutdown");
        assert_eq!(spawner.terminations(), 1);
        assert!(!registry.contains(&id));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn slow_spawn_does_not_stall_runtime() {
        let mut spawner = MockSpawner::new(MockShell::Interactive);
        spawner.spawn_delay = Duration::from_millis(400);
        let ctl = controller(&spawner, 4);
        let registry = Arc::clone(ctl.registry());

        let (sink, _out_rx, client, stream) = connection();
        let task = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run(sink, stream).await }
        });

        // Let the session task start spawning, then check this task still runs.
        tokio::task::yield_now().await;
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(300), "runtime was blocked by spawn");
        assert!(registry.is_empty());

        wait_for("session", || registry.len() == 1).await;
        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(spawner.terminations(), 1);
    }

    #[tokio::test]
    async fn dropped_controller_still_cleans_up() {
        let spawner = MockSpawner::new(MockShell::Interactive);
        let ctl = controller(&spawner, 4);
        let registry = Arc::clone(ctl.registry());

        let (sink, _out_rx, _client, stream) = connection();
        let task = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run(sink, stream).await }
        });
        wait_for("session", || registry.len() == 1).await;

        task.abort();
        let _ = task.await;
        wait_for("teardown", || spawner.terminations() == 1).await;
        assert!(registry.is_empty());
    }
}
