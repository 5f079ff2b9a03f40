//! Process-wide table of live terminal sessions.
//!
//! The registry holds shared references only; each session is owned by the
//! controller that created it. It also carries the admission limit: a
//! controller must hold a permit for as long as its session lives.

use mirror_core::messages::SessionSummary;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Commands in a client message: one per `\n`.
pub fn command_count(data: &[u8]) -> u64 {
    data.iter().filter(|&&b| b == b'\n').count() as u64
}

/// Lifecycle position of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Accepted = 0,
    ProcessSpawned = 1,
    Relaying = 2,
    Terminating = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Accepted,
            1 => Self::ProcessSpawned,
            2 => Self::Relaying,
            3 => Self::Terminating,
            _ => Self::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::ProcessSpawned => "process_spawned",
            Self::Relaying => "relaying",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        }
    }
}

/// One interactive terminal connection.
pub struct Session {
    pub id: String,
    pub pid: Option<u32>,
    pub created_at: Instant,
    /// Wall-clock start, seconds since the unix epoch.
    pub started_at: u64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    commands: AtomicU64,
    state: AtomicU8,
    shutdown: Notify,
}

impl Session {
    pub fn new(id: String, pid: Option<u32>) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            id,
            pid,
            created_at: Instant::now(),
            started_at,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            commands: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::ProcessSpawned as u8),
            shutdown: Notify::new(),
        }
    }

    /// Count `n` bytes read from the terminal device.
    pub fn record_output(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Count one client message accepted for the device.
    pub fn record_input(&self, bytes: usize, commands: u64) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        if commands > 0 {
            self.commands.fetch_add(commands, Ordering::Relaxed);
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn commands_executed(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Ask the session's relay to stop. Safe to call any number of times.
    pub fn request_shutdown(&self) {
        // notify_one stores a permit, so a request made before the relay
        // starts waiting is not lost.
        self.shutdown.notify_one();
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) has been called.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            pid: self.pid,
            state: self.state().as_str().to_string(),
            started_at: self.started_at,
            duration_seconds: self.created_at.elapsed().as_secs_f64(),
            commands_executed: self.commands_executed(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
        }
    }
}

/// Shared table of live sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    seq: AtomicU64,
    admission: Arc<Semaphore>,
    max_sessions: usize,
    drained: Notify,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        let max_sessions = max_sessions.max(1);
        Self {
            sessions: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            admission: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            drained: Notify::new(),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Reserve a session slot, or `None` when the limit is reached.
    pub fn admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.admission).try_acquire_owned().ok()
    }

    /// A fresh identifier, unique for the life of the process.
    pub fn next_id(&self) -> String {
        use rand::Rng;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let salt: [u8; 8] = rand::thread_rng().gen();
        format!("term-{seq:x}-{}", hex::encode(salt))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, session: Arc<Session>) {
        debug!(session_id = %session.id, "session registered");
        self.lock().insert(session.id.clone(), session);
    }

    /// Remove a session. Returns it only for the first caller.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let (removed, now_empty) = {
            let mut sessions = self.lock();
            let removed = sessions.remove(id);
            (removed, sessions.is_empty())
        };
        if removed.is_some() {
            debug!(session_id = %id, "session unregistered");
            if now_empty {
                self.drained.notify_waiters();
            }
        }
        removed
    }

    /// Resolves once no session is registered.
    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking, so a removal in between is not missed.
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Statistics for every live session, oldest first.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.lock().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(|s| s.summary()).collect();
        summaries.sort_by_key(|s| std::cmp::Reverse(ordered(s.duration_seconds)));
        summaries
    }

    /// Ask one session to stop. Returns false if it is not registered.
    pub fn shutdown(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.request_shutdown();
                true
            }
            None => false,
        }
    }

    /// Ask every live session to stop. Returns how many were asked.
    pub fn shutdown_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self.lock().values().cloned().collect();
        for session in &sessions {
            session.request_shutdown();
        }
        sessions.len()
    }
}

fn ordered(secs: f64) -> u64 {
    (secs * 1_000_000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_counts_newlines() {
        let session = Session::new("s".into(), None);
        for msg in [&b"a\nb\n"[..], b"c"] {
            session.record_input(msg.len(), command_count(msg));
        }
        assert_eq!(command_count(b""), 0);
        assert_eq!(session.commands_executed(), 2);
        assert_eq!(session.bytes_received(), 5);
    }

    #[test]
    fn output_counter_accumulates() {
        let session = Session::new("s".into(), None);
        session.record_output(10);
        session.record_output(0);
        session.record_output(22);
        assert_eq!(session.bytes_sent(), 32);
    }

    #[test]
    fn insert_remove_snapshot() {
        let registry = SessionRegistry::new(4);
        let id = registry.next_id();
        registry.insert(Arc::new(Session::new(id.clone(), Some(42))));

        assert!(registry.contains(&id));
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].session_id, id);
        assert_eq!(snap[0].pid, Some(42));
        assert_eq!(snap[0].state, "process_spawned");

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let registry = SessionRegistry::new(1);
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| registry.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn admission_limit() {
        let registry = SessionRegistry::new(2);
        let a = registry.admit().unwrap();
        let _b = registry.admit().unwrap();
        assert!(registry.admit().is_none());
        drop(a);
        assert!(registry.admit().is_some());
    }

    #[test]
    fn state_roundtrip() {
        let session = Session::new("s".into(), None);
        assert_eq!(session.state(), SessionState::ProcessSpawned);
        session.set_state(SessionState::Relaying);
        assert_eq!(session.state(), SessionState::Relaying);
        session.set_state(SessionState::Closed);
        assert_eq!(session.summary().state, "closed");
    }

    #[tokio::test]
    async fn shutdown_before_wait_is_kept() {
        let registry = SessionRegistry::new(1);
        let session = Arc::new(Session::new("s".into(), None));
        registry.insert(Arc::clone(&session));

        assert!(registry.shutdown("s"));
        assert!(!registry.shutdown("missing"));
        tokio::time::timeout(std::time::Duration::from_secs(1), session.shutdown_requested())
            .await
            .expect("shutdown request should be stored");
    }

    #[tokio::test]
    async fn wait_until_empty_wakes_on_last_removal() {
        let registry = Arc::new(SessionRegistry::new(4));
        registry.insert(Arc::new(Session::new("a".into(), None)));
        registry.insert(Arc::new(Session::new("b".into(), None)));

        let waiter = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.wait_until_empty().await }
        });
        tokio::task::yield_now().await;

        registry.remove("a");
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        registry.remove("b");
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();

        // Already empty: returns straight away.
        registry.wait_until_empty().await;
    }

    #[test]
    fn shutdown_all_counts() {
        let registry = SessionRegistry::new(4);
        registry.insert(Arc::new(Session::new("a".into(), None)));
        registry.insert(Arc::new(Session::new("b".into(), None)));
        assert_eq!(registry.shutdown_all(), 2);
    }
}
