//! Screen sharing through an `x11vnc` child process.

use mirror_core::messages::{ScreenStartRequest, ScreenStatus, StreamQuality};
use mirror_core::{MirrorError, MirrorResult};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Stderr lines kept for error reports.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone)]
pub struct ScreenSettings {
    pub program: String,
    pub display: String,
    pub port: u16,
    pub quality: StreamQuality,
    pub log_file: PathBuf,
    /// How long a fresh child must stay up to count as started.
    pub startup_check: Duration,
    /// How long `stop` waits after SIGTERM before killing.
    pub stop_timeout: Duration,
}

impl Default for ScreenSettings {
    fn default() -> Self {
        Self {
            program: "x11vnc".into(),
            display: ":0".into(),
            port: 5901,
            quality: StreamQuality::Medium,
            log_file: PathBuf::from("x11vnc.log"),
            startup_check: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

struct Running {
    child: Child,
    pid: Option<u32>,
    started: Instant,
    stderr: Arc<Mutex<VecDeque<String>>>,
}

/// Owns at most one streamer process.
pub struct ScreenStreamer {
    settings: ScreenSettings,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl ScreenStreamer {
    pub fn new(settings: ScreenSettings) -> Self {
        Self {
            settings,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Command-line arguments for one start request.
    pub fn build_args(&self, req: &ScreenStartRequest) -> Vec<String> {
        let s = &self.settings;
        let mut args: Vec<String> = vec![
            "-display".into(),
            s.display.clone(),
            "-rfbport".into(),
            s.port.to_string(),
            "-forever".into(),
            "-shared".into(),
            "-o".into(),
            s.log_file.display().to_string(),
        ];
        match req.quality.unwrap_or(s.quality) {
            StreamQuality::Low => args.extend(["-scale", "0.7", "-quality", "30"].map(String::from)),
            StreamQuality::Medium => args.extend(["-quality", "60"].map(String::from)),
            StreamQuality::High => args.extend(["-quality", "90"].map(String::from)),
        }
        match req.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => {
                args.push("-passwd".into());
                args.push(password.to_string());
            }
            None => args.push("-nopw".into()),
        }
        if !req.allow_remote {
            args.push("-localhost".into());
        }
        args.extend(["-threads", "-ncache", "10", "-ncache_cr", "-cursor", "arrow"].map(String::from));
        args
    }

    pub async fn start(&self, req: &ScreenStartRequest) -> MirrorResult<ScreenStatus> {
        let mut running = self.running.lock().await;
        if let Some(ref mut r) = *running {
            if r.child.try_wait()?.is_none() {
                debug!(pid = ?r.pid, "screen stream already running");
                return Ok(self.status_of("already_running", Some(&*r)));
            }
            *running = None;
        }

        if let Some(dir) = self.settings.log_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let args = self.build_args(req);
        let mut child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MirrorError::Tool(format!("{} is not installed", self.settings.program))
                } else {
                    MirrorError::Tool(format!("failed to start {}: {e}", self.settings.program))
                }
            })?;
        let pid = child.id();

        let stderr = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
        if let Some(pipe) = child.stderr.take() {
            let tail = Arc::clone(&stderr);
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "x11vnc", "{line}");
                    let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        tokio::time::sleep(self.settings.startup_check).await;
        if let Some(status) = child.try_wait()? {
            // Let the drain task pick up the last lines.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let detail = join_tail(&stderr);
            warn!(status = %status, stderr = %detail, "screen stream exited during startup");
            return Err(MirrorError::Tool(if detail.is_empty() {
                format!("{} exited with {status}", self.settings.program)
            } else {
                format!("{} exited with {status}: {detail}", self.settings.program)
            }));
        }

        info!(
            pid = ?pid,
            port = self.settings.port,
            display = %self.settings.display,
            localhost_only = !req.allow_remote,
            "screen stream started"
        );
        let r = Running {
            child,
            pid,
            started: Instant::now(),
            stderr,
        };
        let status = self.status_of("running", Some(&r));
        *running = Some(r);
        Ok(status)
    }

    /// Stop the streamer: SIGTERM, then a kill if it outlives the timeout.
    pub async fn stop(&self) -> MirrorResult<ScreenStatus> {
        let mut running = self.running.lock().await;
        let Some(mut r) = running.take() else {
            return Ok(self.status_of("not_running", None));
        };
        if r.child.try_wait()?.is_some() {
            return Ok(self.status_of("not_running", None));
        }

        request_exit(r.pid);
        match tokio::time::timeout(self.settings.stop_timeout, r.child.wait()).await {
            Ok(result) => {
                let status = result?;
                info!(pid = ?r.pid, status = %status, "screen stream stopped");
            }
            Err(_) => {
                warn!(pid = ?r.pid, "screen stream ignored SIGTERM, killing");
                r.child.kill().await?;
            }
        }
        debug!(stderr = %join_tail(&r.stderr), "screen stream stderr");
        Ok(self.status_of("stopped", None))
    }

    pub async fn status(&self) -> ScreenStatus {
        let mut running = self.running.lock().await;
        if let Some(ref mut r) = *running {
            if matches!(r.child.try_wait(), Ok(None)) {
                return self.status_of("running", Some(&*r));
            }
            warn!(pid = ?r.pid, "screen stream exited unexpectedly");
            *running = None;
        }
        self.status_of("not_running", None)
    }

    pub async fn is_active(&self) -> bool {
        self.status().await.active
    }

    fn status_of(&self, status: &str, running: Option<&Running>) -> ScreenStatus {
        ScreenStatus {
            status: status.to_string(),
            active: running.is_some(),
            port: self.settings.port,
            pid: running.and_then(|r| r.pid),
            uptime_seconds: running.map(|r| r.started.elapsed().as_secs_f64()),
            log_file: self.settings.log_file.display().to_string(),
        }
    }
}

fn join_tail(tail: &Mutex<VecDeque<String>>) -> String {
    let tail = tail.lock().unwrap_or_else(|p| p.into_inner());
    tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
}

#[cfg(unix)]
fn request_exit(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_exit(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_program(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("fake-x11vnc");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn streamer(program: String, dir: &tempfile::TempDir) -> ScreenStreamer {
        ScreenStreamer::new(ScreenSettings {
            program,
            log_file: dir.path().join("logs/x11vnc.log"),
            startup_check: Duration::from_millis(200),
            stop_timeout: Duration::from_secs(2),
            ..ScreenSettings::default()
        })
    }

    #[test]
    fn args_for_defaults() {
        let s = ScreenStreamer::new(ScreenSettings::default());
        let args = s.build_args(&ScreenStartRequest::default());
        assert_eq!(
            args,
            [
                "-display", ":0", "-rfbport", "5901", "-forever", "-shared", "-o", "x11vnc.log",
                "-quality", "60", "-nopw", "-threads", "-ncache", "10", "-ncache_cr", "-cursor",
                "arrow"
            ]
        );
    }

    #[test]
    fn args_for_low_quality_local_with_password() {
        let s = ScreenStreamer::new(ScreenSettings::default());
        let args = s.build_args(&ScreenStartRequest {
            quality: Some(StreamQuality::Low),
            password: Some("hunter2".into()),
            allow_remote: false,
        });
        let joined = args.join(" ");
        assert!(joined.contains("-scale 0.7 -quality 30"));
        assert!(joined.contains("-passwd hunter2"));
        assert!(!joined.contains("-nopw"));
        assert!(joined.contains("-localhost"));
    }

    #[tokio::test]
    async fn start_stop_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let s = streamer(fake_program(&dir, "exec sleep 30"), &dir);

        assert_eq!(s.status().await.status, "not_running");
        let started = s.start(&ScreenStartRequest::default()).await.unwrap();
        assert_eq!(started.status, "running");
        assert!(started.active);
        assert!(started.pid.is_some());
        assert!(dir.path().join("logs").is_dir());

        let again = s.start(&ScreenStartRequest::default()).await.unwrap();
        assert_eq!(again.status, "already_running");
        assert_eq!(again.pid, started.pid);
        assert!(s.is_active().await);

        let stopped = s.stop().await.unwrap();
        assert_eq!(stopped.status, "stopped");
        assert!(!stopped.active);
        assert_eq!(s.stop().await.unwrap().status, "not_running");
    }

    #[tokio::test]
    async fn early_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let s = streamer(fake_program(&dir, "echo 'XOpenDisplay failed' >&2; exit 1"), &dir);
        let err = s.start(&ScreenStartRequest::default()).await.unwrap_err();
        assert!(matches!(err, MirrorError::Tool(ref m) if m.contains("XOpenDisplay")), "{err}");
        assert!(!s.is_active().await);
    }

    #[tokio::test]
    async fn stop_kills_stubborn_child() {
        let dir = tempfile::tempdir().unwrap();
        let s = ScreenStreamer::new(ScreenSettings {
            stop_timeout: Duration::from_millis(200),
            ..streamer(fake_program(&dir, "trap '' TERM; while true; do sleep 1; done"), &dir).settings
        });
        s.start(&ScreenStartRequest::default()).await.unwrap();
        let stopped = s.stop().await.unwrap();
        assert_eq!(stopped.status, "stopped");
    }

    #[tokio::test]
    async fn missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let s = streamer("/nonexistent/x11vnc".into(), &dir);
        let err = s.start(&ScreenStartRequest::default()).await.unwrap_err();
        assert!(matches!(err, MirrorError::Tool(ref m) if m.contains("not installed")));
    }
}
