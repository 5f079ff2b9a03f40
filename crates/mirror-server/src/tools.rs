//! Running external helper programs (xdotool, qrencode, ...).

use mirror_core::{MirrorError, MirrorResult};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Run `program args...` to completion with a deadline and return its
/// output. A missing program, a timeout and a non-zero exit status are all
/// errors.
pub async fn run(
    program: &str,
    args: &[&str],
    env: &[(&str, &str)],
    timeout: Duration,
) -> MirrorResult<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| MirrorError::Tool(format!("{program}: {e}")))?,
        Err(_) => {
            return Err(MirrorError::Timeout(format!(
                "{program} did not finish within {}ms",
                timeout.as_millis()
            )))
        }
    };

    debug!(program, status = ?output.status.code(), "tool finished");
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        return Err(MirrorError::Tool(if detail.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            format!("{program}: {detail}")
        }));
    }
    Ok(output)
}

fn spawn_error(program: &str, e: std::io::Error) -> MirrorError {
    if e.kind() == std::io::ErrorKind::NotFound {
        MirrorError::Tool(format!("{program} is not installed"))
    } else {
        MirrorError::Tool(format!("failed to run {program}: {e}"))
    }
}

/// `DISPLAY` for X11 helpers: the inherited one, else `fallback`.
pub fn display_env(fallback: &str) -> String {
    std::env::var("DISPLAY")
        .ok()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
