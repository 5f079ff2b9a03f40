//! Tracing setup and access to the service log files.

use mirror_core::messages::LogTail;
use mirror_core::{MirrorError, MirrorResult};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Prefix of the daily log files (`mobilemirror.log.2026-10-14`).
pub const LOG_FILE_PREFIX: &str = "mobilemirror.log";

/// Lines returned by `GET /log`.
pub const TAIL_LINES: usize = 50;

/// Install the global subscriber: console output filtered by `RUST_LOG`
/// (falling back to `level`), plus a daily-rolling file under `dir`.
///
/// The returned guard flushes the file writer on drop and must be kept
/// alive for the life of the process.
pub fn init(level: &str, dir: Option<&Path>, json: bool) -> MirrorResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let mut guard = None;
    let file_layer: Option<Box<dyn Layer<Registry> + Send + Sync>> = match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            Some(if json {
                fmt::layer().json().with_writer(writer).boxed()
            } else {
                fmt::layer().with_ansi(false).with_writer(writer).boxed()
            })
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| MirrorError::Other(format!("failed to install logger: {e}")))?;
    Ok(guard)
}

/// The last `lines` lines of the newest log file in `dir`.
pub async fn tail(dir: Option<&Path>, lines: usize) -> MirrorResult<LogTail> {
    let Some(dir) = dir else {
        return Ok(LogTail {
            file: None,
            lines: Vec::new(),
        });
    };
    let Some(file) = newest_log(dir).await? else {
        return Ok(LogTail {
            file: None,
            lines: Vec::new(),
        });
    };

    let content = tokio::fs::read(&file).await?;
    let text = String::from_utf8_lossy(&content);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(LogTail {
        file: Some(file.display().to_string()),
        lines: all[start..].iter().map(|l| l.to_string()).collect(),
    })
}

async fn newest_log(dir: &Path) -> MirrorResult<Option<PathBuf>> {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = reader.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if newest.as_ref().map_or(true, |(t, _)| modified >= *t) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}
