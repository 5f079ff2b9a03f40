//! File-system operations exposed over the API.

use crate::config::expand_home;
use mirror_core::messages::{
    ContentEncoding, EntryKind, FileContent, FileEntry, FileListing, FileMetadata, FileOpResult,
    ListingSummary,
};
use mirror_core::{MirrorError, MirrorResult};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::{debug, info, warn};

/// Default cap on `read_file`, 10 MiB.
pub const DEFAULT_MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FileService {
    max_read_bytes: u64,
}

impl Default for FileService {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_READ_BYTES)
    }
}

impl FileService {
    pub fn new(max_read_bytes: u64) -> Self {
        Self { max_read_bytes }
    }

    /// List a directory: directories first, then files, by case-insensitive name.
    pub async fn list_dir(&self, path: &str) -> MirrorResult<FileListing> {
        let dir = resolve_existing(path).await?;
        let meta = fs::metadata(&dir).await.map_err(|e| io_error(&dir, e))?;
        if !meta.is_dir() {
            return Err(MirrorError::InvalidRequest(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        if !accessible(&dir, Access::Read) {
            return Err(MirrorError::PermissionDenied(dir.display().to_string()));
        }

        let mut reader = fs::read_dir(&dir).await.map_err(|e| io_error(&dir, e))?;
        let mut items = Vec::new();
        let mut summary = ListingSummary::default();
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let item_path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            match fs::metadata(&item_path).await {
                Ok(meta) => {
                    let is_dir = meta.is_dir();
                    if is_dir {
                        summary.directories += 1;
                    } else {
                        summary.files += 1;
                        summary.total_size += meta.len();
                    }
                    items.push(FileEntry {
                        name,
                        path: item_path.display().to_string(),
                        kind: if is_dir { EntryKind::Dir } else { EntryKind::File },
                        size: (!is_dir).then(|| meta.len()),
                        modified: modified_secs(&meta),
                        permissions: Some(mode_string(&meta)),
                        readable: accessible(&item_path, Access::Read),
                        writable: accessible(&item_path, Access::Write),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(path = %item_path.display(), error = %e, "could not stat entry");
                    items.push(FileEntry {
                        name,
                        path: item_path.display().to_string(),
                        kind: EntryKind::Unknown,
                        size: None,
                        modified: None,
                        permissions: None,
                        readable: false,
                        writable: false,
                        error: Some("access denied".into()),
                    });
                }
            }
        }

        items.sort_by(|a, b| {
            let a_dir = a.kind != EntryKind::Dir;
            let b_dir = b.kind != EntryKind::Dir;
            a_dir
                .cmp(&b_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        summary.total_items = items.len();

        info!(
            path = %dir.display(),
            items = summary.total_items,
            files = summary.files,
            directories = summary.directories,
            "listed directory"
        );
        Ok(FileListing {
            path: dir.display().to_string(),
            items,
            summary,
        })
    }

    /// Read a file as UTF-8 text, or as hex when it is not valid UTF-8.
    pub async fn read_file(&self, path: &str) -> MirrorResult<FileContent> {
        let file = resolve_existing(path).await?;
        let meta = fs::metadata(&file).await.map_err(|e| io_error(&file, e))?;
        if !meta.is_file() {
            return Err(MirrorError::InvalidRequest(format!(
                "{} is not a file",
                file.display()
            )));
        }
        if meta.len() > self.max_read_bytes {
            warn!(path = %file.display(), size = meta.len(), "file too large to read");
            return Err(MirrorError::InvalidRequest(format!(
                "file too large ({} bytes, max {})",
                meta.len(),
                self.max_read_bytes
            )));
        }

        let bytes = fs::read(&file).await.map_err(|e| io_error(&file, e))?;
        let (content, encoding) = match String::from_utf8(bytes) {
            Ok(text) => (text, ContentEncoding::Utf8),
            Err(e) => {
                debug!(path = %file.display(), "file is binary, returning hex");
                (hex::encode(e.into_bytes()), ContentEncoding::Binary)
            }
        };
        let is_binary = encoding == ContentEncoding::Binary;

        info!(path = %file.display(), size = meta.len(), is_binary, "read file");
        Ok(FileContent {
            path: file.display().to_string(),
            content,
            metadata: FileMetadata {
                size: meta.len(),
                encoding,
                is_binary,
                modified: modified_secs(&meta),
                permissions: Some(mode_string(&meta)),
            },
        })
    }

    /// Replace a file's contents. The previous version is kept as
    /// `<name>.bak` until the write succeeds and restored if it does not.
    pub async fn write_file(&self, path: &str, content: &str) -> MirrorResult<FileOpResult> {
        let file = absolute(path)?;
        let mut backup = None;
        match fs::metadata(&file).await {
            Ok(meta) if meta.is_dir() => {
                return Err(MirrorError::InvalidRequest(format!(
                    "{} is a directory",
                    file.display()
                )))
            }
            Ok(_) => {
                let bak = backup_path(&file);
                fs::rename(&file, &bak).await.map_err(|e| io_error(&file, e))?;
                debug!(backup = %bak.display(), "created backup");
                backup = Some(bak);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&file, e)),
        }

        match write_new(&file, content).await {
            Ok(size) => {
                if let Some(ref bak) = backup {
                    if let Err(e) = fs::remove_file(bak).await {
                        warn!(backup = %bak.display(), error = %e, "failed to remove backup");
                    }
                }
                info!(path = %file.display(), size, "wrote file");
                Ok(FileOpResult {
                    status: "success".into(),
                    path: file.display().to_string(),
                    size: Some(size),
                })
            }
            Err(e) => {
                if let Some(ref bak) = backup {
                    match fs::rename(bak, &file).await {
                        Ok(()) => info!(path = %file.display(), "restored backup after failed write"),
                        Err(re) => warn!(path = %file.display(), error = %re, "failed to restore backup"),
                    }
                }
                Err(io_error(&file, e))
            }
        }
    }

    /// Delete a file or an empty directory.
    pub async fn delete_path(&self, path: &str) -> MirrorResult<FileOpResult> {
        let target = resolve_existing(path).await?;
        if let Some(parent) = target.parent() {
            if !accessible(parent, Access::Write) {
                return Err(MirrorError::PermissionDenied(target.display().to_string()));
            }
        }

        let meta = fs::metadata(&target).await.map_err(|e| io_error(&target, e))?;
        let result = if meta.is_dir() {
            fs::remove_dir(&target).await
        } else {
            fs::remove_file(&target).await
        };
        match result {
            Ok(()) => {
                info!(path = %target.display(), dir = meta.is_dir(), "deleted");
                Ok(FileOpResult {
                    status: "success".into(),
                    path: target.display().to_string(),
                    size: None,
                })
            }
            Err(e) if is_not_empty(&e) => {
                warn!(path = %target.display(), "refusing to delete non-empty directory");
                Err(MirrorError::InvalidRequest("directory not empty".into()))
            }
            Err(e) => Err(io_error(&target, e)),
        }
    }
}

async fn write_new(file: &Path, content: &str) -> io::Result<u64> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(file, content.as_bytes()).await?;
    Ok(fs::metadata(file).await?.len())
}

fn backup_path(file: &Path) -> PathBuf {
    let mut name = file.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".bak");
    file.with_file_name(name)
}

fn absolute(path: &str) -> MirrorResult<PathBuf> {
    if path.trim().is_empty() {
        return Err(MirrorError::InvalidRequest("path is required".into()));
    }
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

async fn resolve_existing(path: &str) -> MirrorResult<PathBuf> {
    let abs = absolute(path)?;
    fs::canonicalize(&abs).await.map_err(|e| io_error(&abs, e))
}

fn io_error(path: &Path, e: io::Error) -> MirrorError {
    match e.kind() {
        io::ErrorKind::NotFound => MirrorError::NotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => MirrorError::PermissionDenied(path.display().to_string()),
        _ => MirrorError::Io(e),
    }
}

fn modified_secs(meta: &Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

#[cfg(unix)]
fn accessible(path: &Path, access: Access) -> bool {
    use nix::unistd::{access as check, AccessFlags};
    let flags = match access {
        Access::Read => AccessFlags::R_OK,
        Access::Write => AccessFlags::W_OK,
    };
    check(path, flags).is_ok()
}

#[cfg(not(unix))]
fn accessible(path: &Path, access: Access) -> bool {
    match access {
        Access::Read => path.exists(),
        Access::Write => std::fs::metadata(path).map(|m| !m.permissions().readonly()).unwrap_or(false),
    }
}

#[cfg(unix)]
fn is_not_empty(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::libc::ENOTEMPTY) || e.raw_os_error() == Some(nix::libc::EEXIST)
}

#[cfg(not(unix))]
fn is_not_empty(_e: &io::Error) -> bool {
    false
}

/// `ls -l` style mode string, e.g. `drwxr-xr-x`.
#[cfg(unix)]
fn mode_string(meta: &Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.permissions().mode();
    let kind = if meta.is_dir() {
        'd'
    } else if meta.file_type().is_symlink() {
        'l'
    } else {
        '-'
    };
    let mut s = String::with_capacity(10);
    s.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

#[cfg(not(unix))]
fn mode_string(meta: &Metadata) -> String {
    let kind = if meta.is_dir() { 'd' } else { '-' };
    let w = if meta.permissions().readonly() { '-' } else { 'w' };
    format!("{kind}r{w}-r{w}-r{w}-")
}
