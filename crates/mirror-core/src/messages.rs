//! JSON request and response bodies for the mobilemirror HTTP API.

use serde::{Deserialize, Serialize};

/// Response body for `GET /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
    pub screen_active: bool,
}

/// Error body returned with every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

// ── Files ─────────────────────────────────────────────────────────────

/// `?path=` query used by the listing and delete endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct PathQuery {
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Dir,
    File,
    Unknown,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time, seconds since the unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    pub readable: bool,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingSummary {
    pub total_items: usize,
    pub files: usize,
    pub directories: usize,
    pub total_size: u64,
}

/// Response body for `GET /files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListing {
    pub path: String,
    pub items: Vec<FileEntry>,
    pub summary: ListingSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadRequest {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    /// Content is hex-encoded raw bytes.
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub encoding: ContentEncoding,
    pub is_binary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

/// Response body for `POST /read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteRequest {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

/// Response body for `POST /write` and `DELETE /files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOpResult {
    pub status: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

// ── Mouse ─────────────────────────────────────────────────────────────

/// Request body for `POST /mouse`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MouseRequest {
    #[serde(default)]
    pub x: Option<i64>,
    #[serde(default)]
    pub y: Option<i64>,
    #[serde(default)]
    pub click: bool,
    #[serde(default = "default_button")]
    pub button: u8,
}

fn default_button() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MouseResult {
    pub status: String,
    pub moved: bool,
    pub clicked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button: Option<u8>,
}

// ── Screen ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamQuality {
    Low,
    #[default]
    Medium,
    High,
}

/// Request body for `POST /screen/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenStartRequest {
    #[serde(default)]
    pub quality: Option<StreamQuality>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub allow_remote: bool,
}

impl Default for ScreenStartRequest {
    fn default() -> Self {
        Self {
            quality: None,
            password: None,
            allow_remote: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenStatus {
    /// `running`, `already_running`, `stopped` or `not_running`.
    pub status: String,
    pub active: bool,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
    pub log_file: String,
}

// ── QR ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrSize {
    Small,
    #[default]
    Medium,
    Large,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QrQuery {
    #[serde(default)]
    pub size: QrSize,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    pub connection_type: String,
    pub protocol: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub path: String,
}

/// Response body for `GET /qr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrResponse {
    pub url: String,
    pub size: QrSize,
    /// `data:image/png;base64,...`
    pub qr_base64: String,
    pub qr_size_bytes: usize,
    pub metadata: ConnectionMetadata,
}

// ── Terminal sessions ─────────────────────────────────────────────────

/// Statistics for one live terminal session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub state: String,
    pub started_at: u64,
    pub duration_seconds: f64,
    pub commands_executed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Response body for `GET /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatsResponse {
    pub active_sessions: usize,
    pub sessions: Vec<SessionSummary>,
}

/// Response body for `GET /log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub lines: Vec<String>,
}
