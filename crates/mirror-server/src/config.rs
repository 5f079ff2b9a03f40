//! Server configuration: TOML file + CLI overrides.

use mirror_core::messages::StreamQuality;
use mirror_core::{generate_token, MirrorError, MirrorResult};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable holding an extra access token.
pub const TOKEN_ENV: &str = "MOBILEMIRROR_TOKEN";

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/mobilemirror/config.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub files: FilesSection,
    #[serde(default)]
    pub mouse: MouseSection,
    #[serde(default)]
    pub screen: ScreenSection,
    #[serde(default)]
    pub qr: QrSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            max_sessions: default_max_sessions(),
            terminate_grace_ms: default_terminate_grace_ms(),
            read_chunk: default_read_chunk(),
        }
    }
}

/// `[files]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesSection {
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            max_read_bytes: default_max_read_bytes(),
        }
    }
}

/// `[mouse]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MouseSection {
    #[serde(default = "default_mouse_tool")]
    pub tool: String,
    #[serde(default = "default_max_per_second")]
    pub max_per_second: u32,
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
}

impl Default for MouseSection {
    fn default() -> Self {
        Self {
            tool: default_mouse_tool(),
            max_per_second: default_max_per_second(),
            max_per_minute: default_max_per_minute(),
        }
    }
}

/// `[screen]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenSection {
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default = "default_display")]
    pub display: String,
    #[serde(default = "default_screen_port")]
    pub port: u16,
    #[serde(default)]
    pub quality: StreamQuality,
    #[serde(default = "default_screen_log")]
    pub log_file: String,
}

impl Default for ScreenSection {
    fn default() -> Self {
        Self {
            autostart: true,
            display: default_display(),
            port: default_screen_port(),
            quality: StreamQuality::default(),
            log_file: default_screen_log(),
        }
    }
}

/// `[qr]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct QrSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_ui_scheme")]
    pub ui_scheme: String,
    #[serde(default = "default_ui_port")]
    pub ui_port: u16,
}

impl Default for QrSection {
    fn default() -> Self {
        Self {
            url: None,
            ui_scheme: default_ui_scheme(),
            ui_port: default_ui_port(),
        }
    }
}

/// `[logging]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_true")]
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            dir: None,
            json: true,
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8000
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_max_sessions() -> usize {
    16
}
fn default_terminate_grace_ms() -> u64 {
    2000
}
fn default_read_chunk() -> usize {
    8192
}
fn default_max_read_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_mouse_tool() -> String {
    "xdotool".to_string()
}
fn default_max_per_second() -> u32 {
    50
}
fn default_max_per_minute() -> u32 {
    1000
}
fn default_display() -> String {
    ":0".to_string()
}
fn default_screen_port() -> u16 {
    5901
}
fn default_screen_log() -> String {
    "~/.local/share/applications/system/services/x11vnc.log".to_string()
}
fn default_ui_scheme() -> String {
    "https".to_string()
}
fn default_ui_port() -> u16 {
    5000
}
fn default_true() -> bool {
    true
}

/// Values given on the command line. `None` means "use the file".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub shell: Option<String>,
    pub max_sessions: Option<usize>,
    pub no_screen: bool,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub tokens: Vec<String>,
    /// True when no token was configured and one was generated.
    pub generated_token: bool,
    pub shell: Option<String>,
    pub shell_args: Vec<String>,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub max_sessions: usize,
    pub terminate_grace: Duration,
    pub read_chunk: usize,
    pub max_read_bytes: u64,
    pub mouse_tool: String,
    pub mouse_max_per_second: u32,
    pub mouse_max_per_minute: u32,
    pub screen_autostart: bool,
    pub display: String,
    pub screen_port: u16,
    pub screen_quality: StreamQuality,
    pub screen_log: PathBuf,
    pub qr_url: Option<String>,
    pub ui_scheme: String,
    pub ui_port: u16,
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> MirrorResult<Self> {
        let path = config_path
            .map(expand_tilde)
            .unwrap_or_else(|| expand_home(DEFAULT_CONFIG_PATH));
        let file_config = if path.exists() {
            info!(path = %path.display(), "loading config file");
            let content = std::fs::read_to_string(&path)?;
            parse(&content)?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            ConfigFile::default()
        };
        let env_token = std::env::var(TOKEN_ENV).ok();
        Ok(Self::resolve(file_config, overrides, env_token))
    }

    /// Merge a parsed file, CLI overrides and the token environment variable.
    pub fn resolve(file: ConfigFile, overrides: &Overrides, env_token: Option<String>) -> Self {
        let mut tokens: Vec<String> = file
            .auth
            .tokens
            .into_iter()
            .chain(env_token)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        tokens.dedup();
        let generated_token = tokens.is_empty();
        if generated_token {
            tokens.push(generate_token());
        }

        let mut max_sessions = overrides.max_sessions.unwrap_or(file.terminal.max_sessions);
        if max_sessions == 0 {
            warn!("max_sessions must be at least 1, using 1");
            max_sessions = 1;
        }

        Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            tokens,
            generated_token,
            shell: overrides.shell.clone().or(file.terminal.shell),
            shell_args: file.terminal.args,
            term: file.terminal.term,
            cols: file.terminal.cols,
            rows: file.terminal.rows,
            max_sessions,
            terminate_grace: Duration::from_millis(file.terminal.terminate_grace_ms),
            read_chunk: file.terminal.read_chunk.max(1),
            max_read_bytes: file.files.max_read_bytes,
            mouse_tool: file.mouse.tool,
            mouse_max_per_second: file.mouse.max_per_second,
            mouse_max_per_minute: file.mouse.max_per_minute,
            screen_autostart: file.screen.autostart && !overrides.no_screen,
            display: file.screen.display,
            screen_port: file.screen.port,
            screen_quality: file.screen.quality,
            screen_log: expand_home(&file.screen.log_file),
            qr_url: file.qr.url,
            ui_scheme: file.qr.ui_scheme,
            ui_port: file.qr.ui_port,
            log_dir: file.logging.dir.as_deref().map(expand_home),
            log_json: file.logging.json,
        }
    }
}

/// Parse config TOML text.
pub fn parse(content: &str) -> MirrorResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| MirrorError::InvalidRequest(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_home(&s)
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_home(s: &str) -> PathBuf {
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
