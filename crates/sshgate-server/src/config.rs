//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use sshgate_core::{GateError, GateResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub transfer: TransferSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert: None,
            key: None,
            max_sessions: default_max_sessions(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// `[ssh]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub initial_cols: u32,
    #[serde(default = "default_rows")]
    pub initial_rows: u32,
    #[serde(default = "default_pixel_cell")]
    pub pixel_cell: u32,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            exec_timeout: default_exec_timeout(),
            keepalive_interval: default_keepalive_interval(),
            term: default_term(),
            initial_cols: default_cols(),
            initial_rows: default_rows(),
            pixel_cell: default_pixel_cell(),
        }
    }
}

/// `[monitor]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_monitor_interval")]
    pub interval: u64,
    #[serde(default = "default_sample_gap")]
    pub sample_gap: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            sample_gap: default_sample_gap(),
        }
    }
}

/// `[transfer]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_write_chunk")]
    pub write_chunk: usize,
    /// Largest `totalChunks` an upload may announce.
    #[serde(default = "default_max_upload_chunks")]
    pub max_upload_chunks: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            write_chunk: default_write_chunk(),
            max_upload_chunks: default_max_upload_chunks(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8022
}
fn default_max_sessions() -> usize {
    64
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_exec_timeout() -> u64 {
    15
}
fn default_keepalive_interval() -> u64 {
    30
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_cols() -> u32 {
    80
}
fn default_rows() -> u32 {
    24
}
fn default_pixel_cell() -> u32 {
    8
}
fn default_monitor_interval() -> u64 {
    3
}
fn default_sample_gap() -> u64 {
    1000
}
fn default_write_chunk() -> usize {
    32 * 1024
}
fn default_max_upload_chunks() -> usize {
    1 << 16
}

/// SSH-side settings handed to every [`crate::session::RemoteSession`].
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
    pub keepalive_interval: Duration,
    pub term: String,
    pub initial_cols: u32,
    pub initial_rows: u32,
    /// Pixels per character cell reported with PTY geometry.
    pub pixel_cell: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        SshSection::default().into()
    }
}

impl From<SshSection> for SshSettings {
    fn from(s: SshSection) -> Self {
        Self {
            connect_timeout: Duration::from_secs(s.connect_timeout.max(1)),
            exec_timeout: Duration::from_secs(s.exec_timeout.max(1)),
            keepalive_interval: Duration::from_secs(s.keepalive_interval.max(1)),
            term: s.term,
            initial_cols: s.initial_cols.max(1),
            initial_rows: s.initial_rows.max(1),
            pixel_cell: s.pixel_cell,
        }
    }
}

/// Telemetry timing.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Delay between the two counter samples of one tick.
    pub sample_gap: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSection::default().into()
    }
}

impl From<MonitorSection> for MonitorSettings {
    fn from(s: MonitorSection) -> Self {
        let interval = Duration::from_secs(s.interval.max(1));
        // The gap has to fit inside one tick.
        let sample_gap = Duration::from_millis(s.sample_gap.clamp(100, 60_000)).min(interval);
        Self {
            interval,
            sample_gap,
        }
    }
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub max_sessions: usize,
    pub max_frame_bytes: usize,
    pub ssh: SshSettings,
    pub monitor: MonitorSettings,
    pub write_chunk: usize,
    pub max_upload_chunks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides<'a> {
    pub bind: Option<&'a str>,
    pub port: Option<u16>,
    pub cert: Option<&'a str>,
    pub key: Option<&'a str>,
    pub max_sessions: Option<usize>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides<'_>) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config);

        // Merge CLI overrides
        if let Some(bind) = cli.bind {
            config.bind = bind.to_string();
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(cert) = cli.cert {
            config.cert_path = Some(expand_tilde_str(cert));
        }
        if let Some(key) = cli.key {
            config.key_path = Some(expand_tilde_str(key));
        }
        if let Some(max) = cli.max_sessions {
            config.max_sessions = max.max(1);
        }

        Ok(config)
    }

    fn from_file(file: ConfigFile) -> Self {
        Self {
            bind: file.server.bind,
            port: file.server.port,
            cert_path: file.server.cert.as_deref().map(expand_tilde_str),
            key_path: file.server.key.as_deref().map(expand_tilde_str),
            max_sessions: file.server.max_sessions.max(1),
            max_frame_bytes: file.server.max_frame_bytes.max(64 * 1024),
            ssh: file.ssh.into(),
            monitor: file.monitor.into(),
            write_chunk: file.transfer.write_chunk.clamp(1024, 4 * 1024 * 1024),
            max_upload_chunks: file.transfer.max_upload_chunks.clamp(1, 1 << 20),
        }
    }

    /// Whether both halves of a TLS identity are configured.
    pub fn tls_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }
}

fn parse_config(content: &str) -> GateResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GateError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
