//! Gateway socket message envelopes.
//!
//! Every frame is one JSON object carrying a `type` discriminator. Inbound
//! (browser → gateway) frames decode into [`ClientMessage`]; outbound frames
//! are produced from [`ServerMessage`].

use serde::{Deserialize, Serialize};

/// Messages sent by the browser over the gateway socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Raw keystrokes for the interactive shell.
    Data { payload: String },
    /// New terminal geometry.
    Resize { cols: u32, rows: u32 },
    /// List a remote directory (`None`, `""` and `"."` mean the home directory).
    SftpList {
        #[serde(default)]
        path: Option<String>,
    },
    /// Download one or more remote paths.
    SftpDownload { paths: Vec<String> },
    /// One base64 chunk of a file upload.
    #[serde(rename_all = "camelCase")]
    SftpUploadChunk {
        path: String,
        filename: String,
        chunk_index: usize,
        total_chunks: usize,
        content: String,
    },
    /// Begin periodic telemetry.
    MonitorStart,
    /// Stop periodic telemetry.
    MonitorStop,
    /// Any `type` this gateway does not understand.
    #[serde(other)]
    Unknown,
}

/// Messages pushed from the gateway to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TerminalData {
        payload: String,
    },
    Error {
        payload: String,
    },
    SftpListResponse {
        path: String,
        files: Vec<FileEntry>,
    },
    SftpDownloadResponse {
        filename: String,
        content: String,
    },
    SftpError {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SftpUploadChunkSuccess {
        chunk_index: usize,
        total_chunks: usize,
    },
    SftpUploadFinalSuccess {
        message: String,
        path: String,
    },
    SftpRemoteProgress {
        progress: u8,
        speed: f64,
    },
    MonitorUpdate {
        payload: MonitorPayload,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            payload: message.into(),
        }
    }

    pub fn sftp_error(message: impl Into<String>) -> Self {
        ServerMessage::SftpError {
            message: message.into(),
        }
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// `ls -l` style line for the entry.
    pub longname: String,
    pub is_directory: bool,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
    /// Absolute remote path.
    pub path: String,
}

/// Body of a `monitor_update` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorPayload {
    pub system_stats: SystemStats,
    pub docker_containers: Vec<ContainerStats>,
}

/// Host-level gauges and rates for one telemetry tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub cpu_model: String,
    pub uptime: String,
    /// CPU utilization over the sample gap, 0–100.
    pub cpu_usage: f64,
    /// Memory utilization, 0–100.
    pub memory_usage: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    /// Root filesystem usage as printed by `df`, e.g. `"42%"`.
    pub disk_usage: String,
    pub network_rx: String,
    pub network_tx: String,
}

/// Resource usage for one running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub status: String,
    pub cpu: String,
    pub memory: String,
}
