//! File transfer: directory listing, archive download, chunked upload.
//!
//! Everything here talks to the remote filesystem through [`RemoteFs`], so
//! the engine runs the same against the SFTP channel and the in-memory test
//! filesystem.

pub mod archive;
pub mod listing;
pub mod sftp;
pub mod upload;

pub use sftp::SftpChannel;
pub use upload::{CompletedUpload, UploadKey, UploadTable};

use crate::progress::ProgressTracker;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sshgate_core::{GateError, GateResult, ServerMessage};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Attributes of one remote path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteAttrs {
    pub is_dir: bool,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: u64,
    /// Full `st_mode` when the server reports it.
    pub permissions: Option<u32>,
}

impl RemoteAttrs {
    /// Directory listings report links without following them.
    pub fn is_symlink(&self) -> bool {
        matches!(self.permissions, Some(mode) if mode & 0o170000 == 0o120000)
    }
}

/// One raw directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub attrs: RemoteAttrs,
}

/// Byte sink for an upload.
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Filesystem operations on the remote host.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Absolute form of `path`. `"."` resolves to the login directory.
    async fn canonicalize(&self, path: &str) -> GateResult<String>;

    async fn read_dir(&self, path: &str) -> GateResult<Vec<RemoteEntry>>;

    async fn stat(&self, path: &str) -> GateResult<RemoteAttrs>;

    async fn read_file(&self, path: &str) -> GateResult<Vec<u8>>;

    /// Create or truncate `path` for writing.
    async fn create(&self, path: &str) -> GateResult<RemoteWriter>;

    /// Whether the underlying channel failed and must be reopened.
    fn is_broken(&self) -> bool {
        false
    }

    async fn close(&self) -> GateResult<()> {
        Ok(())
    }
}

/// Listing, download and upload operations for one gateway.
#[derive(Clone)]
pub struct TransferEngine {
    uploads: Arc<UploadTable>,
    write_chunk: usize,
}

impl TransferEngine {
    pub fn new(uploads: Arc<UploadTable>, write_chunk: usize) -> Self {
        Self {
            uploads,
            write_chunk: write_chunk.max(1),
        }
    }

    pub fn uploads(&self) -> &Arc<UploadTable> {
        &self.uploads
    }

    /// List a directory. `None`, `""` and `"."` list the login directory.
    pub async fn list(&self, fs: &dyn RemoteFs, path: Option<&str>) -> GateResult<ServerMessage> {
        let requested = match path.map(str::trim) {
            None | Some("") | Some(".") => ".",
            Some(p) => p,
        };
        let resolved = fs.canonicalize(requested).await?;
        let raw = fs.read_dir(&resolved).await?;
        let files = listing::build_listing(&resolved, raw);
        debug!(path = %resolved, entries = files.len(), "directory listed");
        Ok(ServerMessage::SftpListResponse {
            path: resolved,
            files,
        })
    }

    /// Download one file as-is, or anything else as a ZIP archive.
    pub async fn download(&self, fs: &dyn RemoteFs, paths: &[String]) -> GateResult<ServerMessage> {
        let paths: Vec<&str> = paths
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();

        let (filename, bytes) = match paths.as_slice() {
            [] => return Err(GateError::Transfer("no paths to download".into())),
            [single] => {
                let attrs = fs.stat(single).await?;
                if attrs.is_dir {
                    let name = format!("{}.zip", archive::archive_stem(single));
                    (name, archive::build_zip(fs, &paths).await?)
                } else {
                    (basename(single).to_string(), fs.read_file(single).await?)
                }
            }
            _ => ("download.zip".to_string(), archive::build_zip(fs, &paths).await?),
        };

        info!(filename = %filename, bytes = bytes.len(), "download ready");
        Ok(ServerMessage::SftpDownloadResponse {
            filename,
            content: BASE64.encode(&bytes),
        })
    }

    /// Store one upload chunk. Returns the finished upload once every chunk
    /// of its assembly has arrived.
    pub async fn accept_chunk(
        &self,
        socket_id: &str,
        path: &str,
        filename: &str,
        chunk_index: usize,
        total_chunks: usize,
        content: &str,
    ) -> GateResult<Option<CompletedUpload>> {
        let bytes = BASE64
            .decode(content.trim())
            .map_err(|e| GateError::Transfer(format!("chunk {chunk_index} is not base64: {e}")))?;
        let key = UploadKey::new(socket_id, path, filename)?;
        self.uploads
            .store(key, chunk_index, total_chunks, bytes)
            .await
    }

    /// Write a completed upload, reporting progress on `events`.
    pub async fn finalize(
        &self,
        fs: &dyn RemoteFs,
        upload: CompletedUpload,
        events: &mpsc::Sender<ServerMessage>,
    ) -> GateResult<ServerMessage> {
        let target = upload.remote_path();
        let chunks = upload.total_chunks();
        let data = upload.into_bytes();

        let mut tracker = ProgressTracker::new();
        tracker.init(Some(data.len() as u64));

        let mut writer = fs.create(&target).await?;
        for piece in data.chunks(self.write_chunk) {
            writer
                .write_all(piece)
                .await
                .map_err(|e| GateError::Transfer(format!("write {target}: {e}")))?;
            if let Some(event) = tracker.on_bytes(piece.len() as u64) {
                let _ = events
                    .send(ServerMessage::SftpRemoteProgress {
                        progress: event.percent,
                        speed: event.speed,
                    })
                    .await;
            }
        }
        writer
            .shutdown()
            .await
            .map_err(|e| GateError::Transfer(format!("close {target}: {e}")))?;

        debug!(
            transferred = tracker.transferred(),
            total = ?tracker.total(),
            "upload bytes written"
        );
        if let Some(event) = tracker.end() {
            let _ = events
                .send(ServerMessage::SftpRemoteProgress {
                    progress: event.percent,
                    speed: event.speed,
                })
                .await;
        }

        info!(path = %target, chunks, bytes = data.len(), "upload written");
        Ok(ServerMessage::SftpUploadFinalSuccess {
            message: format!("Uploaded {} ({} bytes)", basename(&target), data.len()),
            path: target,
        })
    }
}

/// Last path component, ignoring trailing slashes.
pub(crate) fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None => trimmed,
    }
}

/// Join a directory and a child name with exactly one `/`.
pub(crate) fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemFs;

    fn engine() -> TransferEngine {
        TransferEngine::new(Arc::new(UploadTable::new(64)), 4)
    }

    #[test]
    fn path_helpers() {
        assert_eq!(basename("/a/file.txt"), "file.txt");
        assert_eq!(basename("/a/dir1/"), "dir1");
        assert_eq!(basename("plain"), "plain");
        assert_eq!(join_path("/", "etc"), "/etc");
        assert_eq!(join_path("/home/u", "x"), "/home/u/x");
    }

    #[tokio::test]
    async fn list_dot_resolves_home() {
        let fs = MemFs::new("/home/u");
        fs.add_dir("/home/u/docs");
        fs.add_file("/home/u/notes.txt", b"hi");

        let msg = engine().list(&fs, Some(".")).await.unwrap();
        let ServerMessage::SftpListResponse { path, files } = msg else {
            panic!("expected a listing");
        };
        assert_eq!(path, "/home/u");
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["..", "docs", "notes.txt"]);
        assert_eq!(files[0].path, "/home");
    }

    #[tokio::test]
    async fn list_root_has_no_parent_entry() {
        let fs = MemFs::new("/");
        fs.add_dir("/etc");
        let ServerMessage::SftpListResponse { path, files } =
            engine().list(&fs, None).await.unwrap()
        else {
            panic!("expected a listing");
        };
        assert_eq!(path, "/");
        assert!(files.iter().all(|f| f.name != ".."));
    }

    #[tokio::test]
    async fn list_missing_dir_fails() {
        let fs = MemFs::new("/home/u");
        assert!(matches!(
            engine().list(&fs, Some("/nope")).await,
            Err(GateError::Transfer(_))
        ));
    }

    #[tokio::test]
    async fn single_file_download_is_raw() {
        let fs = MemFs::new("/");
        fs.add_file("/a/file.txt", b"hello world");
        let msg = engine()
            .download(&fs, &["/a/file.txt".to_string()])
            .await
            .unwrap();
        let ServerMessage::SftpDownloadResponse { filename, content } = msg else {
            panic!("expected a download");
        };
        assert_eq!(filename, "file.txt");
        assert_eq!(BASE64.decode(content).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn single_dir_download_is_named_after_dir() {
        let fs = MemFs::new("/");
        fs.add_file("/a/dir1/x.txt", b"x");
        let msg = engine()
            .download(&fs, &["/a/dir1".to_string()])
            .await
            .unwrap();
        let ServerMessage::SftpDownloadResponse { filename, .. } = msg else {
            panic!("expected a download");
        };
        assert_eq!(filename, "dir1.zip");
    }

    #[tokio::test]
    async fn empty_download_request_fails() {
        let fs = MemFs::new("/");
        assert!(engine().download(&fs, &[]).await.is_err());
        assert!(engine().download(&fs, &[" ".into()]).await.is_err());
    }

    #[tokio::test]
    async fn finalize_writes_and_reports_progress() {
        let fs = MemFs::new("/home/u");
        fs.add_dir("/home/u/up");
        let engine = engine();

        let mut done = None;
        for (i, part) in [&b"abcd"[..], b"efgh", b"ij"].iter().enumerate() {
            let content = BASE64.encode(part);
            done = engine
                .accept_chunk("s1", "/home/u/up", "f.bin", i, 3, &content)
                .await
                .unwrap();
        }
        let upload = done.expect("third chunk completes the upload");

        let (tx, mut rx) = mpsc::channel(256);
        let msg = engine.finalize(&fs, upload, &tx).await.unwrap();
        drop(tx);

        assert_eq!(fs.file("/home/u/up/f.bin").unwrap(), b"abcdefghij");
        let ServerMessage::SftpUploadFinalSuccess { path, .. } = msg else {
            panic!("expected final success");
        };
        assert_eq!(path, "/home/u/up/f.bin");

        let mut percents = Vec::new();
        while let Some(ServerMessage::SftpRemoteProgress { progress, .. }) = rx.recv().await {
            percents.push(progress);
        }
        assert_eq!(percents, vec![40, 80, 100]);
    }

    #[tokio::test]
    async fn bad_base64_is_a_transfer_error() {
        let err = engine()
            .accept_chunk("s1", "/tmp", "f", 0, 1, "***")
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Transfer(_)));
    }
}
