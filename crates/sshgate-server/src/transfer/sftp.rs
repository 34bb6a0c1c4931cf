//! [`RemoteFs`] over an SFTP subsystem channel.

use super::{RemoteAttrs, RemoteEntry, RemoteFs, RemoteWriter};
use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use sshgate_core::{GateError, GateResult};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// One SFTP session. Status replies from the server (no such file,
/// permission denied) are ordinary failures; anything else means the
/// channel itself is gone and the owner should open a new one.
pub struct SftpChannel {
    session: SftpSession,
    broken: AtomicBool,
}

impl SftpChannel {
    pub fn new(session: SftpSession) -> Self {
        Self {
            session,
            broken: AtomicBool::new(false),
        }
    }

    fn check<T>(&self, result: Result<T, SftpError>, op: &str, path: &str) -> GateResult<T> {
        classify(&self.broken, result, op, path)
    }
}

/// Map an SFTP result, flagging `broken` when the channel itself failed.
fn classify<T>(
    broken: &AtomicBool,
    result: Result<T, SftpError>,
    op: &str,
    path: &str,
) -> GateResult<T> {
    result.map_err(|e| {
        if matches!(e, SftpError::Status(_)) {
            GateError::Transfer(format!("{op} {path}: {e}"))
        } else {
            debug!(op, path, error = %e, "sftp channel failed");
            broken.store(true, Ordering::SeqCst);
            GateError::Channel(format!("{op} {path}: {e}"))
        }
    })
}

fn attrs_of(meta: &FileAttributes) -> RemoteAttrs {
    RemoteAttrs {
        is_dir: meta.is_dir(),
        size: meta.size.unwrap_or(0),
        mtime: meta.mtime.map(u64::from).unwrap_or(0),
        permissions: meta.permissions,
    }
}

#[async_trait]
impl RemoteFs for SftpChannel {
    async fn canonicalize(&self, path: &str) -> GateResult<String> {
        let result = self.session.canonicalize(path).await;
        self.check(result, "resolve", path)
    }

    async fn read_dir(&self, path: &str) -> GateResult<Vec<RemoteEntry>> {
        let result = self.session.read_dir(path).await;
        let dir = self.check(result, "list", path)?;
        Ok(dir
            .map(|entry| {
                let meta = entry.metadata();
                RemoteEntry {
                    name: entry.file_name(),
                    attrs: RemoteAttrs {
                        is_dir: entry.file_type().is_dir(),
                        ..attrs_of(&meta)
                    },
                }
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> GateResult<RemoteAttrs> {
        let result = self.session.metadata(path).await;
        let meta = self.check(result, "stat", path)?;
        Ok(attrs_of(&meta))
    }

    async fn read_file(&self, path: &str) -> GateResult<Vec<u8>> {
        let result = self.session.open(path).await;
        let mut file = self.check(result, "open", path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| GateError::Transfer(format!("read {path}: {e}")))?;
        Ok(buf)
    }

    async fn create(&self, path: &str) -> GateResult<RemoteWriter> {
        let result = self.session.create(path).await;
        let file = self.check(result, "create", path)?;
        Ok(Box::new(file))
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    async fn close(&self) -> GateResult<()> {
        self.broken.store(true, Ordering::SeqCst);
        self.session
            .close()
            .await
            .map_err(|e| GateError::Channel(format!("sftp close: {e}")))
    }
}
