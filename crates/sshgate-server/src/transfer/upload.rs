//! Chunked upload reassembly.
//!
//! Chunks are addressed by index, so arrival order does not matter. The
//! table is shared by every gateway socket; entries are keyed by socket id,
//! destination directory and filename.

use super::join_path;
use sshgate_core::{GateError, GateResult};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Identity of one in-flight upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey {
    socket_id: String,
    path: String,
    filename: String,
}

impl UploadKey {
    /// Rejects filenames that would escape the destination directory.
    pub fn new(socket_id: &str, path: &str, filename: &str) -> GateResult<Self> {
        let filename = filename.trim();
        if filename.is_empty() || filename == "." || filename == ".." || filename.contains('/') {
            return Err(GateError::Transfer(format!(
                "invalid upload filename: {filename:?}"
            )));
        }
        let path = match path.trim() {
            "" => ".",
            p => p,
        };
        Ok(Self {
            socket_id: socket_id.to_string(),
            path: path.to_string(),
            filename: filename.to_string(),
        })
    }
}

struct Assembly {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
}

impl Assembly {
    fn new(total: usize) -> GateResult<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(total)
            .map_err(|e| GateError::Transfer(format!("cannot hold {total} chunks: {e}")))?;
        slots.resize(total, None);
        Ok(Self { slots, filled: 0 })
    }
}

/// An upload whose every chunk has arrived. It has already left the table.
#[derive(Debug)]
pub struct CompletedUpload {
    key: UploadKey,
    chunks: Vec<Vec<u8>>,
}

impl CompletedUpload {
    /// Destination directory joined with the filename.
    pub fn remote_path(&self) -> String {
        join_path(&self.key.path, &self.key.filename)
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate the chunks in index order.
    pub fn into_bytes(self) -> Vec<u8> {
        self.chunks.concat()
    }
}

/// Pending assemblies for all sockets.
pub struct UploadTable {
    pending: Mutex<HashMap<UploadKey, Assembly>>,
    max_chunks: usize,
}

impl UploadTable {
    /// `max_chunks` caps `totalChunks` for any one upload.
    pub fn new(max_chunks: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_chunks: max_chunks.max(1),
        }
    }

    /// Store one chunk.
    ///
    /// A repeated index replaces the earlier bytes without counting twice.
    /// The call that fills the last empty slot removes the assembly under
    /// the same lock and gets it back; every other call gets `None`.
    pub async fn store(
        &self,
        key: UploadKey,
        chunk_index: usize,
        total_chunks: usize,
        bytes: Vec<u8>,
    ) -> GateResult<Option<CompletedUpload>> {
        if total_chunks == 0 {
            return Err(GateError::Transfer("totalChunks must be at least 1".into()));
        }
        if total_chunks > self.max_chunks {
            return Err(GateError::Transfer(format!(
                "totalChunks={total_chunks} exceeds the limit of {}",
                self.max_chunks
            )));
        }
        if chunk_index >= total_chunks {
            return Err(GateError::Transfer(format!(
                "chunk index {chunk_index} out of range for {total_chunks} chunks"
            )));
        }

        let mut pending = self.pending.lock().await;
        let assembly = match pending.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Assembly::new(total_chunks)?),
        };

        if assembly.slots.len() != total_chunks {
            return Err(GateError::Transfer(format!(
                "{} was started with {} chunks, got totalChunks={total_chunks}",
                key.filename,
                assembly.slots.len()
            )));
        }

        let slot = &mut assembly.slots[chunk_index];
        if slot.is_none() {
            assembly.filled += 1;
        } else {
            debug!(filename = %key.filename, chunk_index, "duplicate chunk replaces earlier copy");
        }
        *slot = Some(bytes);

        if assembly.filled < total_chunks {
            return Ok(None);
        }

        let Some(done) = pending.remove(&key) else {
            return Ok(None);
        };
        info!(filename = %key.filename, chunks = total_chunks, "upload assembled");
        Ok(Some(CompletedUpload {
            chunks: done.slots.into_iter().map(Option::unwrap_or_default).collect(),
            key,
        }))
    }

    /// Drop every assembly started by `socket_id`. Returns how many went.
    pub async fn purge_socket(&self, socket_id: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|key, _| key.socket_id != socket_id);
        let removed = before - pending.len();
        if removed > 0 {
            info!(socket_id, removed, "purged unfinished uploads");
        }
        removed
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
