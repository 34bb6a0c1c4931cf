//! The shared file channel of one remote session.

use crate::transfer::RemoteFs;
use sshgate_core::{GateError, GateResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct SlotState {
    current: Option<Arc<dyn RemoteFs>>,
    closed: bool,
}

/// Holds at most one file channel. It is opened on first use, handed out
/// again while healthy, and replaced once it reports itself broken.
#[derive(Default)]
pub struct FileChannelSlot {
    state: Mutex<SlotState>,
}

impl FileChannelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current channel, or a new one from `open`.
    ///
    /// The lock is held while opening, so concurrent callers share one
    /// new channel instead of racing to open several.
    pub async fn get_or_open<F, Fut>(&self, open: F) -> GateResult<Arc<dyn RemoteFs>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GateResult<Arc<dyn RemoteFs>>>,
    {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(GateError::Channel("session closed".into()));
        }
        if let Some(fs) = state.current.as_ref() {
            if !fs.is_broken() {
                return Ok(fs.clone());
            }
            debug!("file channel broken, reopening");
        }
        let fs = open().await?;
        state.current = Some(fs.clone());
        Ok(fs)
    }

    /// Refuse further opens and hand back the live channel, if any, for the
    /// caller to close. Only the first call gets it.
    pub async fn close(&self) -> Option<Arc<dyn RemoteFs>> {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.current.take()
    }
}
