//! Interactive shell worker.
//!
//! One task owns the russh shell channel. Keystrokes and geometry changes
//! reach it through an input queue; everything the remote shell prints goes
//! out through an output queue in read order. When the worker ends, the
//! output queue closes and the hub treats that as the end of the session.

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use sshgate_core::{GateError, GateResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Queue depth for keystrokes and resize requests.
const INPUT_QUEUE: usize = 256;
/// Queue depth for shell output chunks.
const OUTPUT_QUEUE: usize = 256;

/// Commands accepted by the shell worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize {
        cols: u32,
        rows: u32,
        pixel_width: u32,
        pixel_height: u32,
    },
    Close,
}

/// Cloneable sender side of a running shell.
#[derive(Debug, Clone)]
pub struct ShellHandle {
    input: mpsc::Sender<ShellInput>,
}

impl ShellHandle {
    pub fn new(input: mpsc::Sender<ShellInput>) -> Self {
        Self { input }
    }

    /// Queue raw bytes for the shell's stdin.
    ///
    /// Fails only when the worker is gone, which means the shell stream is
    /// broken and the session is over.
    pub async fn write(&self, bytes: Vec<u8>) -> GateResult<()> {
        self.input
            .send(ShellInput::Data(bytes))
            .await
            .map_err(|_| GateError::Transport("shell channel closed".into()))
    }

    /// Change the PTY geometry.
    pub async fn resize(&self, cols: u32, rows: u32, pixel_cell: u32) -> GateResult<()> {
        self.input
            .send(ShellInput::Resize {
                cols,
                rows,
                pixel_width: cols.saturating_mul(pixel_cell),
                pixel_height: rows.saturating_mul(pixel_cell),
            })
            .await
            .map_err(|_| GateError::Channel("shell channel closed".into()))
    }

    /// Ask the worker to close the channel. No-op if it already stopped.
    pub async fn close(&self) {
        let _ = self.input.send(ShellInput::Close).await;
    }
}

/// Start the worker for an already-opened shell channel.
pub fn spawn(channel: Channel<Msg>) -> (ShellHandle, mpsc::Receiver<Vec<u8>>, JoinHandle<()>) {
    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
    let task = tokio::spawn(run(channel, input_rx, output_tx));
    (ShellHandle::new(input_tx), output_rx, task)
}

async fn run(
    mut channel: Channel<Msg>,
    mut input: mpsc::Receiver<ShellInput>,
    output: mpsc::Sender<Vec<u8>>,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if output.send(data.to_vec()).await.is_err() {
                        debug!("shell output receiver dropped");
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    info!(exit_status, "remote shell exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("shell channel closed by remote");
                    break;
                }
                Some(_) => {}
            },
            cmd = input.recv() => match cmd {
                Some(ShellInput::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!(error = %e, "shell write failed");
                        break;
                    }
                }
                Some(ShellInput::Resize { cols, rows, pixel_width, pixel_height }) => {
                    if let Err(e) = channel.window_change(cols, rows, pixel_width, pixel_height).await {
                        warn!(error = %e, cols, rows, "PTY resize failed");
                    } else {
                        debug!(cols, rows, "PTY resized");
                    }
                }
                Some(ShellInput::Close) | None => {
                    if let Err(e) = channel.close().await {
                        debug!(error = %e, "shell channel close failed");
                    }
                    break;
                }
            },
        }
    }
}
