//! One SSH connection and the channels opened on it.

use super::channel_slot::FileChannelSlot;
use super::shell::{self, ShellHandle};
use crate::config::SshSettings;
use crate::handshake::ConnectParams;
use crate::transfer::{RemoteFs, SftpChannel};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::PublicKey;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use sshgate_core::{GateError, GateResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `close` waits for the shell worker to wind down.
const SHELL_STOP_GRACE: Duration = Duration::from_secs(2);

/// What the gateway needs from a connected remote host.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Sender side of the interactive shell.
    fn shell(&self) -> ShellHandle;

    /// Shell output stream. Handed out once; later calls get `None`.
    fn take_shell_output(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// The shared file channel: opened on first use, reused while healthy,
    /// reopened after it breaks.
    async fn file_channel(&self) -> GateResult<Arc<dyn RemoteFs>>;

    /// A new file channel owned by the caller.
    async fn open_file_channel(&self) -> GateResult<Arc<dyn RemoteFs>>;

    /// Run a command and return its stdout.
    async fn exec(&self, command: &str) -> GateResult<String>;

    /// Release file channel, shell and transport, in that order. Safe to
    /// call more than once.
    async fn close(&self);
}

/// Host key checks are out of scope; every key is accepted.
struct ClientHandler {
    target: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        debug!(host = %self.target, algorithm = %key.algorithm(), "accepting host key");
        Ok(true)
    }
}

/// A live SSH session backed by russh.
pub struct RemoteSession {
    handle: Handle<ClientHandler>,
    target: String,
    exec_timeout: Duration,
    shell: ShellHandle,
    shell_output: StdMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    shell_task: StdMutex<Option<JoinHandle<()>>>,
    file_channel: FileChannelSlot,
    closed: AtomicBool,
}

impl RemoteSession {
    /// Connect, authenticate with the password and start a PTY shell.
    pub async fn open(params: &ConnectParams, settings: &SshSettings) -> GateResult<Self> {
        let target = params.target();
        let config = Arc::new(client::Config {
            keepalive_interval: Some(settings.keepalive_interval),
            ..Default::default()
        });
        let handler = ClientHandler {
            target: target.clone(),
        };

        let connect = client::connect(config, (params.host.as_str(), params.port), handler);
        let mut handle = tokio::time::timeout(settings.connect_timeout, connect)
            .await
            .map_err(|_| {
                GateError::ConnectFailed(format!(
                    "timed out after {}s connecting to {}:{}",
                    settings.connect_timeout.as_secs(),
                    params.host,
                    params.port
                ))
            })?
            .map_err(|e| GateError::ConnectFailed(format!("{}:{}: {e}", params.host, params.port)))?;

        let auth = handle
            .authenticate_password(params.user.as_str(), params.password.as_str())
            .await
            .map_err(|e| GateError::AuthFailed(e.to_string()))?;
        if !auth.success() {
            return Err(GateError::AuthFailed(format!(
                "password rejected for {}",
                params.user
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| GateError::Channel(format!("open shell channel: {e}")))?;
        let (cols, rows) = (settings.initial_cols, settings.initial_rows);
        channel
            .request_pty(
                false,
                &settings.term,
                cols,
                rows,
                cols.saturating_mul(settings.pixel_cell),
                rows.saturating_mul(settings.pixel_cell),
                &[],
            )
            .await
            .map_err(|e| GateError::Channel(format!("request pty: {e}")))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| GateError::Channel(format!("request shell: {e}")))?;

        let (shell, output, task) = shell::spawn(channel);
        info!(host = %target, "remote session open");

        Ok(Self {
            handle,
            target,
            exec_timeout: settings.exec_timeout,
            shell,
            shell_output: StdMutex::new(Some(output)),
            shell_task: StdMutex::new(Some(task)),
            file_channel: FileChannelSlot::new(),
            closed: AtomicBool::new(false),
        })
    }

    async fn open_sftp(&self) -> GateResult<Arc<dyn RemoteFs>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| GateError::Channel(format!("open sftp channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| GateError::Channel(format!("request sftp subsystem: {e}")))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| GateError::Channel(format!("sftp init: {e}")))?;
        debug!(host = %self.target, "sftp channel opened");
        Ok(Arc::new(SftpChannel::new(session)))
    }
}

#[async_trait]
impl RemoteHost for RemoteSession {
    fn shell(&self) -> ShellHandle {
        self.shell.clone()
    }

    fn take_shell_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.shell_output.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn file_channel(&self) -> GateResult<Arc<dyn RemoteFs>> {
        self.file_channel.get_or_open(|| self.open_sftp()).await
    }

    async fn open_file_channel(&self) -> GateResult<Arc<dyn RemoteFs>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GateError::Channel("session closed".into()));
        }
        self.open_sftp().await
    }

    async fn exec(&self, command: &str) -> GateResult<String> {
        let run = async {
            let mut channel = self.handle.channel_open_session().await?;
            channel.exec(true, command).await?;
            let mut stdout = Vec::new();
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            Ok::<_, russh::Error>(stdout)
        };

        let stdout = tokio::time::timeout(self.exec_timeout, run)
            .await
            .map_err(|_| GateError::Timeout)?
            .map_err(|e| GateError::Channel(format!("exec: {e}")))?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(fs) = self.file_channel.close().await {
            if let Err(e) = fs.close().await {
                warn!(host = %self.target, error = %e, "file channel close failed");
            }
        }

        self.shell.close().await;
        let task = self.shell_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if tokio::time::timeout(SHELL_STOP_GRACE, task).await.is_err() {
                warn!(host = %self.target, "shell worker did not stop in time");
            }
        }

        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(host = %self.target, error = %e, "ssh disconnect failed");
        }
        info!(host = %self.target, "remote session closed");
    }
}
