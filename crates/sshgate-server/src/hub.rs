//! Per-socket gateway hub.
//!
//! A hub binds one browser websocket to one [`RemoteHost`]. It decodes
//! inbound frames and routes them to the shell, the transfer engine or the
//! telemetry task. Everything bound for the browser funnels through one
//! outbound queue drained by a single writer task, so frames never
//! interleave.
//!
//! Listing and download requests run one at a time on a transfer worker
//! that reuses the session's shared file channel. Each completed upload is
//! written on its own task over a fresh file channel.

use crate::config::MonitorSettings;
use crate::monitor::MonitorHandle;
use crate::session::{RemoteHost, SessionId, SessionRegistry, ShellHandle};
use crate::transfer::{CompletedUpload, TransferEngine};
use crate::transport::websocket;
use futures_util::{Sink, SinkExt, StreamExt};
use sshgate_core::codec::{self, Inbound, Utf8Decoder};
use sshgate_core::{ClientMessage, GateError, GateResult, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Outbound frames waiting for the socket writer.
const OUTBOUND_QUEUE: usize = 256;
/// Listing/download requests waiting for the transfer worker.
const TRANSFER_QUEUE: usize = 32;
/// How long teardown waits for queued frames to reach the socket.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Shared services a hub needs besides its own session.
#[derive(Clone)]
pub struct HubContext {
    pub registry: Arc<SessionRegistry>,
    pub engine: TransferEngine,
    pub monitor: MonitorSettings,
    /// Pixels per character cell reported with resizes.
    pub pixel_cell: u32,
}

enum TransferJob {
    List { path: Option<String> },
    Download { paths: Vec<String> },
}

pub struct GatewayHub {
    session_id: SessionId,
    host: Arc<dyn RemoteHost>,
    ctx: HubContext,
}

impl GatewayHub {
    pub fn new(session_id: SessionId, host: Arc<dyn RemoteHost>, ctx: HubContext) -> Self {
        Self {
            session_id,
            host,
            ctx,
        }
    }

    /// Serve the socket until the browser leaves, the shell ends or the
    /// server shuts down. Always tears the session down before returning.
    pub async fn run<T>(self, ws: WebSocketStream<T>, mut shutdown: broadcast::Receiver<()>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut inbound) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
        let mut writer = tokio::spawn(write_outbound(sink, out_rx));

        let mut shell_pump = tokio::spawn(pump_shell(self.host.take_shell_output(), out_tx.clone()));

        let (transfer_tx, transfer_rx) = mpsc::channel(TRANSFER_QUEUE);
        let transfer_worker = tokio::spawn(run_transfers(
            self.host.clone(),
            self.ctx.engine.clone(),
            transfer_rx,
            out_tx.clone(),
        ));

        let mut dispatcher = Dispatcher {
            session_id: self.session_id.clone(),
            host: self.host.clone(),
            engine: self.ctx.engine.clone(),
            pixel_cell: self.ctx.pixel_cell,
            shell: self.host.shell(),
            monitor: MonitorHandle::new(self.host.clone(), self.ctx.monitor, out_tx.clone()),
            out: out_tx,
            transfers: transfer_tx,
            uploads: JoinSet::new(),
        };
        let mut writer_done = false;

        info!(session_id = %self.session_id, "gateway hub running");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("shutdown signal received, notifying browser");
                    let _ = dispatcher.out.send(ServerMessage::error("server shutting down")).await;
                    break;
                }
                _ = &mut shell_pump => {
                    info!(session_id = %self.session_id, "shell stream ended");
                    break;
                }
                _ = &mut writer => {
                    debug!("socket writer stopped");
                    writer_done = true;
                    break;
                }
                frame = websocket::ws_recv_text(&mut inbound) => match frame {
                    Ok(Some(text)) => {
                        if let Err(e) = dispatcher.dispatch(&text).await {
                            if e.is_session_fatal() {
                                warn!(session_id = %self.session_id, error = %e, "session failed");
                                break;
                            }
                            let _ = dispatcher.out.send(ServerMessage::error(e.to_string())).await;
                        }
                    }
                    Ok(None) => {
                        debug!("browser closed the socket");
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "socket read failed");
                        break;
                    }
                },
            }
        }

        self.teardown(dispatcher, transfer_worker, shell_pump).await;

        // The writer drains what is still queued, then closes the socket.
        if !writer_done && tokio::time::timeout(FLUSH_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
    }

    async fn teardown(
        &self,
        mut dispatcher: Dispatcher,
        transfer_worker: JoinHandle<()>,
        shell_pump: JoinHandle<()>,
    ) {
        dispatcher.monitor.stop().await;

        transfer_worker.abort();
        let _ = transfer_worker.await;
        dispatcher.uploads.shutdown().await;

        self.host.close().await;
        shell_pump.abort();

        let purged = self.ctx.engine.uploads().purge_socket(&self.session_id).await;
        if purged > 0 {
            debug!(purged, "dropped unfinished uploads");
        }
        if let Err(e) = self.ctx.registry.remove(&self.session_id).await {
            debug!(error = %e, "session already unregistered");
        }
        info!(session_id = %self.session_id, "gateway hub closed");
    }
}

/// Routes decoded frames for one socket.
struct Dispatcher {
    session_id: SessionId,
    host: Arc<dyn RemoteHost>,
    engine: TransferEngine,
    pixel_cell: u32,
    shell: ShellHandle,
    out: mpsc::Sender<ServerMessage>,
    transfers: mpsc::Sender<TransferJob>,
    uploads: JoinSet<()>,
    monitor: MonitorHandle,
}

impl Dispatcher {
    /// Handle one text frame. Errors that are not session-fatal are
    /// reported to the browser by the caller.
    async fn dispatch(&mut self, text: &str) -> GateResult<()> {
        let msg = match codec::decode(text) {
            Ok(Inbound::Message(msg)) => msg,
            Ok(Inbound::Unknown(kind)) => {
                debug!(kind = %kind, "ignoring unknown message type");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "undecodable frame");
                return Err(e);
            }
        };

        match msg {
            ClientMessage::Data { payload } => self.shell.write(payload.into_bytes()).await,
            ClientMessage::Resize { cols, rows } => {
                if cols == 0 || rows == 0 {
                    return Err(GateError::InvalidMessage(format!(
                        "invalid terminal size {cols}x{rows}"
                    )));
                }
                self.shell.resize(cols, rows, self.pixel_cell).await
            }
            ClientMessage::SftpList { path } => self.queue(TransferJob::List { path }).await,
            ClientMessage::SftpDownload { paths } => {
                self.queue(TransferJob::Download { paths }).await
            }
            ClientMessage::SftpUploadChunk {
                path,
                filename,
                chunk_index,
                total_chunks,
                content,
            } => {
                let stored = self
                    .engine
                    .accept_chunk(
                        &self.session_id,
                        &path,
                        &filename,
                        chunk_index,
                        total_chunks,
                        &content,
                    )
                    .await;
                let reply = match stored {
                    Ok(None) => ServerMessage::SftpUploadChunkSuccess {
                        chunk_index,
                        total_chunks,
                    },
                    Ok(Some(upload)) => {
                        self.finish_upload(upload);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(error = %e, filename = %filename, "upload chunk rejected");
                        ServerMessage::sftp_error(e.to_string())
                    }
                };
                self.send(reply).await
            }
            ClientMessage::MonitorStart => {
                self.monitor.start();
                Ok(())
            }
            ClientMessage::MonitorStop => {
                self.monitor.stop().await;
                Ok(())
            }
            ClientMessage::Unknown => {
                debug!("ignoring unknown message type");
                Ok(())
            }
        }
    }

    async fn queue(&self, job: TransferJob) -> GateResult<()> {
        self.transfers
            .send(job)
            .await
            .map_err(|_| GateError::Transport("transfer worker stopped".into()))
    }

    async fn send(&self, msg: ServerMessage) -> GateResult<()> {
        self.out
            .send(msg)
            .await
            .map_err(|_| GateError::Transport("socket writer stopped".into()))
    }

    /// Write a finished upload over its own file channel.
    fn finish_upload(&mut self, upload: CompletedUpload) {
        let host = self.host.clone();
        let engine = self.engine.clone();
        let out = self.out.clone();
        self.uploads.spawn(async move {
            let written = async {
                let fs = host.open_file_channel().await?;
                let result = engine.finalize(fs.as_ref(), upload, &out).await;
                if let Err(e) = fs.close().await {
                    debug!(error = %e, "upload channel close failed");
                }
                result
            }
            .await;
            let reply = written.unwrap_or_else(|e| {
                warn!(error = %e, "upload failed");
                ServerMessage::sftp_error(format!("Upload failed: {e}"))
            });
            let _ = out.send(reply).await;
        });
        // Reap uploads that already finished.
        while self.uploads.try_join_next().is_some() {}
    }
}

/// Serialized listing and download work on the shared file channel.
async fn run_transfers(
    host: Arc<dyn RemoteHost>,
    engine: TransferEngine,
    mut jobs: mpsc::Receiver<TransferJob>,
    out: mpsc::Sender<ServerMessage>,
) {
    while let Some(job) = jobs.recv().await {
        let result = async {
            let fs = host.file_channel().await?;
            match job {
                TransferJob::List { path } => engine.list(fs.as_ref(), path.as_deref()).await,
                TransferJob::Download { paths } => engine.download(fs.as_ref(), &paths).await,
            }
        }
        .await;

        let reply = result.unwrap_or_else(|e| {
            warn!(error = %e, "file operation failed");
            ServerMessage::sftp_error(e.to_string())
        });
        if out.send(reply).await.is_err() {
            break;
        }
    }
}

/// Forward shell output as terminal text, in read order.
async fn pump_shell(output: Option<mpsc::Receiver<Vec<u8>>>, out: mpsc::Sender<ServerMessage>) {
    let Some(mut output) = output else {
        warn!("shell output already claimed");
        return;
    };
    let mut decoder = Utf8Decoder::new();
    while let Some(bytes) = output.recv().await {
        let payload = decoder.decode(&bytes);
        if payload.is_empty() {
            continue;
        }
        if out.send(ServerMessage::TerminalData { payload }).await.is_err() {
            return;
        }
    }
    let payload = decoder.finish();
    if !payload.is_empty() {
        let _ = out.send(ServerMessage::TerminalData { payload }).await;
    }
}

/// Drain the outbound queue onto the socket, then close it.
async fn write_outbound<S>(mut sink: S, mut queue: mpsc::Receiver<ServerMessage>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = queue.recv().await {
        let text = match codec::encode(&msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = websocket::ws_send_text(&mut sink, text).await {
            debug!(error = %e, "socket write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ShellInput;
    use crate::testing::{FakeHost, MemFs};
    use crate::transfer::UploadTable;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::{json, Value};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        client: WebSocketStream<DuplexStream>,
        hub: JoinHandle<()>,
        registry: Arc<SessionRegistry>,
        uploads: Arc<UploadTable>,
        shutdown: broadcast::Sender<()>,
    }

    async fn start(host: Arc<FakeHost>) -> Harness {
        let registry = Arc::new(SessionRegistry::new(8));
        let uploads = Arc::new(UploadTable::new(1024));
        let session_id = registry.insert(host.clone()).await.unwrap();
        let ctx = HubContext {
            registry: registry.clone(),
            engine: TransferEngine::new(uploads.clone(), 1024),
            monitor: MonitorSettings {
                interval: Duration::from_secs(3),
                sample_gap: Duration::from_secs(1),
            },
            pixel_cell: 8,
        };

        let (server_io, client_io) = tokio::io::duplex(1 << 20);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let hub = tokio::spawn(GatewayHub::new(session_id, host, ctx).run(server_ws, shutdown_rx));
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        Harness {
            client,
            hub,
            registry,
            uploads,
            shutdown,
        }
    }

    impl Harness {
        async fn send(&mut self, frame: Value) {
            self.client
                .send(Message::Text(frame.to_string().into()))
                .await
                .unwrap();
        }

        /// Next frame, or `None` once the hub closed the socket.
        async fn next(&mut self) -> Option<Value> {
            loop {
                let msg = tokio::time::timeout(WAIT, self.client.next())
                    .await
                    .expect("hub went quiet");
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        return Some(serde_json::from_str(&text).unwrap())
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                    Some(Ok(_)) => continue,
                }
            }
        }

        async fn recv(&mut self) -> Value {
            self.next().await.expect("socket closed")
        }

        /// Skip frames until one of `kind` arrives.
        async fn recv_type(&mut self, kind: &str) -> Value {
            loop {
                let frame = self.recv().await;
                if frame["type"] == kind {
                    return frame;
                }
            }
        }

        async fn finished(self) {
            tokio::time::timeout(WAIT, self.hub)
                .await
                .expect("hub did not stop")
                .unwrap();
        }
    }

    fn home_host() -> Arc<FakeHost> {
        let fs = Arc::new(MemFs::new("/home/u"));
        fs.add_file("/home/u/file.txt", b"hello");
        fs.add_file("/home/u/dir1/a.txt", b"a");
        fs.add_file("/home/u/dir1/sub/b.txt", b"bb");
        FakeHost::builder().fs(fs).build()
    }

    #[tokio::test]
    async fn listing_home_directory() {
        let mut h = start(home_host()).await;
        h.send(json!({"type": "sftp_list", "path": "."})).await;

        let frame = h.recv().await;
        assert_eq!(frame["type"], "sftp_list_response");
        assert_eq!(frame["path"], "/home/u");
        let files = frame["files"].as_array().unwrap();
        assert_eq!(files[0]["name"], "..");
        assert_eq!(files[0]["path"], "/home");
        let names: Vec<&str> = files.iter().map(|f| f["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["..", "dir1", "file.txt"]);
    }

    #[tokio::test]
    async fn single_file_download_is_raw() {
        let mut h = start(home_host()).await;
        h.send(json!({"type": "sftp_download", "paths": ["/home/u/file.txt"]}))
            .await;

        let frame = h.recv().await;
        assert_eq!(frame["type"], "sftp_download_response");
        assert_eq!(frame["filename"], "file.txt");
        let bytes = BASE64.decode(frame["content"].as_str().unwrap()).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn mixed_download_is_zipped() {
        let mut h = start(home_host()).await;
        h.send(json!({
            "type": "sftp_download",
            "paths": ["/home/u/dir1", "/home/u/file.txt"],
        }))
        .await;

        let frame = h.recv().await;
        assert_eq!(frame["filename"], "download.zip");
        let bytes = BASE64.decode(frame["content"].as_str().unwrap()).unwrap();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["dir1/", "dir1/a.txt", "dir1/sub/", "dir1/sub/b.txt", "file.txt"]
        );
    }

    #[tokio::test]
    async fn missing_path_reports_sftp_error() {
        let mut h = start(home_host()).await;
        h.send(json!({"type": "sftp_list", "path": "/nope"})).await;
        assert_eq!(h.recv().await["type"], "sftp_error");

        // The session keeps working afterwards.
        h.send(json!({"type": "sftp_list"})).await;
        assert_eq!(h.recv().await["type"], "sftp_list_response");
    }

    #[tokio::test]
    async fn out_of_order_upload_is_assembled_once() {
        let host = home_host();
        let mut h = start(host.clone()).await;

        for (index, part) in [(2, "C"), (0, "A"), (1, "B")] {
            h.send(json!({
                "type": "sftp_upload_chunk",
                "path": "/home/u",
                "filename": "up.txt",
                "chunkIndex": index,
                "totalChunks": 3,
                "content": BASE64.encode(part),
            }))
            .await;
        }

        let mut acks = Vec::new();
        let mut progress = Vec::new();
        let final_frame = loop {
            let frame = h.recv().await;
            match frame["type"].as_str().unwrap() {
                "sftp_upload_chunk_success" => acks.push(frame["chunkIndex"].as_u64().unwrap()),
                "sftp_remote_progress" => progress.push(frame["progress"].as_u64().unwrap()),
                "sftp_upload_final_success" => break frame,
                other => panic!("unexpected frame {other}"),
            }
        };

        assert_eq!(acks, vec![2, 0]);
        assert_eq!(progress.last(), Some(&100));
        assert_eq!(final_frame["path"], "/home/u/up.txt");
        assert_eq!(host.fs().file("/home/u/up.txt").unwrap(), b"ABC");
        assert_eq!(host.fresh_channels(), 1);
        assert_eq!(h.uploads.pending_count().await, 0);
    }

    #[tokio::test]
    async fn bad_upload_chunk_is_an_sftp_error() {
        let mut h = start(home_host()).await;
        h.send(json!({
            "type": "sftp_upload_chunk",
            "path": "/home/u",
            "filename": "../escape",
            "chunkIndex": 0,
            "totalChunks": 1,
            "content": "QQ==",
        }))
        .await;
        assert_eq!(h.recv().await["type"], "sftp_error");
    }

    #[tokio::test]
    async fn huge_chunk_count_is_refused_and_session_survives() {
        let host = home_host();
        let mut h = start(host.clone()).await;
        h.send(json!({
            "type": "sftp_upload_chunk",
            "path": "/home/u",
            "filename": "big.bin",
            "chunkIndex": 0,
            "totalChunks": 1u64 << 62,
            "content": "QQ==",
        }))
        .await;
        let frame = h.recv().await;
        assert_eq!(frame["type"], "sftp_error");
        assert!(frame["message"].as_str().unwrap().contains("exceeds"));
        assert_eq!(h.uploads.pending_count().await, 0);

        h.send(json!({"type": "sftp_list"})).await;
        assert_eq!(h.recv().await["type"], "sftp_list_response");
        assert_eq!(host.close_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_start_and_stop() {
        let mut h = start(home_host()).await;

        // Stopping before starting is silent.
        h.send(json!({"type": "monitor_stop"})).await;
        h.send(json!({"type": "sftp_list"})).await;
        assert_eq!(h.recv().await["type"], "sftp_list_response");

        h.send(json!({"type": "monitor_start"})).await;
        let update = h.recv().await;
        assert_eq!(update["type"], "monitor_update");
        assert!(update["payload"]["systemStats"].is_object());

        h.send(json!({"type": "monitor_stop"})).await;
        h.send(json!({"type": "sftp_list"})).await;
        h.recv_type("sftp_list_response").await;

        let quiet = tokio::time::timeout(Duration::from_secs(30), h.client.next()).await;
        assert!(quiet.is_err(), "telemetry kept flowing after stop");
    }

    #[tokio::test]
    async fn keystrokes_and_resizes_reach_the_shell() {
        let host = home_host();
        let mut input = host.take_shell_input();
        let mut h = start(host).await;

        h.send(json!({"type": "data", "payload": "ls\r"})).await;
        h.send(json!({"type": "resize", "cols": 120, "rows": 40})).await;

        assert_eq!(input.recv().await, Some(ShellInput::Data(b"ls\r".to_vec())));
        assert_eq!(
            input.recv().await,
            Some(ShellInput::Resize {
                cols: 120,
                rows: 40,
                pixel_width: 960,
                pixel_height: 320,
            })
        );

        h.send(json!({"type": "resize", "cols": 0, "rows": 40})).await;
        assert_eq!(h.recv().await["type"], "error");
    }

    #[tokio::test]
    async fn split_utf8_output_arrives_whole() {
        let host = home_host();
        let mut h = start(host.clone()).await;

        host.print(&[b'a', 0xE2, 0x82]).await;
        host.print(&[0xAC, b'!']).await;

        let mut text = String::new();
        while text.len() < "a€!".len() {
            let frame = h.recv_type("terminal_data").await;
            text.push_str(frame["payload"].as_str().unwrap());
        }
        assert_eq!(text, "a€!");
    }

    #[tokio::test]
    async fn bad_frames_do_not_end_the_session() {
        let mut h = start(home_host()).await;

        h.send(json!({"type": "ping"})).await;
        h.client
            .send(Message::Text("{not json".to_string().into()))
            .await
            .unwrap();
        assert_eq!(h.recv().await["type"], "error");

        h.send(json!({"type": "sftp_list"})).await;
        assert_eq!(h.recv().await["type"], "sftp_list_response");
    }

    #[tokio::test]
    async fn browser_close_tears_everything_down() {
        let host = home_host();
        let mut h = start(host.clone()).await;

        h.send(json!({
            "type": "sftp_upload_chunk",
            "path": "/home/u",
            "filename": "half.txt",
            "chunkIndex": 0,
            "totalChunks": 2,
            "content": "QQ==",
        }))
        .await;
        assert_eq!(h.recv().await["type"], "sftp_upload_chunk_success");
        assert_eq!(h.uploads.pending_count().await, 1);

        h.client.close(None).await.unwrap();
        let registry = h.registry.clone();
        let uploads = h.uploads.clone();
        h.finished().await;

        assert_eq!(host.close_count(), 1);
        assert_eq!(registry.count().await, 0);
        assert_eq!(uploads.pending_count().await, 0);
    }

    #[tokio::test]
    async fn shell_exit_closes_the_socket() {
        let host = home_host();
        let mut h = start(host.clone()).await;

        host.print(b"logout\r\n").await;
        host.hang_up();

        assert_eq!(h.recv().await["payload"], "logout\r\n");
        assert!(h.next().await.is_none());
        let registry = h.registry.clone();
        h.finished().await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn server_shutdown_notifies_browser() {
        let mut h = start(home_host()).await;
        h.shutdown.send(()).unwrap();

        let frame = h.recv().await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["payload"], "server shutting down");
        assert!(h.next().await.is_none());
        h.finished().await;
    }
}
