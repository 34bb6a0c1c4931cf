//! Core server: accepts browser sockets and opens one SSH session per socket.
//!
//! Owns the session registry and the upload table shared by every hub, and
//! coordinates shutdown of all live sessions.

use crate::config::ServerConfig;
use crate::handshake::ConnectParams;
use crate::hub::{GatewayHub, HubContext};
use crate::session::{RemoteHost, RemoteSession, SessionRegistry};
use crate::transfer::{TransferEngine, UploadTable};
use crate::transport::websocket::{self, GatewayStream, WebSocketConnection};
use sshgate_core::{codec, GateError, GateResult, ServerMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The gateway server instance.
pub struct GatewayServer {
    config: ServerConfig,
    /// Live SSH sessions, one per connected socket.
    sessions: Arc<SessionRegistry>,
    /// Partial uploads from every socket.
    uploads: Arc<UploadTable>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new(config.max_sessions)),
            uploads: Arc::new(UploadTable::new(config.max_upload_chunks)),
            shutdown_tx: broadcast::channel(1).0,
            config,
        }
    }

    /// Accept connections until the listener stops.
    pub async fn run(self: Arc<Self>, tls: Option<Arc<rustls::ServerConfig>>) -> GateResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| GateError::Other(format!("invalid address: {e}")))?;

        let tls_enabled = tls.is_some();
        let mut ws_rx = websocket::start_listener(addr, tls, self.config.max_frame_bytes).await?;

        info!(
            addr = %addr,
            tls = tls_enabled,
            max_sessions = self.config.max_sessions,
            "sshgate-server ready"
        );

        while let Some(conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_connection(conn).await {
                    warn!(error = %e, "gateway connection error");
                }
            });
        }

        info!("listener closed, shutting down");
        self.shutdown().await;
        Ok(())
    }

    /// Tell every hub to stop, then close whatever sessions remain.
    pub async fn shutdown(&self) {
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());
        let closed = self.sessions.close_all().await;
        if closed > 0 {
            info!(closed, "remote sessions closed");
        }
    }

    async fn handle_connection(&self, conn: WebSocketConnection) -> GateResult<()> {
        let WebSocketConnection {
            mut ws_stream,
            remote_addr,
            query,
        } = conn;

        let params = match ConnectParams::from_query(&query) {
            Ok(params) => params,
            Err(e) => {
                reject(&mut ws_stream, &e).await;
                return Err(e);
            }
        };

        if !self.sessions.has_capacity().await {
            let e = GateError::Other("server is at its session limit".into());
            reject(&mut ws_stream, &e).await;
            return Err(e);
        }

        info!(remote = %remote_addr, host = %params.target(), "opening remote session");
        let host: Arc<dyn RemoteHost> = match RemoteSession::open(&params, &self.config.ssh).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                reject(&mut ws_stream, &e).await;
                return Err(e);
            }
        };

        let session_id = match self.sessions.insert(host.clone()).await {
            Ok(id) => id,
            Err(e) => {
                host.close().await;
                reject(&mut ws_stream, &e).await;
                return Err(e);
            }
        };

        let ctx = HubContext {
            registry: self.sessions.clone(),
            engine: TransferEngine::new(self.uploads.clone(), self.config.write_chunk),
            monitor: self.config.monitor,
            pixel_cell: self.config.ssh.pixel_cell,
        };
        GatewayHub::new(session_id, host, ctx)
            .run(ws_stream, self.shutdown_tx.subscribe())
            .await;
        let active = self.sessions.count().await;
        debug!(remote = %remote_addr, active, "gateway connection finished");
        Ok(())
    }
}

/// Report a setup failure to the browser and close the socket.
async fn reject(ws: &mut GatewayStream, error: &GateError) {
    if let Ok(text) = codec::encode(&ServerMessage::error(error.to_string())) {
        let _ = websocket::ws_send_text(ws, text).await;
    }
    let _ = ws.close(None).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    fn assert_send<T: Send>(_: &T) {}

    async fn connection(
        query: &str,
    ) -> (WebSocketConnection, WebSocketStream<tokio::io::DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let io: Box<dyn websocket::IoStream> = Box::new(server_io);
        let conn = WebSocketConnection {
            ws_stream: WebSocketStream::from_raw_socket(io, Role::Server, None).await,
            remote_addr: "127.0.0.1:9".parse().unwrap(),
            query: query.to_string(),
        };
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (conn, client)
    }

    #[tokio::test]
    async fn connection_task_can_be_spawned() {
        let server = Arc::new(GatewayServer::new(ServerConfig::default()));
        let (conn, _client) = connection("").await;
        let fut = server.handle_connection(conn);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn bad_query_is_rejected_with_error_frame() {
        let server = Arc::new(GatewayServer::new(ServerConfig::default()));
        let (conn, mut client) = connection("user=u&password=p").await;

        let srv = server.clone();
        let task = tokio::spawn(async move { srv.handle_connection(conn).await });

        let Some(Ok(Message::Text(text))) = client.next().await else {
            panic!("expected an error frame");
        };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], "error");
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_))) | None));

        assert!(task.await.unwrap().is_err());
        assert_eq!(server.sessions.count().await, 0);
    }
}
