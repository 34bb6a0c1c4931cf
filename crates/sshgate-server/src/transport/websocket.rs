//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts plain TCP or TLS connections, performs the websocket upgrade and
//! keeps the query string of the upgrade request, which carries the SSH
//! connection parameters.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sshgate_core::{GateError, GateResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Any byte stream a websocket can run over (plain TCP or TLS).
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// Websocket over a boxed transport.
pub type GatewayStream = WebSocketStream<Box<dyn IoStream>>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: GatewayStream,
    pub remote_addr: SocketAddr,
    /// Query string of the upgrade request, without the `?`.
    pub query: String,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    max_frame_bytes: usize,
) -> GateResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, tls = tls.is_some(), "WebSocket listener started");

    let acceptor = tls.map(TlsAcceptor::from);
    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match accept(stream, acceptor, max_frame_bytes).await {
                            Ok((ws_stream, query)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    query,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

async fn accept(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    max_frame_bytes: usize,
) -> GateResult<(GatewayStream, String)> {
    let io: Box<dyn IoStream> = match acceptor {
        Some(acceptor) => Box::new(
            acceptor
                .accept(stream)
                .await
                .map_err(|e| GateError::Transport(format!("TLS handshake failed: {e}")))?,
        ),
        None => Box::new(stream),
    };

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_bytes);
    config.max_frame_size = Some(max_frame_bytes);

    let mut query = String::new();
    let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().unwrap_or_default().to_string();
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(io, capture_query, Some(config))
        .await
        .map_err(|e| GateError::Transport(format!("WS upgrade failed: {e}")))?;
    Ok((ws, query))
}

/// Helper: send one text frame.
pub async fn ws_send_text<S>(sink: &mut S, text: String) -> GateResult<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| GateError::Transport(format!("WS send failed: {e}")))
}

/// Helper: receive the next text frame.
///
/// Returns `None` if the connection is closed. Binary frames are ignored;
/// pings are answered by tungstenite itself.
pub async fn ws_recv_text<S>(stream: &mut S) -> GateResult<Option<String>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Binary(data))) => {
                debug!(len = data.len(), "ignoring binary frame");
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed)) | None => return Ok(None),
            Some(Err(e)) => {
                return Err(GateError::Transport(format!("WS recv failed: {e}")));
            }
        }
    }
}
