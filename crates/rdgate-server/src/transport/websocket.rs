//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the upgrade, and captures the request's
//! query string so the session can read its token and setting overrides.

use futures_util::SinkExt;
use rdgate_core::{GatewayError, GatewayResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

pub type WsStream = WebSocketStream<TcpStream>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
    /// Decoded query parameters of the upgrade request, in order.
    pub query: Vec<(String, String)>,
}

impl WebSocketConnection {
    /// Last value of the named query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Bind the listening socket. Failure here is fatal to the process.
pub async fn bind(addr: SocketAddr) -> GatewayResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Transport(format!("WS bind failed on {addr}: {e}")))
}

/// Start accepting upgrades on `listener`.
///
/// Returns the accept task (abort it to stop accepting) and a receiver that
/// yields upgraded connections.
pub fn start_listener(
    listener: TcpListener,
) -> (JoinHandle<()>, mpsc::Receiver<WebSocketConnection>) {
    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match accept(stream, addr).await {
                            Ok(conn) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                if tx.send(conn).await.is_err() {
                                    debug!(remote = %addr, "listener stopped, dropping connection");
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

    (task, rx)
}

/// Perform the WebSocket upgrade on an accepted TCP stream.
pub async fn accept(stream: TcpStream, remote_addr: SocketAddr) -> GatewayResult<WebSocketConnection> {
    let mut query = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_string);
            Ok(resp)
        },
    )
    .await
    .map_err(|e| GatewayError::Transport(format!("WS upgrade failed: {e}")))?;

    Ok(WebSocketConnection {
        ws_stream,
        remote_addr,
        query: parse_query(query.as_deref().unwrap_or_default()),
    })
}

/// Decode an `application/x-www-form-urlencoded` query string.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Build a close frame.
pub fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

/// Refuse a connection that was upgraded but will not get a session.
pub async fn reject(mut conn: WebSocketConnection, code: CloseCode, reason: &str) {
    if let Err(e) = conn.ws_stream.send(close_message(code, reason)).await {
        debug!(remote = %conn.remote_addr, error = %e, "close frame not delivered");
    }
}
