//! Client session: one per accepted WebSocket.
//!
//! Decrypts the token, computes the effective settings, opens the backend
//! connection and then relays in both directions until one side closes, the
//! client goes idle, or the server shuts down.

use crate::backend::{self, BackendConfig, BackendEvent, BackendHandle, ACTIVITY_CHECK_INTERVAL};
use crate::events::LifecycleObserver;
use crate::processor::SettingsProcessor;
use crate::registry::SessionRegistry;
use crate::transport::websocket::{close_message, WebSocketConnection, WsStream};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rdgate_core::{GatewayError, GatewayResult, Instruction, Leg, ProtocolTable, TokenCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Query parameter carrying the encrypted connection token.
pub const TOKEN_PARAM: &str = "token";

/// Upper bound on each WebSocket write made while closing.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a session needs from the server, shared by all sessions.
pub struct GatewayContext {
    pub codec: Arc<TokenCodec>,
    pub protocols: Arc<ProtocolTable>,
    pub processor: Arc<dyn SettingsProcessor>,
    pub observer: Arc<dyn LifecycleObserver>,
    pub registry: Arc<SessionRegistry>,
    pub backend: BackendConfig,
    /// Close the session if the client sends nothing for this long.
    pub max_inactivity: Option<Duration>,
    /// Query parameter naming the client-declared resource.
    pub resource_param: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Closed,
}

/// Why a session ended.
#[derive(Debug)]
enum CloseCause {
    ClientClosed,
    BackendClosed,
    Shutdown,
    Failed(GatewayError),
}

struct ClientSession {
    id: u64,
    ctx: Arc<GatewayContext>,
    remote_addr: SocketAddr,
    resource: Option<String>,
    sink: SplitSink<WsStream, Message>,
    backend: Option<BackendHandle>,
    state: SessionState,
    last_activity: Instant,
}

/// Drive one session to completion.
///
/// The caller registers the session under `id` before spawning this; the
/// session removes itself from the registry when it closes. A message on
/// `close_rx` forces a shutdown close.
pub async fn run(
    ctx: Arc<GatewayContext>,
    id: u64,
    conn: WebSocketConnection,
    mut close_rx: mpsc::Receiver<()>,
) {
    let resource = conn.query_param(&ctx.resource_param).map(str::to_string);
    ctx.observer.connection_started(id, resource.as_deref());

    let remote_addr = conn.remote_addr;
    let (token, query) = split_token(conn.query);
    let (sink, mut stream) = conn.ws_stream.split();

    let mut session = ClientSession {
        id,
        ctx,
        remote_addr,
        resource,
        sink,
        backend: None,
        state: SessionState::Open,
        last_activity: Instant::now(),
    };
    let cause = session.serve(token, query, &mut stream, &mut close_rx).await;
    session.close(cause).await;
}

fn idle_for(last_activity: Instant, max_inactivity: Option<Duration>) -> bool {
    max_inactivity.is_some_and(|max| last_activity.elapsed() > max)
}

/// Pull the token out of the query; the rest are setting overrides.
fn split_token(query: Vec<(String, String)>) -> (Option<String>, Vec<(String, String)>) {
    let mut token = None;
    let rest = query
        .into_iter()
        .filter_map(|(k, v)| {
            if k == TOKEN_PARAM {
                token = Some(v);
                None
            } else {
                Some((k, v))
            }
        })
        .collect();
    (token, rest)
}

impl ClientSession {
    async fn serve(
        &mut self,
        token: Option<String>,
        query: Vec<(String, String)>,
        stream: &mut SplitStream<WsStream>,
        close_rx: &mut mpsc::Receiver<()>,
    ) -> CloseCause {
        let (events_tx, mut events_rx) = mpsc::channel::<BackendEvent>(64);
        match self.open_backend(token, &query, events_tx) {
            Ok(handle) => self.backend = Some(handle),
            Err(e) => return CloseCause::Failed(e),
        }

        let mut ticker = tokio::time::interval(ACTIVITY_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = close_rx.recv() => return CloseCause::Shutdown,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.forward(text.into_bytes()),
                    Some(Ok(Message::Binary(data))) => self.forward(data),
                    Some(Ok(Message::Close(_))) | None => return CloseCause::ClientClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return CloseCause::Failed(GatewayError::Transport(format!(
                            "WebSocket read failed: {e}"
                        )));
                    }
                },
                event = events_rx.recv() => match event {
                    Some(BackendEvent::Open) => {
                        info!(session_id = self.id, remote = %self.remote_addr, "session open");
                    }
                    Some(BackendEvent::Data(chunk)) => {
                        if let Some(cause) = self.deliver(chunk, close_rx, &mut ticker).await {
                            return cause;
                        }
                    }
                    Some(BackendEvent::Closed(None)) | None => return CloseCause::BackendClosed,
                    Some(BackendEvent::Closed(Some(e))) => return CloseCause::Failed(e),
                },
                _ = ticker.tick() => {
                    if self.idle_expired() {
                        return CloseCause::Failed(GatewayError::InactivityTimeout(Leg::Client));
                    }
                }
            }
        }
    }

    fn open_backend(
        &self,
        token: Option<String>,
        query: &[(String, String)],
        events: mpsc::Sender<BackendEvent>,
    ) -> GatewayResult<BackendHandle> {
        let token = token.ok_or_else(|| {
            GatewayError::TokenDecryption(format!("missing {TOKEN_PARAM} parameter"))
        })?;
        let descriptor = self.ctx.codec.decrypt(&token)?;
        let settings = self.ctx.protocols.merge(
            &descriptor.connection_type,
            &descriptor.connection_settings,
            query,
        )?;
        let settings = self.ctx.processor.process(&descriptor, settings)?;

        debug!(
            session_id = self.id,
            connection_type = %descriptor.connection_type,
            settings = settings.len(),
            "opening backend connection"
        );
        Ok(backend::open(
            self.id,
            self.ctx.backend.clone(),
            descriptor.connection_type,
            settings,
            events,
        ))
    }

    /// Client data goes straight to the backend queue.
    fn forward(&mut self, data: Vec<u8>) {
        self.last_activity = Instant::now();
        if let Some(backend) = &self.backend {
            if !backend.send(data) {
                debug!(session_id = self.id, "backend gone, dropping client data");
            }
        }
    }

    fn idle_expired(&self) -> bool {
        idle_for(self.last_activity, self.ctx.max_inactivity)
    }

    /// Send backend output to the client. A browser that stops reading
    /// must not stall shutdown or the idle check.
    async fn deliver(
        &mut self,
        chunk: String,
        close_rx: &mut mpsc::Receiver<()>,
        ticker: &mut Interval,
    ) -> Option<CloseCause> {
        let (last_activity, max_inactivity) = (self.last_activity, self.ctx.max_inactivity);
        let send = self.sink.send(Message::Text(chunk));
        tokio::pin!(send);
        loop {
            tokio::select! {
                result = &mut send => {
                    return result.err().map(|e| {
                        CloseCause::Failed(GatewayError::Transport(format!(
                            "WebSocket write failed: {e}"
                        )))
                    });
                }
                _ = close_rx.recv() => return Some(CloseCause::Shutdown),
                _ = ticker.tick() => {
                    if idle_for(last_activity, max_inactivity) {
                        return Some(CloseCause::Failed(GatewayError::InactivityTimeout(
                            Leg::Client,
                        )));
                    }
                }
            }
        }
    }

    /// Best-effort write used while closing; gives up after
    /// [`CLOSE_WRITE_TIMEOUT`].
    async fn send_while_closing(&mut self, msg: Message, what: &str) {
        match tokio::time::timeout(CLOSE_WRITE_TIMEOUT, self.sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session_id = self.id, error = %e, "{what} not delivered"),
            Err(_) => debug!(session_id = self.id, "{what} timed out"),
        }
    }

    async fn close(&mut self, cause: CloseCause) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        let (code, reason) = match &cause {
            CloseCause::ClientClosed => (CloseCode::Normal, "client closed"),
            CloseCause::BackendClosed => (CloseCode::Normal, "backend closed"),
            CloseCause::Shutdown => (CloseCode::Away, "server shutting down"),
            CloseCause::Failed(_) => (CloseCode::Error, "session error"),
        };

        if let CloseCause::Failed(e) = &cause {
            warn!(session_id = self.id, remote = %self.remote_addr, error = %e, "session failed");
            let error = Instruction::new("error", [e.to_string(), e.status_code().to_string()]);
            self.send_while_closing(Message::Text(error.encode()), "error instruction")
                .await;
        } else {
            info!(session_id = self.id, remote = %self.remote_addr, reason, "session closing");
        }

        if let Some(backend) = self.backend.take() {
            backend.close().await;
        }

        self.send_while_closing(close_message(code, reason), "close frame")
            .await;
        let _ = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, self.sink.close()).await;

        self.ctx.registry.remove(self.id).await;
        self.ctx
            .observer
            .connection_ended(self.id, self.resource.as_deref());
    }
}
