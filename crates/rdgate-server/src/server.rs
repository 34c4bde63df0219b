//! Gateway server: accepts WebSocket connections and spawns one session per
//! connection.

use crate::config::GatewayConfig;
use crate::events::{LifecycleObserver, LogObserver, Observers, WebhookObserver};
use crate::processor::{DriveFolder, Passthrough, SettingsProcessor};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{self, GatewayContext};
use crate::transport::websocket::{self, WebSocketConnection};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

/// How long shutdown waits for sessions to finish closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The gateway server.
pub struct GatewayServer {
    ctx: Arc<GatewayContext>,
    max_connections: Option<usize>,
}

impl GatewayServer {
    /// Create a server with explicit collaborators.
    pub fn new(
        config: &GatewayConfig,
        registry: Arc<SessionRegistry>,
        processor: Arc<dyn SettingsProcessor>,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        let ctx = GatewayContext {
            codec: config.token_codec.clone(),
            protocols: Arc::new(config.protocols.clone()),
            processor,
            observer,
            registry,
            backend: config.backend.clone(),
            max_inactivity: config.max_inactivity,
            resource_param: config.resource_param.clone(),
        };
        Self {
            ctx: Arc::new(ctx),
            max_connections: config.max_connections,
        }
    }

    /// Create a server with the collaborators the config asks for.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let processor: Arc<dyn SettingsProcessor> = match &config.drive_root {
            Some(root) => {
                info!(root = %root.display(), "user drive folders enabled");
                Arc::new(DriveFolder::new(root.clone()))
            }
            None => Arc::new(Passthrough),
        };

        let mut observers = Observers::new().with(Arc::new(LogObserver));
        if let Some(url) = &config.webhook_url {
            info!(url = %url, "lifecycle webhook enabled");
            observers = observers.with(Arc::new(WebhookObserver::new(url.clone())));
        }

        Self::new(
            config,
            Arc::new(SessionRegistry::new()),
            processor,
            Arc::new(observers),
        )
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    /// Accept connections on `listener` until `shutdown` resolves, then close
    /// every open session.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, backend = %self.ctx.backend.addr, "gateway listening");
        }
        let (accept_task, mut connections) = websocket::start_listener(listener);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                conn = connections.recv() => match conn {
                    Some(conn) => self.admit(conn).await,
                    None => break,
                },
            }
        }

        accept_task.abort();
        self.close_all().await;
    }

    async fn admit(&self, conn: WebSocketConnection) {
        let registry = &self.ctx.registry;

        if let Some(max) = self.max_connections {
            if registry.len().await >= max {
                warn!(remote = %conn.remote_addr, max, "connection limit reached, rejecting");
                tokio::spawn(websocket::reject(conn, CloseCode::Again, "too many connections"));
                return;
            }
        }

        let id = registry.next_id();
        let (close_tx, close_rx) = mpsc::channel(1);
        registry
            .insert(
                id,
                SessionHandle {
                    close_tx,
                    remote_addr: conn.remote_addr,
                    opened_at: Instant::now(),
                },
            )
            .await;
        debug!(session_id = id, remote = %conn.remote_addr, "session created");

        tokio::spawn(session::run(self.ctx.clone(), id, conn, close_rx));
    }

    async fn close_all(&self) {
        let registry = &self.ctx.registry;
        for info in registry.list().await {
            debug!(
                session_id = info.id,
                remote = %info.remote_addr,
                age_secs = info.age_secs,
                "closing session"
            );
        }

        let signalled = registry.close_all().await;
        if signalled == 0 {
            return;
        }
        info!(sessions = signalled, "closing open sessions");
        if !registry.wait_until_empty(SHUTDOWN_GRACE).await {
            let remaining = registry.len().await;
            warn!(remaining, "sessions still open after shutdown grace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::scripted_handshake;
    use crate::backend::BackendConfig;
    use crate::events::tests::RecordingObserver;
    use crate::session::tests::{test_codec, token_for};
    use futures_util::StreamExt;
    use rdgate_core::{InstructionParser, ProtocolTable};
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::Message;

    fn test_config(backend_addr: String, max_connections: Option<usize>) -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            max_inactivity: None,
            max_connections,
            resource_param: "resource".into(),
            backend: BackendConfig {
                addr: backend_addr,
                connect_timeout: Duration::from_secs(2),
                inactivity: None,
            },
            token_codec: test_codec(),
            protocols: ProtocolTable::builtin(),
            drive_root: None,
            webhook_url: None,
        }
    }

    /// Start a server on an ephemeral port. Returns its address, a shutdown
    /// trigger, and the serve task.
    async fn start(
        server: Arc<GatewayServer>,
    ) -> (
        std::net::SocketAddr,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        (addr, shutdown_tx, task)
    }

    async fn next_close_code(
        ws: &mut crate::session::tests::ClientWs,
    ) -> Option<CloseCode> {
        while let Some(msg) = ws.next().await {
            if let Message::Close(frame) = msg.unwrap() {
                return frame.map(|f| f.code);
            }
        }
        None
    }

    #[tokio::test]
    async fn serve_can_run_on_a_spawned_task() {
        fn assert_send<T: Send>(_: &T) {}
        let server = GatewayServer::from_config(&test_config("127.0.0.1:1".into(), None));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serve = server.serve(listener, std::future::pending::<()>());
        assert_send(&serve);
    }

    #[tokio::test]
    async fn shutdown_closes_open_sessions() {
        let daemon_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let daemon_addr = daemon_listener.local_addr().unwrap().to_string();
        let observer = Arc::new(RecordingObserver::default());
        let server = Arc::new(GatewayServer::new(
            &test_config(daemon_addr, None),
            Arc::new(SessionRegistry::new()),
            Arc::new(Passthrough),
            observer.clone(),
        ));
        let (addr, shutdown_tx, serve_task) = start(server.clone()).await;

        let token = token_for("rdp", &[]);
        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/?token={token}&resource=r1"))
                .await
                .unwrap();
        let (mut daemon, _) = daemon_listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        scripted_handshake(&mut daemon, &mut parser, &["hostname"]).await;
        assert_eq!(server.registry().len().await, 1);

        shutdown_tx.send(()).unwrap();
        assert_eq!(next_close_code(&mut ws).await, Some(CloseCode::Away));
        serve_task.await.unwrap();

        assert!(server.registry().is_empty().await);
        assert_eq!(
            observer.snapshot(),
            vec![
                ("started".to_string(), 1, Some("r1".to_string())),
                ("ended".to_string(), 1, Some("r1".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn connection_limit_rejects_extra_clients() {
        let daemon_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let daemon_addr = daemon_listener.local_addr().unwrap().to_string();
        let server = Arc::new(GatewayServer::new(
            &test_config(daemon_addr, Some(1)),
            Arc::new(SessionRegistry::new()),
            Arc::new(Passthrough),
            Arc::new(RecordingObserver::default()),
        ));
        let (addr, shutdown_tx, serve_task) = start(server.clone()).await;

        let token = token_for("vnc", &[]);
        let url = format!("ws://{addr}/?token={token}");
        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut daemon, _) = daemon_listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        scripted_handshake(&mut daemon, &mut parser, &[]).await;

        let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        assert_eq!(next_close_code(&mut second).await, Some(CloseCode::Again));
        assert_eq!(server.registry().len().await, 1);

        shutdown_tx.send(()).unwrap();
        assert_eq!(next_close_code(&mut first).await, Some(CloseCode::Away));
        serve_task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_no_sessions_returns() {
        let server = Arc::new(GatewayServer::from_config(&test_config(
            "127.0.0.1:1".into(),
            None,
        )));
        let (_, shutdown_tx, serve_task) = start(server).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), serve_task)
            .await
            .unwrap()
            .unwrap();
    }
}
