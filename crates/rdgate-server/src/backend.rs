//! Backend connection: owns the TCP socket to the remote-desktop daemon.
//!
//! State machine: `Opening -> Open -> Closed`. The connection task dials the
//! daemon, runs the handshake (see [`crate::handshake`]), emits
//! [`BackendEvent::Open`], then relays bytes until the socket closes, the
//! owning session asks it to stop, or the daemon goes quiet.
//!
//! Three concurrent branches once open:
//! - **Cancel**: shuts the relay down when the session closes.
//! - **Daemon→Session**: buffers reads and forwards every complete instruction.
//! - **Session→Daemon**: writes queued client bytes to the socket.

use crate::handshake;
use rdgate_core::{GatewayError, GatewayResult, Instruction, InstructionParser, Leg, Settings};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How often the inactivity check runs.
pub const ACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on waiting for the connection task after a close request.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

const READ_BUFFER_SIZE: usize = 8192;

/// Where and how to reach the daemon.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// `host:port` of the daemon.
    pub addr: String,
    pub connect_timeout: Duration,
    /// Close if the daemon sends nothing for this long. `None` disables.
    pub inactivity: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Opening,
    Open,
    Closed,
}

/// Events delivered from the backend task to its session.
#[derive(Debug)]
pub enum BackendEvent {
    /// Handshake reply fully sent; data may flow.
    Open,
    /// One or more complete instructions from the daemon, verbatim.
    Data(String),
    /// The connection is gone. `None` for an orderly close.
    Closed(Option<GatewayError>),
}

/// Session-side handle to a running backend connection.
pub struct BackendHandle {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl BackendHandle {
    /// Queue bytes for the daemon. Fire-and-forget: returns `false` only if
    /// the connection task has already ended.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.write_tx.send(data).is_ok()
    }

    /// Stop the connection and wait for its task to finish, aborting it if
    /// it does not stop within [`CLOSE_TIMEOUT`].
    pub async fn close(self) {
        let _ = self.cancel_tx.try_send(());
        let mut task = self.task;
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "backend task panicked"),
            Err(_) => {
                warn!("backend task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// Open a backend connection for one session.
///
/// Spawns the connection task and returns immediately; progress is reported
/// through `events`. Bytes sent through the handle before the handshake
/// completes are held and written after it.
pub fn open(
    session_id: u64,
    config: BackendConfig,
    connection_type: String,
    settings: Settings,
    events: mpsc::Sender<BackendEvent>,
) -> BackendHandle {
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        let mut conn = BackendConnection::new(session_id, config);
        let result = conn
            .run(&connection_type, &settings, cancel_rx, write_rx, &events)
            .await;
        match &result {
            Ok(()) => debug!(session_id, "backend connection closed"),
            Err(e) => warn!(session_id, state = ?conn.state, error = %e, "backend connection failed"),
        }
        conn.state = BackendState::Closed;
        let _ = events.send(BackendEvent::Closed(result.err())).await;
    });

    BackendHandle {
        write_tx,
        cancel_tx,
        task,
    }
}

/// Per-connection state owned by the backend task.
struct BackendConnection {
    session_id: u64,
    config: BackendConfig,
    state: BackendState,
    parser: InstructionParser,
    last_activity: Instant,
}

impl BackendConnection {
    fn new(session_id: u64, config: BackendConfig) -> Self {
        Self {
            session_id,
            config,
            state: BackendState::Opening,
            parser: InstructionParser::new(),
            last_activity: Instant::now(),
        }
    }

    fn idle_expired(&self) -> bool {
        self.config
            .inactivity
            .is_some_and(|max| self.last_activity.elapsed() > max)
    }

    async fn run(
        &mut self,
        connection_type: &str,
        settings: &Settings,
        mut cancel_rx: mpsc::Receiver<()>,
        mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        events: &mpsc::Sender<BackendEvent>,
    ) -> GatewayResult<()> {
        let session_id = self.session_id;

        let stream = tokio::select! {
            _ = cancel_rx.recv() => return Ok(()),
            result = self.connect() => result?,
        };
        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        write_half
            .write_all(handshake::select(connection_type).encode().as_bytes())
            .await
            .map_err(|e| GatewayError::Transport(format!("backend write failed: {e}")))?;

        let mut ticker = tokio::time::interval(ACTIVITY_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Opening: wait for the daemon's `args`.
        let request = loop {
            if let Some(instruction) = self.parser.next_instruction()? {
                break instruction;
            }
            tokio::select! {
                _ = cancel_rx.recv() => return Ok(()),
                result = read_half.read(&mut buf) => {
                    let n = result.map_err(|e| {
                        GatewayError::Transport(format!("backend read failed: {e}"))
                    })?;
                    if n == 0 {
                        return Err(GatewayError::BackendProtocol(
                            "daemon disconnected during handshake".into(),
                        ));
                    }
                    self.last_activity = Instant::now();
                    self.parser.feed(&buf[..n]);
                }
                _ = ticker.tick() => {
                    if self.idle_expired() {
                        return Err(GatewayError::InactivityTimeout(Leg::Backend));
                    }
                }
            }
        };

        let reply: String = handshake::reply(&request, settings)?
            .iter()
            .map(Instruction::encode)
            .collect();
        write_half
            .write_all(reply.as_bytes())
            .await
            .map_err(|e| GatewayError::Transport(format!("backend write failed: {e}")))?;

        self.state = BackendState::Open;
        info!(session_id, attributes = request.args.len(), "backend handshake complete");
        if events.send(BackendEvent::Open).await.is_err() {
            return Ok(());
        }

        // Anything the daemon sent right after `args`.
        if let Some(chunk) = self.parser.take_complete()? {
            if events.send(BackendEvent::Data(chunk)).await.is_err() {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!(session_id, "backend relay cancelled");
                    break;
                }
                result = read_half.read(&mut buf) => {
                    let n = result.map_err(|e| {
                        GatewayError::Transport(format!("backend read failed: {e}"))
                    })?;
                    if n == 0 {
                        debug!(session_id, "daemon closed connection");
                        break;
                    }
                    self.last_activity = Instant::now();
                    self.parser.feed(&buf[..n]);
                    if let Some(chunk) = self.parser.take_complete()? {
                        if events.send(BackendEvent::Data(chunk)).await.is_err() {
                            debug!(session_id, "session gone, ending relay");
                            break;
                        }
                    }
                }
                Some(data) = write_rx.recv() => {
                    let written = self
                        .write_to_daemon(&mut write_half, &data, &mut cancel_rx, &mut ticker)
                        .await?;
                    if !written {
                        debug!(session_id, "backend relay cancelled mid-write");
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    if self.idle_expired() {
                        return Err(GatewayError::InactivityTimeout(Leg::Backend));
                    }
                }
            }
        }

        let _ = write_half.shutdown().await;
        Ok(())
    }

    /// Write one chunk while still honouring cancellation and the inactivity
    /// check. Returns `false` if cancelled before the write finished.
    async fn write_to_daemon(
        &self,
        write_half: &mut OwnedWriteHalf,
        data: &[u8],
        cancel_rx: &mut mpsc::Receiver<()>,
        ticker: &mut Interval,
    ) -> GatewayResult<bool> {
        let write = write_half.write_all(data);
        tokio::pin!(write);
        loop {
            tokio::select! {
                result = &mut write => {
                    result.map_err(|e| {
                        GatewayError::Transport(format!("backend write failed: {e}"))
                    })?;
                    return Ok(true);
                }
                _ = cancel_rx.recv() => return Ok(false),
                _ = ticker.tick() => {
                    if self.idle_expired() {
                        return Err(GatewayError::InactivityTimeout(Leg::Backend));
                    }
                }
            }
        }
    }

    async fn connect(&self) -> GatewayResult<TcpStream> {
        let addr = &self.config.addr;
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!(session_id = self.session_id, addr = %addr, "backend TCP connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(GatewayError::BackendConnect(format!("{addr}: {e}"))),
            Err(_) => Err(GatewayError::BackendConnect(format!(
                "{addr}: timed out after {:?}",
                self.config.connect_timeout
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rdgate_core::SettingValue;
    use tokio::net::TcpListener;

    /// Read exactly one instruction from a scripted daemon's socket.
    pub(crate) async fn read_instruction(
        stream: &mut TcpStream,
        parser: &mut InstructionParser,
    ) -> Instruction {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(ins) = parser.next_instruction().unwrap() {
                return ins;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "gateway closed the connection");
            parser.feed(&buf[..n]);
        }
    }

    /// Play the daemon side of the handshake. Returns the `select` argument
    /// and the five reply instructions.
    pub(crate) async fn scripted_handshake(
        stream: &mut TcpStream,
        parser: &mut InstructionParser,
        args: &[&str],
    ) -> (String, Vec<Instruction>) {
        let select = read_instruction(stream, parser).await;
        assert_eq!(select.opcode, "select");
        stream
            .write_all(Instruction::new("args", args.iter().copied()).encode().as_bytes())
            .await
            .unwrap();
        let mut reply = Vec::new();
        for _ in 0..5 {
            reply.push(read_instruction(stream, parser).await);
        }
        (select.args[0].clone(), reply)
    }

    fn config(addr: String, inactivity: Option<Duration>) -> BackendConfig {
        BackendConfig {
            addr,
            connect_timeout: Duration::from_secs(2),
            inactivity,
        }
    }

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), SettingValue::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn handshake_then_bidirectional_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let handle = open(
            1,
            config(addr, None),
            "rdp".into(),
            settings(&[("width", "800"), ("height", "600"), ("dpi", "96")]),
            events_tx,
        );
        // Queued before the handshake; must arrive after it.
        assert!(handle.send(b"5.mouse,1.1,1.2;".to_vec()));

        let (mut daemon, _) = listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        let (protocol, reply) =
            scripted_handshake(&mut daemon, &mut parser, &["width", "height", "dpi"]).await;

        assert_eq!(protocol, "rdp");
        assert_eq!(reply[4].encode(), "7.connect,3.800,3.600,2.96;");
        assert!(matches!(events_rx.recv().await, Some(BackendEvent::Open)));

        let queued = read_instruction(&mut daemon, &mut parser).await;
        assert_eq!(queued, Instruction::new("mouse", ["1", "2"]));

        // Daemon output split mid-instruction is held until complete.
        daemon.write_all(b"4.sync,3.1").await.unwrap();
        daemon.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        daemon.write_all(b"23;4.name,3.a;b;").await.unwrap();

        let mut forwarded = String::new();
        while forwarded != "4.sync,3.123;4.name,3.a;b;" {
            match events_rx.recv().await {
                Some(BackendEvent::Data(chunk)) => forwarded.push_str(&chunk),
                other => panic!("unexpected event {other:?}"),
            }
        }

        drop(daemon);
        assert!(matches!(
            events_rx.recv().await,
            Some(BackendEvent::Closed(None))
        ));
        handle.close().await;
    }

    #[tokio::test]
    async fn connect_failure_closes_without_open() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let handle = open(2, config(addr, None), "vnc".into(), Settings::new(), events_tx);

        match events_rx.recv().await {
            Some(BackendEvent::Closed(Some(GatewayError::BackendConnect(_)))) => {}
            other => panic!("unexpected event {other:?}"),
        }
        handle.close().await;
    }

    #[tokio::test]
    async fn disconnect_during_handshake_never_opens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let handle = open(3, config(addr, None), "ssh".into(), Settings::new(), events_tx);

        let (mut daemon, _) = listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        let select = read_instruction(&mut daemon, &mut parser).await;
        assert_eq!(select.args, vec!["ssh"]);
        drop(daemon);

        match events_rx.recv().await {
            Some(BackendEvent::Closed(Some(GatewayError::BackendProtocol(_)))) => {}
            other => panic!("unexpected event {other:?}"),
        }
        handle.close().await;
    }

    #[tokio::test]
    async fn unexpected_first_instruction_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let handle = open(4, config(addr, None), "rdp".into(), Settings::new(), events_tx);

        let (mut daemon, _) = listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        read_instruction(&mut daemon, &mut parser).await;
        daemon
            .write_all(b"5.error,13.bad protocol,3.768;")
            .await
            .unwrap();

        match events_rx.recv().await {
            Some(BackendEvent::Closed(Some(GatewayError::BackendProtocol(_)))) => {}
            other => panic!("unexpected event {other:?}"),
        }
        handle.close().await;
    }

    #[tokio::test]
    async fn quiet_daemon_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let handle = open(
            5,
            config(addr, Some(Duration::from_millis(300))),
            "rdp".into(),
            Settings::new(),
            events_tx,
        );

        let (mut daemon, _) = listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        scripted_handshake(&mut daemon, &mut parser, &["hostname"]).await;
        assert!(matches!(events_rx.recv().await, Some(BackendEvent::Open)));

        let closed = tokio::time::timeout(Duration::from_secs(3), events_rx.recv())
            .await
            .expect("no timeout within one check interval");
        assert!(matches!(
            closed,
            Some(BackendEvent::Closed(Some(GatewayError::InactivityTimeout(Leg::Backend))))
        ));
        handle.close().await;
    }

    #[tokio::test]
    async fn explicit_close_stops_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let handle = open(6, config(addr, None), "rdp".into(), Settings::new(), events_tx);

        let (mut daemon, _) = listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        scripted_handshake(&mut daemon, &mut parser, &[]).await;
        assert!(matches!(events_rx.recv().await, Some(BackendEvent::Open)));

        handle.close().await;
        assert!(matches!(
            events_rx.recv().await,
            Some(BackendEvent::Closed(None))
        ));

        // Daemon sees EOF.
        let mut buf = [0u8; 16];
        assert_eq!(daemon.read(&mut buf).await.unwrap(), 0);
    }

    /// Large enough to fill both socket buffers on loopback.
    const STALLING_WRITE: usize = 32 * 1024 * 1024;

    #[tokio::test]
    async fn stalled_write_still_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let handle = open(
            7,
            config(addr, Some(Duration::from_millis(500))),
            "rdp".into(),
            Settings::new(),
            events_tx,
        );

        let (mut daemon, _) = listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        scripted_handshake(&mut daemon, &mut parser, &[]).await;
        assert!(matches!(events_rx.recv().await, Some(BackendEvent::Open)));

        // The daemon never reads again, so this write cannot complete.
        assert!(handle.send(vec![b'x'; STALLING_WRITE]));

        let closed = tokio::time::timeout(Duration::from_secs(3), events_rx.recv())
            .await
            .expect("inactivity not detected during a blocked write");
        assert!(matches!(
            closed,
            Some(BackendEvent::Closed(Some(GatewayError::InactivityTimeout(Leg::Backend))))
        ));
        handle.close().await;
        drop(daemon);
    }

    #[tokio::test]
    async fn close_during_stalled_write_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let handle = open(8, config(addr, None), "rdp".into(), Settings::new(), events_tx);

        let (mut daemon, _) = listener.accept().await.unwrap();
        let mut parser = InstructionParser::new();
        scripted_handshake(&mut daemon, &mut parser, &[]).await;
        assert!(matches!(events_rx.recv().await, Some(BackendEvent::Open)));

        assert!(handle.send(vec![b'x'; STALLING_WRITE]));
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(2), handle.close())
            .await
            .expect("close blocked behind a stalled write");
        assert!(matches!(
            events_rx.recv().await,
            Some(BackendEvent::Closed(None))
        ));
        drop(daemon);
    }
}
