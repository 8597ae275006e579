//! Server network layer: the HTTP/WebSocket listener and the
//! update/broadcast scheduler.
//!
//! One axum router serves the port. WebSocket upgrades become connection
//! tasks, and every other request gets the health response. Connection tasks
//! only move bytes. They decode inbound messages and forward them as
//! [`ServerEvent`]s, and they write whatever the registry queued on their
//! outbound channel. The scheduler loop owns the tick cadence and is the
//! only caller of the registry.

use crate::config::{ServerConfig, CLIENT_FRAME_LIMIT};
use crate::health;
use crate::registry::{ConnectionHandle, ConnectionId, CycleReport, RegistryError, SessionRegistry};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::Method;
use axum::response::Response;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use protocol::{decode, Message};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};

/// Cycles between statistics log lines
const STATS_INTERVAL: u64 = 60;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Messages sent from connection tasks to the scheduler loop
#[derive(Debug)]
pub enum ServerEvent {
    Connected { handle: ConnectionHandle },
    Inbound {
        connection: ConnectionId,
        message: Message,
    },
    Disconnected { connection: ConnectionId },
}

/// Per-connection limits, copied into every connection task.
#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    outbound_depth: usize,
    max_message_size: usize,
}

/// Router state shared by every request.
#[derive(Clone)]
struct Transport {
    events: mpsc::Sender<ServerEvent>,
    settings: ConnectionSettings,
    next_connection: Arc<AtomicU64>,
}

/// Counters accumulated between statistics log lines.
#[derive(Debug, Default)]
struct CycleStats {
    cycles: u64,
    frames_sent: usize,
    deferred: usize,
    expired: usize,
    /// Ticks skipped because the previous cycle was still running
    overlapped: usize,
    busiest: Duration,
}

/// A cycle running on the blocking pool.
struct RunningCycle {
    started: Instant,
    task: JoinHandle<CycleReport>,
}

/// Listener, registry and scheduler of one server instance.
pub struct Server {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    config: ServerConfig,
}

impl Server {
    /// Builds the registry from `config` and binds the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, StartupError> {
        let registry = SessionRegistry::new(config.registry())?;
        Self::with_registry(config, Arc::new(registry)).await
    }

    /// Binds the listener for an existing registry.
    pub async fn with_registry(
        config: ServerConfig,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, StartupError> {
        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| StartupError::Bind {
                address: address.clone(),
                source,
            })?;
        match listener.local_addr() {
            Ok(addr) => info!("Server listening on {}", addr),
            Err(_) => info!("Server listening on {}", address),
        }

        let frame_size = config.frame_message_size();
        if frame_size > CLIENT_FRAME_LIMIT {
            warn!(
                "Frames for a {} grid are {} bytes in one WebSocket message; clients need a frame size limit above that",
                config.grid, frame_size
            );
        }

        Ok(Self {
            listener,
            registry,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serves connections and runs the scheduler until the event channel
    /// closes.
    pub async fn run(self) {
        let Server {
            listener,
            registry,
            config,
        } = self;

        let (event_tx, mut event_rx) = mpsc::channel(config.event_capacity);
        let transport = Transport {
            events: event_tx,
            settings: ConnectionSettings {
                outbound_depth: config.outbound_depth,
                max_message_size: config.max_message_size,
            },
            next_connection: Arc::new(AtomicU64::new(0)),
        };
        let app = Router::new().fallback(serve_request).with_state(transport);
        let http = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service).await {
                error!("HTTP server stopped: {}", e);
            }
        });

        let mut scheduler = Scheduler::new(registry, config.tick);
        let mut ticker = interval(config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Scheduler started: {:?} tick, {} grid",
            config.tick, config.grid
        );

        // Events keep flowing while a cycle runs on the blocking pool
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => scheduler.handle_event(event).await,
                    None => {
                        info!("Event channel closed, scheduler stopping");
                        break;
                    }
                },
                _ = ticker.tick() => scheduler.start_cycle(),
                (started, result) = Scheduler::wait_cycle(&mut scheduler.running),
                    if scheduler.running.is_some() => scheduler.finish_cycle(started, result),
            }
        }

        http.abort();
    }
}

/// Owns the tick cadence and is the only caller of the registry.
struct Scheduler {
    registry: Arc<SessionRegistry>,
    period: Duration,
    running: Option<RunningCycle>,
    stats: CycleStats,
}

impl Scheduler {
    fn new(registry: Arc<SessionRegistry>, period: Duration) -> Self {
        Self {
            registry,
            period,
            running: None,
            stats: CycleStats::default(),
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { handle } => self.open_session(handle).await,

            ServerEvent::Inbound {
                connection,
                message,
            } => {
                if !message.is_client_message() {
                    warn!(
                        "Connection {} sent unexpected {:?}, ignoring",
                        connection,
                        message.message_type()
                    );
                    return;
                }
                match self.registry.lookup_session(connection) {
                    Some(session_id) => {
                        self.registry.dispatch(&session_id, &message);
                    }
                    None => debug!("Connection {} has no session, dropping message", connection),
                }
            }

            ServerEvent::Disconnected { connection } => {
                match self.registry.remove_session(connection) {
                    Some(session_id) => {
                        info!("Connection {} closed (session {})", connection, session_id)
                    }
                    None => info!("Connection {} closed", connection),
                }
            }
        }
    }

    async fn open_session(&mut self, handle: ConnectionHandle) {
        let connection = handle.id();
        let fallback = handle.clone();
        let registry = Arc::clone(&self.registry);
        let result = tokio::task::spawn_blocking(move || registry.create_session(handle)).await;

        let reason = match result {
            Ok(Ok(session_id)) => {
                info!("Connection {} opened session {}", connection, session_id);
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(err) => format!("session creation aborted: {err}"),
        };

        error!(
            "Failed to create session for connection {}: {}",
            connection, reason
        );
        // Dropping the last handle closes the socket after the error is written
        fallback.send_error("", &reason);
    }

    /// Starts a cycle on the blocking pool unless the last one is still
    /// running. A cycle gives up waiting on slow steps after one period.
    fn start_cycle(&mut self) {
        if self.running.is_some() {
            self.stats.overlapped += 1;
            return;
        }
        let registry = Arc::clone(&self.registry);
        let budget = self.period;
        self.running = Some(RunningCycle {
            started: Instant::now(),
            task: tokio::task::spawn_blocking(move || registry.run_cycle(budget)),
        });
    }

    /// Resolves when the running cycle ends. Never resolves without one.
    async fn wait_cycle(
        running: &mut Option<RunningCycle>,
    ) -> (Instant, Result<CycleReport, JoinError>) {
        match running {
            Some(cycle) => {
                let result = (&mut cycle.task).await;
                (cycle.started, result)
            }
            None => std::future::pending().await,
        }
    }

    fn finish_cycle(&mut self, started: Instant, result: Result<CycleReport, JoinError>) {
        self.running = None;
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                error!("Tick cycle failed: {}", err);
                return;
            }
        };
        let (tick, flush) = (report.tick, report.flush);

        let elapsed = started.elapsed();
        if tick.expired > 0 || tick.closed > 0 {
            info!(
                "Swept {} expired and {} closed sessions",
                tick.expired, tick.closed
            );
        }
        if tick.unfinished > 0 {
            warn!(
                "{} sessions still stepping after the {:?} period; they flush when done",
                tick.unfinished, self.period
            );
        }

        let stats = &mut self.stats;
        stats.cycles += 1;
        stats.frames_sent += flush.frames_sent;
        stats.deferred += flush.deferred;
        stats.expired += tick.expired;
        stats.busiest = stats.busiest.max(elapsed);

        if stats.cycles % STATS_INTERVAL == 0 {
            debug!(
                "Cycle {}: {} sessions, {} frames sent, {} deferred, {} expired, {} ticks overlapped, slowest cycle {:?}",
                stats.cycles,
                self.registry.len(),
                stats.frames_sent,
                stats.deferred,
                stats.expired,
                stats.overlapped,
                stats.busiest
            );
            *stats = CycleStats {
                cycles: stats.cycles,
                ..CycleStats::default()
            };
        }
    }
}

/// Upgrades WebSocket requests into connection tasks and answers everything
/// else with the health check.
async fn serve_request(
    State(transport): State<Transport>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(upgrade) = upgrade else {
        debug!("Health check from {}: {}", addr, method);
        return health::respond(&method);
    };

    let connection = ConnectionId(transport.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
    let settings = transport.settings;
    let events = transport.events;
    upgrade
        .max_message_size(settings.max_message_size)
        .max_frame_size(settings.max_message_size)
        .on_failed_upgrade(move |e| warn!("WebSocket handshake with {} failed: {}", addr, e))
        .on_upgrade(move |socket| handle_websocket(socket, addr, connection, events, settings))
}

async fn handle_websocket(
    socket: WebSocket,
    addr: SocketAddr,
    connection: ConnectionId,
    events: mpsc::Sender<ServerEvent>,
    settings: ConnectionSettings,
) {
    info!("Connection {} accepted from {}", connection, addr);

    let (mut sink, mut inbound) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(settings.outbound_depth);
    let handle = ConnectionHandle::new(connection, outbound_tx);
    if events.send(ServerEvent::Connected { handle }).await.is_err() {
        return;
    }

    // Runs until every handle is gone, then closes the socket.
    let mut writer = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if let Err(e) = sink.send(WsMessage::Binary(bytes)).await {
                debug!("Connection {} write failed: {}", connection, e);
                return;
            }
        }
        if let Err(e) = sink.close().await {
            debug!("Connection {} close failed: {}", connection, e);
        }
    });

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(WsMessage::Binary(data))) => match decode(&data) {
                    Ok(message) => {
                        let event = ServerEvent::Inbound { connection, message };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Connection {} sent malformed message: {}", connection, e),
                },
                Some(Ok(WsMessage::Text(_))) => {
                    warn!("Connection {} sent a text message, ignoring", connection)
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                // Ping and pong are answered by the protocol layer
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Connection {} read failed: {}", connection, e);
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    if events
        .send(ServerEvent::Disconnected { connection })
        .await
        .is_err()
    {
        debug!("Scheduler gone before connection {} closed", connection);
    }
}
