//! Socket gateway: inbound WebSocket connections on `/api` and `/event`.
//!
//! Every accepted connection gets a single writer task fed by a bounded
//! channel, so replies and pushed events never interleave mid-frame. `/api`
//! frames are handled in arrival order; `/event` is push-only and anything a
//! client sends there is ignored.
//!
//! A client that stops reading is evicted once a write stalls past
//! [`SocketLimits::send_timeout`]; until then, pushes that find its queue full
//! are counted as failed.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, RwLock as StdRwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    axum::{
        Router,
        extract::{
            ConnectInfo, RawQuery, State, WebSocketUpgrade,
            ws::{CloseFrame, Message, WebSocket, close_code},
        },
        http::HeaderMap,
        response::Response,
        routing::get,
    },
    futures::{SinkExt, StreamExt},
    serde::Serialize,
    tokio::sync::{
        RwLock,
        mpsc::{self, error::TrySendError},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    hostgate_config::GatewayConfig,
    hostgate_protocol::{AUTH_FAILED_MESSAGE, paths},
};

use crate::{
    auth::{self, AuthFailure},
    dispatch::{Dispatcher, HandlerRegistry},
    error::GatewayError,
    http::query_params,
    lifecycle::{Service, ServiceFlags},
    server::{PreparedServer, RunningServer},
};

const NAME: &str = "ws";

// ── Connections ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Api,
    Event,
}

impl Channel {
    pub fn path(self) -> &'static str {
        match self {
            Self::Api => paths::API,
            Self::Event => paths::EVENT,
        }
    }
}

/// Per-connection write limits. Production values come from `Default`.
#[derive(Debug, Clone, Copy)]
pub struct SocketLimits {
    /// Frames buffered for one connection before pushes to it fail.
    pub queue_depth: usize,
    /// Longest a single frame write may take before the connection is dropped.
    pub send_timeout: Duration,
}

impl Default for SocketLimits {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// A live inbound socket.
pub struct ConnectedClient {
    pub conn_id: u64,
    pub channel: Channel,
    pub remote: SocketAddr,
    /// Frames queued for this client's write loop.
    pub sender: mpsc::Sender<Message>,
    /// Cancelled when the write side gives up; ends the connection task.
    pub closer: CancellationToken,
    pub connected_at: Instant,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub attempted: usize,
    pub succeeded: usize,
}

impl fmt::Display for PushReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.succeeded, self.attempted)
    }
}

/// All sockets accepted by one server generation.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<u64, ConnectedClient>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn register(&self, client: ConnectedClient) {
        debug!(conn_id = client.conn_id, path = client.channel.path(), remote = %client.remote, "socket registered");
        self.clients.write().await.insert(client.conn_id, client);
    }

    pub async fn remove(&self, conn_id: u64) -> Option<ConnectedClient> {
        self.clients.write().await.remove(&conn_id)
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn count_channel(&self, channel: Channel) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.channel == channel)
            .count()
    }

    /// Queue `text` for every `/event` socket; one failure does not stop the
    /// rest. Never waits on a slow client: a full queue counts as a failure.
    pub async fn push_event(&self, text: &str) -> PushReport {
        let targets: Vec<(u64, mpsc::Sender<Message>)> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.channel == Channel::Event)
            .map(|c| (c.conn_id, c.sender.clone()))
            .collect();

        let mut report = PushReport {
            attempted: targets.len(),
            succeeded: 0,
        };
        for (conn_id, sender) in targets {
            match sender.try_send(Message::Text(text.into())) {
                Ok(()) => report.succeeded += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(conn_id, "event push failed, client is not keeping up");
                },
                Err(TrySendError::Closed(_)) => {
                    debug!(conn_id, "event push failed, write loop gone");
                },
            }
        }
        report
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct WsAppState {
    config: Arc<GatewayConfig>,
    dispatcher: Dispatcher,
    registry: Arc<ConnectionRegistry>,
    limits: SocketLimits,
    shutdown: CancellationToken,
}

fn build_ws_app(state: WsAppState) -> Router {
    Router::new()
        .route("/api", get(api_upgrade_handler))
        .route("/api/", get(api_upgrade_handler))
        .route("/event", get(event_upgrade_handler))
        .route("/event/", get(event_upgrade_handler))
        .with_state(state)
}

async fn api_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<WsAppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, state, Channel::Api, addr, query.as_deref(), &headers)
}

async fn event_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<WsAppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, state, Channel::Event, addr, query.as_deref(), &headers)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: WsAppState,
    channel: Channel,
    remote: SocketAddr,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Response {
    let query = query_params(query);
    let verdict = auth::authorize(state.config.access_token(), headers, &query);
    ws.on_upgrade(move |socket| async move {
        match verdict {
            Ok(()) => handle_connection(socket, state, channel, remote).await,
            Err(failure) => reject(socket, failure, channel, remote).await,
        }
    })
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }))
}

async fn reject(mut socket: WebSocket, failure: AuthFailure, channel: Channel, remote: SocketAddr) {
    warn!(path = channel.path(), %remote, reason = %failure, "socket authorization failed");
    if let Err(e) = socket.send(Message::Text(AUTH_FAILED_MESSAGE.into())).await {
        debug!(%remote, error = %e, "could not send rejection");
        return;
    }
    if let Err(e) = socket.send(normal_close()).await {
        debug!(%remote, error = %e, "could not send close frame");
    }
}

async fn handle_connection(socket: WebSocket, state: WsAppState, channel: Channel, remote: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.limits.queue_depth.max(1));
    let closer = CancellationToken::new();

    let conn_id = state.registry.next_conn_id();
    state
        .registry
        .register(ConnectedClient {
            conn_id,
            channel,
            remote,
            sender: tx.clone(),
            closer: closer.clone(),
            connected_at: Instant::now(),
        })
        .await;
    info!(conn_id, path = channel.path(), %remote, "socket connected");

    let send_timeout = state.limits.send_timeout;
    let write_closer = closer.clone();
    let write_loop = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                () = write_closer.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let closing = matches!(msg, Message::Close(_));
            match tokio::time::timeout(send_timeout, sink.send(msg)).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    debug!(conn_id, error = %e, "socket write failed");
                    write_closer.cancel();
                    break;
                },
                Err(_) => {
                    warn!(conn_id, timeout = ?send_timeout, "socket write timed out, dropping client");
                    write_closer.cancel();
                    break;
                },
            }
            if closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;
            () = state.shutdown.cancelled() => {
                let _ = tx.try_send(normal_close());
                break;
            },
            () = closer.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => {
                    if channel != Channel::Api {
                        debug!(conn_id, "ignoring frame on event socket");
                        continue;
                    }
                    let reply = state.dispatcher.handle_action_text(text.as_str()).await;
                    if tx.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(conn_id, ?frame, "socket closed by peer");
                    break;
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    debug!(conn_id, error = %e, "socket read failed");
                    break;
                },
                None => break,
            },
        }
    }

    let session = state.registry.remove(conn_id).await;
    drop(tx);
    if let Err(e) = write_loop.await {
        warn!(conn_id, error = %e, "socket write loop panicked");
    }
    let secs = session.map_or(0, |c| c.connected_at.elapsed().as_secs());
    info!(conn_id, path = channel.path(), %remote, secs, "socket disconnected");
}

// ── Service ──────────────────────────────────────────────────────────────────

/// The inbound WebSocket transport.
pub struct SocketGateway {
    config: Arc<GatewayConfig>,
    dispatcher: Dispatcher,
    limits: SocketLimits,
    flags: Arc<ServiceFlags>,
    registry: StdRwLock<Arc<ConnectionRegistry>>,
    prepared: Mutex<Option<PreparedServer>>,
    running: tokio::sync::Mutex<Option<RunningServer>>,
}

impl SocketGateway {
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<HandlerRegistry>) -> Self {
        Self::with_limits(config, registry, SocketLimits::default())
    }

    pub fn with_limits(
        config: Arc<GatewayConfig>,
        registry: Arc<HandlerRegistry>,
        limits: SocketLimits,
    ) -> Self {
        let dispatcher = Dispatcher::new(registry, config.pool_size());
        Self {
            config,
            dispatcher,
            limits,
            flags: Arc::new(ServiceFlags::new()),
            registry: StdRwLock::new(Arc::new(ConnectionRegistry::new())),
            prepared: Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(RunningServer::local_addr)
    }

    /// Connections of the current server generation.
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Serialize `payload` once and fan it out to every `/event` socket.
    pub async fn push_event(&self, payload: &serde_json::Value) -> PushReport {
        if !self.flags.is_started() {
            return PushReport::default();
        }
        let text = payload.to_string();
        let report = self.connections().push_event(&text).await;
        info!(delivered = %report, "event pushed to sockets");
        report
    }

    fn prepared_slot(&self) -> std::sync::MutexGuard<'_, Option<PreparedServer>> {
        self.prepared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Service for SocketGateway {
    fn name(&self) -> &'static str {
        NAME
    }

    fn enabled(&self) -> bool {
        self.config.use_ws
    }

    fn init(&self) {
        debug!("initializing websocket server");
        let connections = Arc::new(ConnectionRegistry::new());
        *self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&connections);

        let shutdown = CancellationToken::new();
        let router = build_ws_app(WsAppState {
            config: Arc::clone(&self.config),
            dispatcher: self.dispatcher.clone(),
            registry: connections,
            limits: self.limits,
            shutdown: shutdown.clone(),
        });
        *self.prepared_slot() = Some(PreparedServer { router, shutdown });
        self.flags.set_initialized(true);
    }

    async fn start(&self) -> Result<(), GatewayError> {
        if !self.enabled() {
            debug!("websocket server disabled");
            return Ok(());
        }

        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.shutdown().await;
        }

        self.init();
        let Some(prepared) = self.prepared_slot().take() else {
            return Err(GatewayError::Transport("websocket server not initialized".into()));
        };

        match RunningServer::spawn(
            NAME,
            &self.config.ws_host,
            self.config.ws_port,
            prepared,
            Arc::clone(&self.flags),
        )
        .await
        {
            Ok(server) => {
                info!(addr = %server.local_addr(), "websocket api listening");
                *running = Some(server);
                Ok(())
            },
            Err(e) => {
                warn!(error = %e, "websocket server failed to start");
                self.finalize();
                Err(e)
            },
        }
    }

    async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(server) = running.take() {
            server.shutdown().await;
        }
        self.finalize();
    }

    fn finalize(&self) {
        self.prepared_slot().take();
        self.flags.reset();
    }

    fn good(&self) -> bool {
        self.flags.good(self.enabled())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        hostgate_protocol::{ApiResult, Params, retcode},
        serde_json::{Value, json},
        std::sync::atomic::AtomicUsize,
        tokio_tungstenite::{
            connect_async,
            tungstenite::{Message as WsMessage, client::IntoClientRequest},
        },
    };

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    fn handlers() -> Arc<HandlerRegistry> {
        let mut reg = HandlerRegistry::new();
        reg.register("echo", |p: &Params| ApiResult::ok(p.clone().into_value()));
        Arc::new(reg)
    }

    fn config(token: &str) -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            ws_host: "127.0.0.1".into(),
            ws_port: 0,
            use_http: false,
            use_ws: true,
            access_token: token.into(),
            ..Default::default()
        })
    }

    async fn started(token: &str) -> (SocketGateway, SocketAddr) {
        let gw = SocketGateway::new(config(token), handlers());
        gw.start().await.unwrap();
        let addr = gw.local_addr().await.unwrap();
        (gw, addr)
    }

    async fn connect(addr: SocketAddr, path: &str) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
        client
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(t) = msg {
                return t.as_str().to_string();
            }
        }
    }

    async fn wait_for_connections(gw: &SocketGateway, n: usize) {
        for _ in 0..100 {
            if gw.connections().count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {n} connections");
    }

    #[tokio::test]
    async fn api_socket_round_trip() {
        let (gw, addr) = started("").await;
        let mut client = connect(addr, "/api").await;

        client
            .send(WsMessage::text(r#"{"action":"echo","params":{"a":1},"echo":"tag"}"#))
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["data"], json!({"a": 1}));
        assert_eq!(reply["echo"], "tag");

        client.send(WsMessage::text("not json")).await.unwrap();
        let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert_eq!(reply["retcode"], retcode::BAD_REQUEST);

        client
            .send(WsMessage::text(r#"{"action":"missing"}"#))
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert_eq!(reply["retcode"], retcode::ACTION_NOT_FOUND);

        gw.stop().await;
    }

    #[tokio::test]
    async fn bad_token_is_told_and_closed() {
        let (gw, addr) = started("secret").await;
        let mut client = connect(addr, "/event?access_token=wrong").await;

        assert_eq!(next_text(&mut client).await, AUTH_FAILED_MESSAGE);
        let close = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match close {
            WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(gw.connections().count().await, 0);
        gw.stop().await;
    }

    #[tokio::test]
    async fn missing_token_never_reaches_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = HandlerRegistry::new();
        let counter = Arc::clone(&calls);
        reg.register("echo", move |p: &Params| {
            counter.fetch_add(1, Ordering::SeqCst);
            ApiResult::ok(p.clone().into_value())
        });
        let gw = SocketGateway::new(config("secret"), Arc::new(reg));
        gw.start().await.unwrap();
        let addr = gw.local_addr().await.unwrap();

        let mut client = connect(addr, "/api").await;
        // the server may already be closing; a failed send is fine here
        let _ = client
            .send(WsMessage::text(r#"{"action":"echo","params":{"a":1}}"#))
            .await;

        assert_eq!(next_text(&mut client).await, AUTH_FAILED_MESSAGE);
        let close = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match close {
            WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("expected close frame, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(gw.connections().count().await, 0);
        gw.stop().await;
    }

    #[tokio::test]
    async fn header_token_is_accepted() {
        let (gw, addr) = started("secret").await;
        let mut req = format!("ws://{addr}/api/").into_client_request().unwrap();
        req.headers_mut()
            .insert("Authorization", "Token secret".parse().unwrap());
        let (mut client, _) = connect_async(req).await.unwrap();

        client
            .send(WsMessage::text(r#"{"action":"echo","x":"y"}"#))
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&next_text(&mut client).await).unwrap();
        assert_eq!(reply["data"], json!({"x": "y"}));
        gw.stop().await;
    }

    #[tokio::test]
    async fn push_counts_failures_independently() {
        let (gw, addr) = started("").await;
        let mut first = connect(addr, "/event").await;
        let mut second = connect(addr, "/event/").await;
        let _api = connect(addr, "/api").await;
        wait_for_connections(&gw, 3).await;

        // a third event socket whose write loop is already gone
        let (dead_tx, dead_rx) = mpsc::channel(1);
        drop(dead_rx);
        let connections = gw.connections();
        connections
            .register(ConnectedClient {
                conn_id: connections.next_conn_id(),
                channel: Channel::Event,
                remote: "127.0.0.1:9".parse().unwrap(),
                sender: dead_tx,
                closer: CancellationToken::new(),
                connected_at: Instant::now(),
            })
            .await;

        let payload = json!({"post_type": "message", "message": "hi"});
        let report = gw.push_event(&payload).await;
        assert_eq!(report, PushReport {
            attempted: 3,
            succeeded: 2
        });
        assert_eq!(report.to_string(), "2/3");

        let expected = payload.to_string();
        assert_eq!(next_text(&mut first).await, expected);
        assert_eq!(next_text(&mut second).await, expected);

        gw.stop().await;
    }

    #[tokio::test]
    async fn stalled_event_client_is_reported_and_evicted() {
        let limits = SocketLimits {
            queue_depth: 4,
            send_timeout: Duration::from_millis(200),
        };
        let gw = SocketGateway::with_limits(config(""), handlers(), limits);
        gw.start().await.unwrap();
        let addr = gw.local_addr().await.unwrap();

        // connected but never reads
        let _stalled = connect(addr, "/event").await;
        wait_for_connections(&gw, 1).await;

        let payload = json!({"post_type": "message", "blob": "x".repeat(64 * 1024)});
        let mut saw_failure = false;
        for _ in 0..2000 {
            let report = gw.push_event(&payload).await;
            if report.succeeded < report.attempted {
                saw_failure = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(saw_failure, "a client that never reads must stop counting as delivered");

        wait_for_connections(&gw, 0).await;
        assert_eq!(gw.push_event(&payload).await, PushReport::default());
        gw.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_clients_and_is_repeatable() {
        let gw = SocketGateway::new(config(""), handlers());
        gw.stop().await;

        gw.start().await.unwrap();
        assert!(gw.good());
        let addr = gw.local_addr().await.unwrap();
        let mut client = connect(addr, "/event").await;
        wait_for_connections(&gw, 1).await;

        gw.stop().await;
        gw.stop().await;
        assert!(!gw.good());
        assert_eq!(gw.push_event(&json!({})).await, PushReport::default());

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {},
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}
