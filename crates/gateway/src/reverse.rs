//! Reverse WebSocket clients.
//!
//! Instead of waiting for callers, the gateway dials out to up to two remote
//! endpoints: one carrying API requests from the remote side (answered over
//! the same socket) and one receiving pushed events. Each role is an
//! independent [`ReverseSubService`] with its own connection, reconnect
//! worker and heartbeat worker.
//!
//! Workers belong to a *generation*: every start creates a fresh
//! `CancellationToken` and every stop cancels it. Workers check the token at
//! each wake and are never awaited; the client run loop is.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt, stream::SplitSink},
    serde::Serialize,
    tokio::{net::TcpStream, task::JoinHandle},
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            Message,
            client::IntoClientRequest,
            handshake::client::Request,
            http::{
                HeaderValue,
                header::{AUTHORIZATION, USER_AGENT},
            },
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    hostgate_config::GatewayConfig,
    hostgate_protocol::{HEARTBEAT_INTERVAL_MS, HEARTBEAT_MARKER, RECONNECT_POLL_MS},
};

use crate::{
    dispatch::{Dispatcher, HandlerRegistry},
    error::GatewayError,
    lifecycle::{Service, ServiceFlags},
};

const NAME: &str = "ws_reverse";
const NORMAL_CLOSE: u16 = 1000;
/// Reported when the peer closes without a status code.
const NO_STATUS: u16 = 1005;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseRole {
    /// Remote side sends action frames, we answer.
    Api,
    /// We push events, inbound frames are ignored.
    Event,
}

impl ReverseRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for ReverseRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientScheme {
    Plain,
    Secure,
}

impl ClientScheme {
    /// `ws://` → plain, `wss://` → TLS, anything else is unsupported.
    pub fn from_url(raw: &str) -> Option<Self> {
        let parsed = url::Url::parse(raw.trim()).ok()?;
        match parsed.scheme() {
            "ws" => Some(Self::Plain),
            "wss" => Some(Self::Secure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Stopped,
    Initializing,
    Connected,
    Disconnected,
    Closed,
}

/// Worker cadence. Production values come from `Default`.
#[derive(Debug, Clone, Copy)]
pub struct ReverseTimings {
    pub reconnect_poll: Duration,
    pub heartbeat: Duration,
    pub send_timeout: Duration,
}

impl Default for ReverseTimings {
    fn default() -> Self {
        Self {
            reconnect_poll: Duration::from_millis(RECONNECT_POLL_MS),
            heartbeat: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            send_timeout: Duration::from_secs(10),
        }
    }
}

struct Generation {
    token: CancellationToken,
    client_task: JoinHandle<()>,
}

struct Inner {
    role: ReverseRole,
    config: Arc<GatewayConfig>,
    dispatcher: Dispatcher,
    timings: ReverseTimings,
    flags: ServiceFlags,
    scheme: Mutex<Option<ClientScheme>>,
    state: Mutex<ConnectionState>,
    should_reconnect: Mutex<bool>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    lifecycle: tokio::sync::Mutex<Option<Generation>>,
    restarts: AtomicU64,
}

// ── Sub-service ──────────────────────────────────────────────────────────────

/// One outbound connection plus its workers.
#[derive(Clone)]
pub struct ReverseSubService {
    inner: Arc<Inner>,
}

impl ReverseSubService {
    pub fn new(
        role: ReverseRole,
        config: Arc<GatewayConfig>,
        dispatcher: Dispatcher,
        timings: ReverseTimings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                role,
                config,
                dispatcher,
                timings,
                flags: ServiceFlags::new(),
                scheme: Mutex::new(None),
                state: Mutex::new(ConnectionState::Stopped),
                should_reconnect: Mutex::new(false),
                sink: tokio::sync::Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(None),
                restarts: AtomicU64::new(0),
            }),
        }
    }

    pub fn role(&self) -> ReverseRole {
        self.inner.role
    }

    pub fn url(&self) -> &str {
        let config = &self.inner.config;
        match self.inner.role {
            ReverseRole::Api => config.ws_reverse_api_url.trim(),
            ReverseRole::Event => config.ws_reverse_event_url.trim(),
        }
    }

    /// Reverse mode is on and this role has a URL.
    pub fn enabled(&self) -> bool {
        self.inner.config.use_ws_reverse && !self.url().is_empty()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport picked from the URL by the last `init()`.
    pub fn scheme(&self) -> Option<ClientScheme> {
        *self.inner.scheme.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Completed stop→start cycles triggered by the reconnect worker.
    pub fn restarts(&self) -> u64 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    pub fn good(&self) -> bool {
        self.inner.flags.good(self.enabled())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_scheme(&self, scheme: Option<ClientScheme>) {
        *self.inner.scheme.lock().unwrap_or_else(PoisonError::into_inner) = scheme;
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn init(&self) {
        let scheme = ClientScheme::from_url(self.url());
        self.set_scheme(scheme);
        self.set_state(ConnectionState::Initializing);
        self.inner.flags.set_initialized(true);
    }

    pub async fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!(role = %self.role(), "reverse client already started");
            return;
        }
        self.start_locked(&mut lifecycle);
    }

    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).await;
    }

    pub fn finalize(&self) {
        if let Ok(mut sink) = self.inner.sink.try_lock() {
            sink.take();
        }
        self.set_scheme(None);
        self.set_state(ConnectionState::Stopped);
        *self
            .inner
            .should_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
        self.inner.flags.reset();
    }

    fn start_locked(&self, slot: &mut Option<Generation>) {
        let role = self.role();
        if !self.enabled() {
            debug!(%role, "reverse client disabled");
            return;
        }

        self.init();
        let url = self.url().to_string();
        let Some(scheme) = self.scheme() else {
            warn!(%role, url, "reverse url must use ws:// or wss://");
            return;
        };
        let request = match build_request(&url, self.inner.config.access_token()) {
            Ok(request) => request,
            Err(e) => {
                warn!(%role, url, error = %e, "invalid reverse client request");
                return;
            },
        };

        let token = CancellationToken::new();
        let client_task = tokio::spawn(self.clone().run_client(request, token.clone()));
        tokio::spawn(self.clone().reconnect_worker(token.clone()));
        tokio::spawn(self.clone().heartbeat_worker(token.clone()));

        self.inner.flags.set_started(true);
        info!(%role, url, ?scheme, "reverse client started");
        *slot = Some(Generation { token, client_task });
    }

    async fn stop_locked(&self, slot: &mut Option<Generation>) {
        if let Some(generation) = slot.take() {
            generation.token.cancel();
            self.close_sink().await;
            if let Err(e) = generation.client_task.await {
                warn!(role = %self.role(), error = %e, "reverse client task panicked");
            }
            info!(role = %self.role(), "reverse client stopped");
        }
        self.finalize();
    }

    async fn close_sink(&self) {
        let Some(mut sink) = self.inner.sink.lock().await.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match tokio::time::timeout(
            self.inner.timings.send_timeout,
            sink.send(Message::Close(Some(frame))),
        )
        .await
        {
            Ok(Ok(())) => {},
            Ok(Err(e)) => debug!(role = %self.role(), error = %e, "close frame not sent"),
            Err(_) => debug!(role = %self.role(), "close frame timed out"),
        }
    }

    // ── Client run loop ──────────────────────────────────────────────────

    async fn run_client(self, request: Request, token: CancellationToken) {
        let role = self.role();
        let connected = tokio::select! {
            biased;
            () = token.cancelled() => return,
            result = connect_async(request) => result,
        };
        let stream = match connected {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(%role, error = %e, "reverse connect failed");
                self.on_error();
                return;
            },
        };

        let (sink, mut source) = stream.split();
        *self.inner.sink.lock().await = Some(sink);
        self.set_state(ConnectionState::Connected);
        info!(%role, url = self.url(), "reverse client connected");

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                next = source.next() => match next {
                    Some(Ok(Message::Text(text))) => self.on_text(text.as_str()).await,
                    Some(Ok(Message::Close(frame))) => {
                        if !token.is_cancelled() {
                            self.on_close(frame.map_or(NO_STATUS, |f| u16::from(f.code)));
                        }
                        break;
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        if !token.is_cancelled() {
                            warn!(%role, error = %e, "reverse connection error");
                            self.on_error();
                        }
                        break;
                    },
                    None => {
                        if !token.is_cancelled() {
                            warn!(%role, "reverse connection dropped");
                            self.on_error();
                        }
                        break;
                    },
                },
            }
        }
        debug!(%role, "reverse client loop exited");
    }

    async fn on_text(&self, text: &str) {
        if self.role() != ReverseRole::Api {
            debug!(role = %self.role(), "ignoring inbound frame");
            return;
        }
        let reply = self.inner.dispatcher.handle_action_text(text).await;
        if let Err(e) = self.send_text(&reply).await {
            warn!(role = %self.role(), error = %e, "failed to send api reply");
        }
    }

    fn on_close(&self, code: u16) {
        self.set_state(ConnectionState::Closed);
        let reconnect =
            self.inner.config.ws_reverse_reconnect_on_code_1000 || code != NORMAL_CLOSE;
        info!(role = %self.role(), code, reconnect, "reverse connection closed");
        if reconnect {
            self.signal_reconnect();
        }
    }

    fn on_error(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.signal_reconnect();
    }

    /// Ask the reconnect worker for a restart. Signals coalesce.
    pub fn signal_reconnect(&self) {
        *self
            .inner
            .should_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn take_reconnect_flag(&self) -> bool {
        std::mem::take(
            &mut *self
                .inner
                .should_reconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    // ── Workers ──────────────────────────────────────────────────────────

    async fn reconnect_worker(self, token: CancellationToken) {
        let interval_ms = self.inner.config.ws_reverse_reconnect_interval;
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.inner.timings.reconnect_poll) => {},
            }
            if !self.take_reconnect_flag() {
                continue;
            }

            info!(role = %self.role(), interval_ms, "reconnecting");
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(interval_ms)) => {},
            }
            self.restart(&token).await;
            // the new generation runs its own worker
            break;
        }
        debug!(role = %self.role(), "reconnect worker exited");
    }

    async fn restart(&self, token: &CancellationToken) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if token.is_cancelled() {
            debug!(role = %self.role(), "restart superseded by stop");
            return;
        }
        self.stop_locked(&mut lifecycle).await;
        self.start_locked(&mut lifecycle);
        self.inner.restarts.fetch_add(1, Ordering::SeqCst);
    }

    async fn heartbeat_worker(self, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.inner.timings.heartbeat) => {},
            }
            self.send_heartbeat().await;
        }
        debug!(role = %self.role(), "heartbeat worker exited");
    }

    /// Send the keepalive marker. Failures are logged, never raised.
    pub async fn send_heartbeat(&self) -> bool {
        match self.send_text(HEARTBEAT_MARKER).await {
            Ok(()) => true,
            Err(e) => {
                debug!(role = %self.role(), error = %e, "heartbeat not sent");
                false
            },
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    async fn send_text(&self, text: &str) -> Result<(), GatewayError> {
        let mut guard = self.inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(GatewayError::NotConnected);
        };
        match tokio::time::timeout(self.inner.timings.send_timeout, sink.send(Message::text(text)))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::Transport(e.to_string())),
            Err(_) => Err(GatewayError::Transport("send timed out".into())),
        }
    }

    /// Serialize and send one event. Only meaningful for the event role.
    pub async fn push_event(&self, payload: &serde_json::Value) -> bool {
        if self.role() != ReverseRole::Event || !self.enabled() {
            return false;
        }
        match self.send_text(&payload.to_string()).await {
            Ok(()) => {
                debug!(role = %self.role(), "event pushed to reverse client");
                true
            },
            Err(e) => {
                warn!(role = %self.role(), error = %e, "event push to reverse client failed");
                false
            },
        }
    }
}

fn build_request(url: &str, token: Option<&str>) -> Result<Request, GatewayError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| GatewayError::Transport(e.to_string()))?;
    let headers = request.headers_mut();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(hostgate_protocol::USER_AGENT),
    );
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Token {token}"))
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(request)
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Both reverse roles behind one lifecycle.
pub struct ReverseClientManager {
    config: Arc<GatewayConfig>,
    api: ReverseSubService,
    event: ReverseSubService,
}

impl ReverseClientManager {
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<HandlerRegistry>) -> Self {
        Self::with_timings(config, registry, ReverseTimings::default())
    }

    pub fn with_timings(
        config: Arc<GatewayConfig>,
        registry: Arc<HandlerRegistry>,
        timings: ReverseTimings,
    ) -> Self {
        let dispatcher = Dispatcher::new(registry, config.pool_size());
        Self {
            api: ReverseSubService::new(
                ReverseRole::Api,
                Arc::clone(&config),
                dispatcher.clone(),
                timings,
            ),
            event: ReverseSubService::new(
                ReverseRole::Event,
                Arc::clone(&config),
                dispatcher,
                timings,
            ),
            config,
        }
    }

    pub fn api(&self) -> &ReverseSubService {
        &self.api
    }

    pub fn event(&self) -> &ReverseSubService {
        &self.event
    }

    pub async fn push_event(&self, payload: &serde_json::Value) -> bool {
        self.event.push_event(payload).await
    }
}

#[async_trait]
impl Service for ReverseClientManager {
    fn name(&self) -> &'static str {
        NAME
    }

    fn enabled(&self) -> bool {
        self.config.use_ws_reverse
    }

    fn init(&self) {
        self.api.init();
        self.event.init();
    }

    async fn start(&self) -> Result<(), GatewayError> {
        if !self.enabled() {
            debug!("reverse clients disabled");
            return Ok(());
        }
        self.api.start().await;
        self.event.start().await;
        Ok(())
    }

    async fn stop(&self) {
        self.api.stop().await;
        self.event.stop().await;
    }

    fn finalize(&self) {
        self.api.finalize();
        self.event.finalize();
    }

    fn good(&self) -> bool {
        self.api.good() && self.event.good()
    }

    async fn heartbeat(&self) -> bool {
        let mut alive = true;
        for sub in [&self.api, &self.event] {
            if sub.enabled() && !sub.send_heartbeat().await {
                alive = false;
            }
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        hostgate_protocol::{ApiResult, Params},
        serde_json::{Value, json},
        tokio::{net::TcpListener, sync::mpsc},
        tokio_tungstenite::{
            accept_hdr_async,
            tungstenite::{
                handshake::server::{
                    ErrorResponse, Request as ServerRequest, Response as ServerResponse,
                },
                http::HeaderMap,
            },
        },
    };

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Accepts every connection and hands it, with its request headers, to the test.
    async fn remote() -> (String, mpsc::UnboundedReceiver<(ServerSocket, HeaderMap)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let mut headers = HeaderMap::new();
                let ws = accept_hdr_async(
                    tcp,
                    |req: &ServerRequest, resp: ServerResponse| -> Result<ServerResponse, ErrorResponse> {
                        headers = req.headers().clone();
                        Ok(resp)
                    },
                )
                .await;
                if let Ok(ws) = ws
                    && tx.send((ws, headers)).is_err()
                {
                    break;
                }
            }
        });
        (format!("ws://{addr}"), rx)
    }

    fn fast() -> ReverseTimings {
        ReverseTimings {
            reconnect_poll: Duration::from_millis(20),
            heartbeat: Duration::from_secs(60),
            send_timeout: Duration::from_secs(2),
        }
    }

    fn config(api_url: &str, event_url: &str, reconnect_on_1000: bool) -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            use_http: false,
            use_ws_reverse: true,
            ws_reverse_api_url: api_url.into(),
            ws_reverse_event_url: event_url.into(),
            ws_reverse_reconnect_interval: 50,
            ws_reverse_reconnect_on_code_1000: reconnect_on_1000,
            access_token: "tok".into(),
            ..Default::default()
        })
    }

    fn handlers() -> Arc<HandlerRegistry> {
        let mut reg = HandlerRegistry::new();
        reg.register("echo", |p: &Params| ApiResult::ok(p.clone().into_value()));
        Arc::new(reg)
    }

    async fn accept(rx: &mut mpsc::UnboundedReceiver<(ServerSocket, HeaderMap)>) -> (ServerSocket, HeaderMap) {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    async fn next_text(ws: &mut ServerSocket) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(t) = msg {
                return t.as_str().to_string();
            }
        }
    }

    #[test]
    fn scheme_detection() {
        assert_eq!(ClientScheme::from_url("ws://h:1/x"), Some(ClientScheme::Plain));
        assert_eq!(ClientScheme::from_url("wss://h/x"), Some(ClientScheme::Secure));
        assert_eq!(ClientScheme::from_url("http://h/x"), None);
        assert_eq!(ClientScheme::from_url("nonsense"), None);
    }

    #[tokio::test]
    async fn api_role_answers_remote_requests() {
        let (base, mut rx) = remote().await;
        let mgr = ReverseClientManager::with_timings(
            config(&format!("{base}/api"), "", true),
            handlers(),
            fast(),
        );
        mgr.start().await.unwrap();

        let (mut ws, headers) = accept(&mut rx).await;
        assert_eq!(headers["authorization"], "Token tok");
        assert_eq!(headers["user-agent"], hostgate_protocol::USER_AGENT);
        eventually(|| mgr.api().is_connected()).await;
        assert!(mgr.good());

        ws.send(Message::text(r#"{"action":"echo","params":{"q":1},"echo":9}"#))
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(reply["data"], json!({"q": 1}));
        assert_eq!(reply["echo"], 9);

        mgr.stop().await;
        assert_eq!(mgr.api().state(), ConnectionState::Stopped);
        assert!(!mgr.good());
    }

    #[tokio::test]
    async fn abnormal_close_restarts_once() {
        let (base, mut rx) = remote().await;
        let mgr = ReverseClientManager::with_timings(
            config("", &format!("{base}/event"), false),
            handlers(),
            fast(),
        );
        mgr.start().await.unwrap();

        let (mut first, _) = accept(&mut rx).await;
        first
            .close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "".into(),
            }))
            .await
            .unwrap();

        let (_second, _) = accept(&mut rx).await;
        eventually(|| mgr.event().restarts() == 1).await;
        eventually(|| mgr.event().is_connected()).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.event().restarts(), 1);
        assert!(rx.try_recv().is_err());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn normal_close_is_final_when_configured() {
        let (base, mut rx) = remote().await;
        let mgr = ReverseClientManager::with_timings(
            config("", &format!("{base}/event"), false),
            handlers(),
            fast(),
        );
        mgr.start().await.unwrap();

        let (mut ws, _) = accept(&mut rx).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }))
        .await
        .unwrap();
        eventually(|| mgr.event().state() == ConnectionState::Closed).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.event().restarts(), 0);
        assert!(rx.try_recv().is_err());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn repeated_signals_coalesce() {
        let (base, mut rx) = remote().await;
        let mgr = ReverseClientManager::with_timings(
            config("", &format!("{base}/event"), true),
            handlers(),
            fast(),
        );
        mgr.start().await.unwrap();
        let (_first, _) = accept(&mut rx).await;
        eventually(|| mgr.event().is_connected()).await;

        for _ in 0..3 {
            mgr.event().signal_reconnect();
        }
        let (_second, _) = accept(&mut rx).await;
        eventually(|| mgr.event().restarts() == 1).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.event().restarts(), 1);
        assert!(rx.try_recv().is_err());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn event_role_pushes_and_heartbeats() {
        let (base, mut rx) = remote().await;
        let timings = ReverseTimings {
            heartbeat: Duration::from_millis(50),
            ..fast()
        };
        let mgr = ReverseClientManager::with_timings(
            config("", &format!("{base}/event"), true),
            handlers(),
            timings,
        );
        assert!(!mgr.push_event(&json!({"n": 1})).await);

        mgr.start().await.unwrap();
        let (mut ws, _) = accept(&mut rx).await;
        eventually(|| mgr.event().is_connected()).await;

        assert_eq!(next_text(&mut ws).await, HEARTBEAT_MARKER);

        let payload = json!({"post_type": "notice"});
        assert!(mgr.push_event(&payload).await);
        loop {
            let text = next_text(&mut ws).await;
            if text != HEARTBEAT_MARKER {
                assert_eq!(text, payload.to_string());
                break;
            }
        }
        assert!(mgr.heartbeat().await);

        mgr.stop().await;
        assert!(!mgr.push_event(&payload).await);
    }

    #[tokio::test]
    async fn bad_scheme_is_not_good() {
        let mgr = ReverseClientManager::with_timings(
            config("http://127.0.0.1:1/api", "", true),
            handlers(),
            fast(),
        );
        mgr.start().await.unwrap();
        assert!(!mgr.api().good());
        assert!(mgr.event().good());
        assert!(!mgr.good());
        mgr.stop().await;
        mgr.stop().await;
    }

    #[tokio::test]
    async fn disabled_and_stop_before_start() {
        let cfg = Arc::new(GatewayConfig::default());
        let mgr = ReverseClientManager::with_timings(cfg, handlers(), fast());
        mgr.stop().await;
        mgr.start().await.unwrap();
        assert!(mgr.good());
        assert_eq!(mgr.api().state(), ConnectionState::Stopped);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn unreachable_remote_keeps_retrying() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mgr = ReverseClientManager::with_timings(
            config(&format!("ws://{addr}/api"), "", true),
            handlers(),
            fast(),
        );
        mgr.start().await.unwrap();
        eventually(|| mgr.api().restarts() >= 2).await;
        mgr.stop().await;
        let settled = mgr.api().restarts();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mgr.api().restarts(), settled);
    }
}
