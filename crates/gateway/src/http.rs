//! Request gateway: one HTTP route per registered endpoint plus the
//! read-only data file subtree.

use std::{
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use {
    async_trait::async_trait,
    axum::{
        Router,
        body::{Body, Bytes},
        extract::{Path, RawQuery, State},
        http::{
            HeaderMap, Method,
            header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
        },
        response::{IntoResponse, Response},
        routing::get,
    },
    tokio_util::{io::ReaderStream, sync::CancellationToken},
    tracing::{debug, info, warn},
};

use {
    hostgate_config::{GatewayConfig, ParamPrecedence},
    hostgate_protocol::{ApiResult, JSON_CONTENT_TYPE, Params, paths},
};

use crate::{
    auth,
    dispatch::{Dispatcher, HandlerRegistry},
    error::GatewayError,
    lifecycle::{Service, ServiceFlags},
    server::{PreparedServer, RunningServer},
};

const NAME: &str = "http";

// ── Parameter parsing ────────────────────────────────────────────────────────

/// Decode a raw query string into parameters (all values are strings).
pub fn query_params(query: Option<&str>) -> Params {
    match query {
        Some(q) if !q.is_empty() => Params::from_pairs(url::form_urlencoded::parse(q.as_bytes())),
        _ => Params::new(),
    }
}

/// Parameters carried by a request body, chosen by its content type.
///
/// Empty bodies, and bodies without a declared type, contribute nothing.
pub fn body_params(content_type: Option<&str>, body: &[u8]) -> Result<Params, GatewayError> {
    if body.is_empty() {
        return Ok(Params::new());
    }
    let Some(content_type) = content_type.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(Params::new());
    };

    let lowered = content_type.to_ascii_lowercase();
    if lowered.starts_with("application/x-www-form-urlencoded") {
        return Ok(Params::from_pairs(url::form_urlencoded::parse(body)));
    }
    if lowered.starts_with("application/json") {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::MalformedRequest(format!("invalid JSON body: {e}")))?;
        return Params::from_value(value).ok_or_else(|| {
            GatewayError::MalformedRequest("JSON body must be an object".into())
        });
    }
    Err(GatewayError::NotAcceptable(content_type.to_string()))
}

/// Merge body and query parameters; `precedence` names the side that wins.
pub fn merge_params(body: Params, query: Params, precedence: ParamPrecedence) -> Params {
    let (mut base, overlay) = match precedence {
        ParamPrecedence::Query => (body, query),
        ParamPrecedence::Body => (query, body),
    };
    base.merge(overlay);
    base
}

// ── Router ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct HttpAppState {
    config: Arc<GatewayConfig>,
    dispatcher: Dispatcher,
}

/// Build the HTTP router (shared between `RequestGateway` and tests).
pub fn build_http_app(config: Arc<GatewayConfig>, dispatcher: Dispatcher) -> Router {
    let state = HttpAppState { config, dispatcher };
    Router::new()
        .route("/data/{kind}/{*path}", get(data_file_handler))
        .route("/{endpoint}", get(api_handler).post(api_handler))
        .route("/{endpoint}/", get(api_handler).post(api_handler))
        .with_state(state)
}

async fn api_handler(
    State(state): State<HttpAppState>,
    Path(endpoint): Path<String>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    debug!(%method, endpoint, "api request");
    match handle_api_call(&state, &endpoint, &method, query.as_deref(), &headers, &body).await {
        Ok(result) => {
            let body = result.to_json_string();
            debug!(endpoint, body = %body, "api response ready");
            ([(CONTENT_TYPE, JSON_CONTENT_TYPE)], body).into_response()
        },
        Err(e) => {
            debug!(endpoint, error = %e, "api request rejected");
            e.into_response()
        },
    }
}

async fn handle_api_call(
    state: &HttpAppState,
    endpoint: &str,
    method: &Method,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<ApiResult, GatewayError> {
    if !state.dispatcher.has_endpoint(endpoint) {
        return Err(GatewayError::NotFound);
    }

    let query = query_params(query);
    auth::authorize(state.config.access_token(), headers, &query)?;

    let body = if *method == Method::POST {
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        body_params(content_type, body)?
    } else {
        Params::new()
    };

    let params = merge_params(body, query, state.config.param_precedence);
    state
        .dispatcher
        .call(endpoint, params)
        .await
        .ok_or(GatewayError::NotFound)
}

async fn data_file_handler(
    State(state): State<HttpAppState>,
    Path((kind, rel)): Path<(String, String)>,
) -> Response {
    match serve_data_file(&state.config, &kind, &rel).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(kind, path = %rel, error = %e, "data file rejected");
            e.into_response()
        },
    }
}

fn resolve_data_path(root: &FsPath, kind: &str, rel: &str) -> Result<PathBuf, GatewayError> {
    if !paths::DATA_KINDS.contains(&kind) {
        return Err(GatewayError::NotFound);
    }
    if rel.contains("..") {
        return Err(GatewayError::Forbidden(format!("path traversal in {rel}")));
    }
    Ok(root.join(kind).join(rel.trim_start_matches('/')))
}

async fn serve_data_file(
    config: &GatewayConfig,
    kind: &str,
    rel: &str,
) -> Result<Response, GatewayError> {
    if !config.serve_data_files {
        return Err(GatewayError::NotFound);
    }
    let path = resolve_data_path(&config.data_root, kind, rel)?;

    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => return Err(GatewayError::NotFound),
    };
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| GatewayError::Forbidden(format!("cannot open {}: {e}", path.display())))?;

    info!(kind, path = %rel, bytes = meta.len(), "serving data file");
    let headers = [
        (CONTENT_LENGTH, meta.len().to_string()),
        (CONTENT_TYPE, "application/octet-stream".to_string()),
        (CONTENT_DISPOSITION, "attachment".to_string()),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

// ── Service ──────────────────────────────────────────────────────────────────

/// The HTTP transport.
pub struct RequestGateway {
    config: Arc<GatewayConfig>,
    dispatcher: Dispatcher,
    flags: Arc<ServiceFlags>,
    prepared: Mutex<Option<PreparedServer>>,
    running: tokio::sync::Mutex<Option<RunningServer>>,
}

impl RequestGateway {
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<HandlerRegistry>) -> Self {
        let dispatcher = Dispatcher::new(registry, config.pool_size());
        Self {
            config,
            dispatcher,
            flags: Arc::new(ServiceFlags::new()),
            prepared: Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Address actually bound, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(RunningServer::local_addr)
    }

    fn prepared_slot(&self) -> std::sync::MutexGuard<'_, Option<PreparedServer>> {
        self.prepared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Service for RequestGateway {
    fn name(&self) -> &'static str {
        NAME
    }

    fn enabled(&self) -> bool {
        self.config.use_http
    }

    fn init(&self) {
        debug!("initializing http server");
        let router = build_http_app(Arc::clone(&self.config), self.dispatcher.clone());
        *self.prepared_slot() = Some(PreparedServer {
            router,
            shutdown: CancellationToken::new(),
        });
        self.flags.set_initialized(true);
    }

    async fn start(&self) -> Result<(), GatewayError> {
        if !self.enabled() {
            debug!("http server disabled");
            return Ok(());
        }

        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.shutdown().await;
        }

        self.init();
        let Some(prepared) = self.prepared_slot().take() else {
            return Err(GatewayError::Transport("http server not initialized".into()));
        };

        match RunningServer::spawn(
            NAME,
            &self.config.host,
            self.config.port,
            prepared,
            Arc::clone(&self.flags),
        )
        .await
        {
            Ok(server) => {
                info!(addr = %server.local_addr(), "http api listening");
                *running = Some(server);
                Ok(())
            },
            Err(e) => {
                warn!(error = %e, "http server failed to start");
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
