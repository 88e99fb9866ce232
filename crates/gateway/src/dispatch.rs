use std::{collections::HashMap, sync::Arc};

use {
    tokio::sync::Semaphore,
    tracing::{debug, error, info},
};

use hostgate_protocol::{ActionRequest, ActionResponse, ApiResult, Params, retcode};

// ── Types ────────────────────────────────────────────────────────────────────

/// A synchronous endpoint handler.
pub type HandlerFn = Box<dyn Fn(&Params) -> ApiResult + Send + Sync>;

// ── Handler registry ─────────────────────────────────────────────────────────

/// Endpoint name → handler. Built once by the host, then shared read-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, endpoint: impl Into<String>, handler: F)
    where
        F: Fn(&Params) -> ApiResult + Send + Sync + 'static,
    {
        self.handlers.insert(endpoint.into(), Box::new(handler));
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.handlers.contains_key(endpoint)
    }

    pub fn invoke(&self, endpoint: &str, params: &Params) -> Option<ApiResult> {
        self.handlers.get(endpoint).map(|h| h(params))
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

/// Runs handlers on the blocking pool, at most `pool_size` at a time.
///
/// Each inbound server owns one dispatcher; all of them share the registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, pool_size: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.registry.contains(endpoint)
    }

    /// Invoke `endpoint`. `None` if no such handler exists.
    pub async fn call(&self, endpoint: &str, params: Params) -> Option<ApiResult> {
        if !self.registry.contains(endpoint) {
            return None;
        }

        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            error!(endpoint, "handler pool closed");
            return Some(ApiResult::default());
        };

        debug!(endpoint, "dispatching");
        let registry = Arc::clone(&self.registry);
        let name = endpoint.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            registry.invoke(&name, &params)
        })
        .await;

        match outcome {
            Ok(result) => {
                if result.is_some() {
                    info!(endpoint, "api call handled");
                }
                result
            },
            Err(e) => {
                error!(endpoint, error = %e, "handler panicked");
                Some(ApiResult::default())
            },
        }
    }

    /// Handle one socket text frame and produce the reply frame.
    pub async fn handle_action_text(&self, text: &str) -> String {
        let response = match ActionRequest::parse(text) {
            Ok(req) => {
                let result = self
                    .call(&req.action, req.params)
                    .await
                    .unwrap_or_else(|| {
                        debug!(action = %req.action, "unknown action");
                        ApiResult::failed(retcode::ACTION_NOT_FOUND)
                    });
                ActionResponse::new(result, req.echo)
            },
            Err(e) => {
                debug!(error = ?e, "invalid action frame");
                ActionResponse::new(e.to_result(), None)
            },
        };
        response.to_json_string()
    }
}
