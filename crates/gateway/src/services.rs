//! Supervisor owning every transport.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use {
    serde::Serialize,
    serde_json::{Value, json},
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use hostgate_config::GatewayConfig;

use crate::{
    dispatch::HandlerRegistry,
    error::GatewayError,
    http::RequestGateway,
    lifecycle::Service,
    reverse::{ReverseClientManager, ReverseSubService},
    ws::{Channel, PushReport, SocketGateway},
};

/// Per-transport result of [`GatewayServices::push_event`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventDelivery {
    pub socket: PushReport,
    /// `None` when the reverse event client is not enabled.
    pub reverse: Option<bool>,
}

struct HealthTask {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct GatewayServices {
    http: RequestGateway,
    ws: SocketGateway,
    reverse: ReverseClientManager,
    health: Mutex<Option<HealthTask>>,
}

impl GatewayServices {
    pub fn new(config: Arc<GatewayConfig>, registry: Arc<HandlerRegistry>) -> Self {
        Self::with_reverse(
            ReverseClientManager::new(Arc::clone(&config), Arc::clone(&registry)),
            config,
            registry,
        )
    }

    /// Build around an already configured reverse manager.
    pub fn with_reverse(
        reverse: ReverseClientManager,
        config: Arc<GatewayConfig>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            http: RequestGateway::new(Arc::clone(&config), Arc::clone(&registry)),
            ws: SocketGateway::new(config, registry),
            reverse,
            health: Mutex::new(None),
        }
    }

    pub fn http(&self) -> &RequestGateway {
        &self.http
    }

    pub fn ws(&self) -> &SocketGateway {
        &self.ws
    }

    pub fn reverse(&self) -> &ReverseClientManager {
        &self.reverse
    }

    fn all(&self) -> [&dyn Service; 3] {
        [&self.http, &self.ws, &self.reverse]
    }

    /// Start every enabled transport. One failing does not keep the others
    /// down; the failures are returned by service name.
    pub async fn start_all(&self) -> Vec<(&'static str, GatewayError)> {
        let mut failures = Vec::new();
        for service in self.all() {
            if !service.enabled() {
                info!(service = service.name(), "disabled");
                continue;
            }
            if let Err(e) = service.start().await {
                warn!(service = service.name(), error = %e, "failed to start");
                failures.push((service.name(), e));
            }
        }
        failures
    }

    pub async fn stop_all(&self) {
        let health = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(health) = health {
            health.token.cancel();
            if let Err(e) = health.task.await {
                warn!(error = %e, "health task panicked");
            }
        }
        for service in self.all() {
            service.stop().await;
        }
        info!("all transports stopped");
    }

    /// Deliver one event to every event-capable transport.
    pub async fn push_event(&self, payload: &Value) -> EventDelivery {
        let socket = if self.ws.enabled() {
            self.ws.push_event(payload).await
        } else {
            PushReport::default()
        };
        let reverse = if self.reverse.event().enabled() {
            Some(self.reverse.push_event(payload).await)
        } else {
            None
        };
        EventDelivery { socket, reverse }
    }

    pub fn good(&self) -> bool {
        self.all().iter().all(|s| s.good())
    }

    pub async fn heartbeat_all(&self) -> bool {
        let mut alive = true;
        for service in self.all() {
            if service.enabled() && !service.heartbeat().await {
                alive = false;
            }
        }
        alive
    }

    /// Snapshot for the `get_status` endpoint and the CLI.
    pub async fn status(&self) -> Value {
        let connections = self.ws.connections();
        json!({
            "good": self.good(),
            "http": {
                "enabled": self.http.enabled(),
                "good": self.http.good(),
                "addr": self.http.local_addr().await.map(|a| a.to_string()),
            },
            "ws": {
                "enabled": self.ws.enabled(),
                "good": self.ws.good(),
                "addr": self.ws.local_addr().await.map(|a| a.to_string()),
                "api_connections": connections.count_channel(Channel::Api).await,
                "event_connections": connections.count_channel(Channel::Event).await,
            },
            "ws_reverse": {
                "enabled": self.reverse.enabled(),
                "good": self.reverse.good(),
                "api": reverse_status(self.reverse.api()),
                "event": reverse_status(self.reverse.event()),
            },
        })
    }

    /// Probe every transport each `period` and log health transitions.
    pub fn spawn_health_check(self: &Arc<Self>, period: Duration) {
        let token = CancellationToken::new();
        let services = Arc::clone(self);
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            let mut last: HashMap<&'static str, bool> = HashMap::new();
            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    () = tokio::time::sleep(period) => {},
                }
                for service in services.all() {
                    if !service.enabled() {
                        continue;
                    }
                    let alive = service.heartbeat().await;
                    let good = service.good() && alive;
                    match last.insert(service.name(), good) {
                        Some(prev) if prev == good => {},
                        _ if good => info!(service = service.name(), "transport healthy"),
                        _ => warn!(service = service.name(), alive, "transport unhealthy"),
                    }
                }
            }
        });

        let previous = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(HealthTask { token, task });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }
}

fn reverse_status(sub: &ReverseSubService) -> Value {
    json!({
        "enabled": sub.enabled(),
        "good": sub.good(),
        "url": sub.url(),
        "secure": sub.scheme().map(|s| s == crate::reverse::ClientScheme::Secure),
        "state": sub.state(),
        "restarts": sub.restarts(),
    })
}
