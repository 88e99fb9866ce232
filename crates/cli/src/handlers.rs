//! Built-in diagnostic endpoints registered by `hostgate serve`.

use std::sync::{Arc, OnceLock, Weak};

use serde_json::json;

use {
    hostgate_gateway::{GatewayServices, HandlerRegistry, Service},
    hostgate_protocol::{ApiResult, Params},
};

/// Late-bound handle to the running services; handlers are registered before
/// the services exist.
pub type ServicesSlot = Arc<OnceLock<Weak<GatewayServices>>>;

pub fn builtin_handlers(services: ServicesSlot) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("get_version_info", get_version_info);
    registry.register("echo", echo);
    registry.register("get_status", move |_: &Params| get_status(&services));
    registry
}

fn get_version_info(_: &Params) -> ApiResult {
    ApiResult::ok(json!({
        "app_name": env!("CARGO_PKG_NAME"),
        "app_version": env!("CARGO_PKG_VERSION"),
        "user_agent": hostgate_protocol::USER_AGENT,
    }))
}

fn echo(params: &Params) -> ApiResult {
    ApiResult::ok(params.clone().into_value())
}

fn get_status(slot: &ServicesSlot) -> ApiResult {
    let Some(services) = slot.get().and_then(Weak::upgrade) else {
        return ApiResult::ok(json!({"good": false, "online": false}));
    };
    ApiResult::ok(json!({
        "good": services.good(),
        "online": true,
        "http": services.http().good(),
        "ws": services.ws().good(),
        "ws_reverse": services.reverse().good(),
    }))
}
