//! Gateway: exposes a host's handler table over HTTP, WebSocket and reverse
//! WebSocket, and fans host events out to every connected listener.
//!
//! Lifecycle:
//! 1. Load + validate config (`hostgate-config`)
//! 2. Build the `HandlerRegistry` (endpoint name → synchronous handler)
//! 3. `GatewayServices::start_all()` binds the HTTP and WebSocket servers and
//!    dials the reverse endpoints
//! 4. The host calls `GatewayServices::push_event()` for every event
//! 5. `GatewayServices::stop_all()` tears everything down; any transport can
//!    be restarted afterwards
//!
//! Each transport implements `lifecycle::Service` and can fail or restart
//! without affecting the others.

pub mod auth;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod reverse;
mod server;
pub mod services;
pub mod ws;

pub use {
    dispatch::{Dispatcher, HandlerRegistry},
    error::GatewayError,
    lifecycle::Service,
    services::{EventDelivery, GatewayServices},
};
