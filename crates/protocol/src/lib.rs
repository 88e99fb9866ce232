//! Wire types shared by every hostgate transport.
//!
//! Every transport speaks the same envelope: a request is a set of named
//! parameters addressed to an endpoint, and the reply is an [`ApiResult`]
//! serialized as `{"status", "retcode", "data"}`.

pub mod action;
pub mod params;
pub mod result;

pub use {
    action::{ActionRequest, ActionResponse},
    params::Params,
    result::{ApiResult, ApiStatus},
};

/// `User-Agent` sent by reverse clients.
pub const USER_AGENT: &str = concat!("hostgate/", env!("CARGO_PKG_VERSION"));

/// Content type of every JSON reply.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Text frame sent periodically over reverse connections.
pub const HEARTBEAT_MARKER: &str = "_hb";

/// Interval between reverse-client keepalive frames.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// How often the reverse reconnect worker checks its flag.
pub const RECONNECT_POLL_MS: u64 = 500;

/// Query parameter carrying the access token when no header is sent.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Sent to a socket client right before it is closed for bad credentials.
pub const AUTH_FAILED_MESSAGE: &str = "authorization failed";

/// WebSocket endpoint paths.
pub mod paths {
    pub const API: &str = "/api";
    pub const EVENT: &str = "/event";
    /// Subdirectories of the data root reachable over HTTP.
    pub const DATA_KINDS: &[&str] = &["bface", "image", "record", "show"];
}

/// Numeric `retcode` values carried in [`ApiResult`].
pub mod retcode {
    pub const OK: i64 = 0;
    pub const DEFAULT_ERROR: i64 = 100;
    pub const BAD_REQUEST: i64 = 1400;
    pub const ACTION_NOT_FOUND: i64 = 1404;
}
