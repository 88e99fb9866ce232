//! Config schema: everything the transports read at start-up.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

/// Which side wins when a query parameter and a body field share a name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamPrecedence {
    #[default]
    Query,
    Body,
}

/// Root configuration. Immutable once loaded; shared as `Arc<GatewayConfig>`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP bind address.
    pub host: String,
    pub port: u16,
    #[serde(deserialize_with = "lenient_bool")]
    pub use_http: bool,

    /// WebSocket server bind address.
    pub ws_host: String,
    pub ws_port: u16,
    #[serde(deserialize_with = "lenient_bool")]
    pub use_ws: bool,

    /// Reverse client targets (`ws://` or `wss://`).
    pub ws_reverse_api_url: String,
    pub ws_reverse_event_url: String,
    /// Delay before a dropped reverse connection is rebuilt, in milliseconds.
    pub ws_reverse_reconnect_interval: u64,
    /// Also reconnect when the remote closes normally (code 1000).
    #[serde(deserialize_with = "lenient_bool")]
    pub ws_reverse_reconnect_on_code_1000: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub use_ws_reverse: bool,

    /// Shared token required from every caller. Empty means open access.
    pub access_token: String,
    /// Signing secret, consumed by host-side collaborators.
    pub secret: String,

    #[serde(deserialize_with = "lenient_bool")]
    pub serve_data_files: bool,
    /// Directory holding the `bface`/`image`/`record`/`show` subtrees.
    pub data_root: PathBuf,

    /// Handler slots per inbound server.
    pub server_thread_pool_size: usize,
    pub param_precedence: ParamPrecedence,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5700,
            use_http: true,
            ws_host: "0.0.0.0".into(),
            ws_port: 6700,
            use_ws: false,
            ws_reverse_api_url: String::new(),
            ws_reverse_event_url: String::new(),
            ws_reverse_reconnect_interval: 3000,
            ws_reverse_reconnect_on_code_1000: true,
            use_ws_reverse: false,
            access_token: String::new(),
            secret: String::new(),
            serve_data_files: false,
            data_root: PathBuf::from("data"),
            server_thread_pool_size: 4,
            param_precedence: ParamPrecedence::Query,
        }
    }
}

impl GatewayConfig {
    /// Configured access token, `None` when access is open.
    pub fn access_token(&self) -> Option<&str> {
        let token = self.access_token.trim();
        (!token.is_empty()).then_some(token)
    }

    /// Handler slots, never zero.
    pub fn pool_size(&self) -> usize {
        self.server_thread_pool_size.max(1)
    }

    /// Reject combinations the transports cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.use_http && self.port == 0 {
            anyhow::bail!("port must be set when use_http is enabled");
        }
        if self.use_ws && self.ws_port == 0 {
            anyhow::bail!("ws_port must be set when use_ws is enabled");
        }
        if self.use_ws_reverse {
            for (key, url) in [
                ("ws_reverse_api_url", &self.ws_reverse_api_url),
                ("ws_reverse_event_url", &self.ws_reverse_event_url),
            ] {
                if !url.is_empty() && !url.starts_with("ws://") && !url.starts_with("wss://") {
                    anyhow::bail!("{key} must start with ws:// or wss://, got {url}");
                }
            }
        }
        if self.server_thread_pool_size == 0 {
            anyhow::bail!("server_thread_pool_size must be at least 1");
        }
        Ok(())
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &str| if s.is_empty() { "" } else { "[REDACTED]" };
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_http", &self.use_http)
            .field("ws_host", &self.ws_host)
            .field("ws_port", &self.ws_port)
            .field("use_ws", &self.use_ws)
            .field("ws_reverse_api_url", &self.ws_reverse_api_url)
            .field("ws_reverse_event_url", &self.ws_reverse_event_url)
            .field(
                "ws_reverse_reconnect_interval",
                &self.ws_reverse_reconnect_interval,
            )
            .field(
                "ws_reverse_reconnect_on_code_1000",
                &self.ws_reverse_reconnect_on_code_1000,
            )
            .field("use_ws_reverse", &self.use_ws_reverse)
            .field("access_token", &redact(&self.access_token))
            .field("secret", &redact(&self.secret))
            .field("serve_data_files", &self.serve_data_files)
            .field("data_root", &self.data_root)
            .field("server_thread_pool_size", &self.server_thread_pool_size)
            .field("param_precedence", &self.param_precedence)
            .finish()
    }
}

/// Accepts real booleans as well as `yes`/`no`, `on`/`off`, `1`/`0`.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => Ok(b),
        Raw::Int(i) => Ok(i != 0),
        Raw::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Ok(true),
            "no" | "false" | "off" | "0" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "invalid boolean value: {other}"
            ))),
        },
    }
}
