//! Socket request framing.
//!
//! A socket request is one JSON object per text frame:
//!
//! ```json
//! {"action": "get_status", "params": {"verbose": true}, "echo": 7}
//! ```
//!
//! When `params` is absent every other top-level field (except `action` and
//! `echo`) is taken as a parameter, so `{"action": "echo", "x": 1}` works too.

use serde_json::{Map, Value};

use crate::{ApiResult, Params, retcode};

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub action: String,
    pub params: Params,
    pub echo: Option<Value>,
}

/// Why a text frame could not be turned into an [`ActionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionParseError {
    InvalidJson,
    NotAnObject,
    MissingAction,
    InvalidParams,
}

impl ActionRequest {
    pub fn parse(text: &str) -> Result<Self, ActionParseError> {
        let value: Value =
            serde_json::from_str(text).map_err(|_| ActionParseError::InvalidJson)?;
        let Value::Object(mut obj) = value else {
            return Err(ActionParseError::NotAnObject);
        };

        let action = match obj.remove("action") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(ActionParseError::MissingAction),
        };
        let echo = obj.remove("echo");
        let params = match obj.remove("params") {
            Some(v @ Value::Object(_)) => Params::from_value(v).unwrap_or_default(),
            Some(Value::Null) => Params::new(),
            Some(_) => return Err(ActionParseError::InvalidParams),
            None => Params::from_value(Value::Object(obj)).unwrap_or_default(),
        };

        Ok(Self {
            action,
            params,
            echo,
        })
    }
}

impl ActionParseError {
    /// Result sent back to the peer for an unparseable frame.
    pub fn to_result(self) -> ApiResult {
        ApiResult::failed(retcode::BAD_REQUEST)
    }
}

/// Reply frame: the serialized [`ApiResult`] plus the caller's `echo`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResponse {
    pub result: ApiResult,
    pub echo: Option<Value>,
}

impl ActionResponse {
    pub fn new(result: ApiResult, echo: Option<Value>) -> Self {
        Self { result, echo }
    }

    pub fn to_json_string(&self) -> String {
        let mut obj = match self.result.to_json() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(echo) = &self.echo {
            obj.insert("echo".into(), echo.clone());
        }
        Value::Object(obj).to_string()
    }
}
