use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::retcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Ok,
    Async,
    Failed,
}

/// Outcome of a handler call, identical on every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResult {
    pub status: ApiStatus,
    pub retcode: i64,
    #[serde(default)]
    pub data: Value,
}

impl Default for ApiResult {
    fn default() -> Self {
        Self::failed(retcode::DEFAULT_ERROR)
    }
}

impl ApiResult {
    pub fn ok(data: Value) -> Self {
        Self {
            status: ApiStatus::Ok,
            retcode: retcode::OK,
            data,
        }
    }

    pub fn failed(retcode: i64) -> Self {
        Self {
            status: ApiStatus::Failed,
            retcode,
            data: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status != ApiStatus::Failed
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "retcode": self.retcode,
            "data": self.data,
        })
    }

    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn serializes_envelope() {
        let r = ApiResult::ok(json!({"id": 1}));
        assert_eq!(
            r.to_json(),
            json!({"status": "ok", "retcode": 0, "data": {"id": 1}})
        );
    }

    #[test]
    fn async_status_round_trips() {
        let r: ApiResult = serde_json::from_str(r#"{"status":"async","retcode":1}"#).unwrap();
        assert_eq!(r.status, ApiStatus::Async);
        assert!(r.is_ok());
        assert_eq!(r.to_json(), json!({"status": "async", "retcode": 1, "data": null}));
    }

    #[test]
    fn default_is_generic_failure() {
        let r = ApiResult::default();
        assert!(!r.is_ok());
        assert_eq!(r.retcode, retcode::DEFAULT_ERROR);
    }

    #[test]
    fn deserializes_without_data() {
        let r: ApiResult = serde_json::from_str(r#"{"status":"failed","retcode":1400}"#).unwrap();
        assert_eq!(r, ApiResult::failed(retcode::BAD_REQUEST));
    }
}
