use serde::{Deserialize, Serialize};

use super::requests::RequestId;
use crate::codec::msgpack_to_json;

pub type RpcResult = rmpv::Value;

/// Rate-limit snapshot attached to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcStats {
    /// Messages left in the current window, `-1` when unlimited.
    pub remaining_requests: i64,
    pub reset_in_seconds: u64,
}

impl RpcStats {
    pub fn new(remaining_requests: i64, reset_in_seconds: u64) -> Self {
        Self {
            remaining_requests,
            reset_in_seconds,
        }
    }

    /// Sentinel used when no limiter applies to the request.
    pub fn unlimited() -> Self {
        Self::new(-1, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.remaining_requests < 0
    }
}

impl Default for RpcStats {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RequestId,
    pub ok: bool,
    pub stats: RpcStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: RpcResult, stats: RpcStats) -> Self {
        RpcResponse {
            id,
            ok: true,
            stats,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: impl Into<String>, stats: RpcStats) -> Self {
        RpcResponse {
            id,
            ok: false,
            stats,
            result: None,
            error: Some(error.into()),
        }
    }

    /// JSON rendering of the response. Binary results become byte arrays and
    /// timestamps become RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("id".into(), self.id.to_json());
        map.insert("ok".into(), serde_json::Value::Bool(self.ok));
        map.insert(
            "stats".into(),
            serde_json::json!({
                "remainingRequests": self.stats.remaining_requests,
                "resetInSeconds": self.stats.reset_in_seconds,
            }),
        );
        if let Some(result) = &self.result {
            map.insert("result".into(), msgpack_to_json(result));
        }
        if let Some(error) = &self.error {
            map.insert("error".into(), serde_json::Value::String(error.clone()));
        }
        serde_json::Value::Object(map)
    }
}
