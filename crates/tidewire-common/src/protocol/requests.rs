use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::debug;

pub type MethodName = String;
pub type RpcArgs = rmpv::Value;

/// Caller-chosen request id, echoed back on the matching response.
///
/// Numbers keep their wire form: integers above `i64::MAX` stay unsigned
/// and fractional ids stay floats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
}

// Float ids compare by bit pattern so ids can key the pending-call maps.
impl PartialEq for RequestId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RequestId::Number(a), RequestId::Number(b)) => a == b,
            (RequestId::Unsigned(a), RequestId::Unsigned(b)) => a == b,
            (RequestId::Float(a), RequestId::Float(b)) => a.to_bits() == b.to_bits(),
            (RequestId::Text(a), RequestId::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for RequestId {}

impl Hash for RequestId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            RequestId::Number(n) => n.hash(state),
            RequestId::Unsigned(n) => n.hash(state),
            RequestId::Float(f) => f.to_bits().hash(state),
            RequestId::Text(s) => s.hash(state),
        }
    }
}

impl RequestId {
    /// Reads an id out of a decoded value. Strings, integers and finite
    /// floats are accepted.
    pub fn from_value(value: &rmpv::Value) -> Option<Self> {
        match value {
            rmpv::Value::String(s) => s.as_str().map(|s| RequestId::Text(s.to_string())),
            rmpv::Value::Integer(i) => i
                .as_i64()
                .map(RequestId::Number)
                .or_else(|| i.as_u64().map(RequestId::Unsigned)),
            rmpv::Value::F64(f) if f.is_finite() => Some(RequestId::Float(*f)),
            rmpv::Value::F32(f) if f.is_finite() => Some(RequestId::Float(f64::from(*f))),
            _ => None,
        }
    }

    pub fn to_value(&self) -> rmpv::Value {
        match self {
            RequestId::Number(n) => rmpv::Value::from(*n),
            RequestId::Unsigned(n) => rmpv::Value::from(*n),
            RequestId::Float(f) => rmpv::Value::F64(*f),
            RequestId::Text(s) => rmpv::Value::from(s.as_str()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RequestId::Number(n) => serde_json::Value::from(*n),
            RequestId::Unsigned(n) => serde_json::Value::from(*n),
            RequestId::Float(f) => serde_json::Value::from(*f),
            RequestId::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Unsigned(n) => write!(f, "{n}"),
            RequestId::Float(x) => write!(f, "{x}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::Text(s)
    }
}

/// A single remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: MethodName,
    #[serde(default = "nil_args", skip_serializing_if = "rmpv::Value::is_nil")]
    pub args: RpcArgs,
}

fn nil_args() -> RpcArgs {
    rmpv::Value::Nil
}

impl RpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, args: RpcArgs) -> Self {
        RpcRequest {
            id: id.into(),
            method: method.into(),
            args,
        }
    }

    /// Builds the wire map for this request.
    pub fn to_value(&self) -> rmpv::Value {
        let mut entries = vec![
            (rmpv::Value::from("id"), self.id.to_value()),
            (rmpv::Value::from("method"), rmpv::Value::from(self.method.as_str())),
        ];
        if !self.args.is_nil() {
            entries.push((rmpv::Value::from("args"), self.args.clone()));
        }
        rmpv::Value::Map(entries)
    }
}

/// Outcome of parsing one request out of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRequest {
    Valid(RpcRequest),
    /// The item was malformed but carried an id, so the caller can still be
    /// told what went wrong.
    Invalid { id: RequestId, reason: String },
}

impl ParsedRequest {
    pub fn id(&self) -> &RequestId {
        match self {
            ParsedRequest::Valid(req) => &req.id,
            ParsedRequest::Invalid { id, .. } => id,
        }
    }

    /// Parses a single request map. Returns `None` when no id can be
    /// salvaged from the item.
    pub fn from_value(value: &rmpv::Value) -> Option<Self> {
        let entries = value.as_map()?;
        let field = |name: &str| {
            entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(name))
                .map(|(_, v)| v)
        };

        let id = RequestId::from_value(field("id")?)?;

        let method = match field("method") {
            Some(rmpv::Value::String(s)) => match s.as_str() {
                Some(m) if !m.is_empty() => m.to_string(),
                _ => {
                    return Some(ParsedRequest::Invalid {
                        id,
                        reason: "method must be a non-empty string".into(),
                    })
                }
            },
            Some(_) => {
                return Some(ParsedRequest::Invalid {
                    id,
                    reason: "method must be a string".into(),
                })
            }
            None => {
                return Some(ParsedRequest::Invalid {
                    id,
                    reason: "missing method".into(),
                })
            }
        };

        let args = field("args").cloned().unwrap_or(rmpv::Value::Nil);

        Some(ParsedRequest::Valid(RpcRequest { id, method, args }))
    }
}

/// A decoded inbound frame: one request or an ordered batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Single(ParsedRequest),
    Batch(Vec<ParsedRequest>),
}

impl Frame {
    /// Classifies a decoded value as a single request or a batch.
    ///
    /// Items without a salvageable id are dropped. If nothing at all can be
    /// salvaged from a non-empty frame, the frame is a protocol error.
    pub fn from_value(value: &rmpv::Value) -> crate::Result<Self> {
        match value {
            rmpv::Value::Map(_) => ParsedRequest::from_value(value)
                .map(Frame::Single)
                .ok_or_else(|| crate::TidewireError::Protocol("request has no usable id".into())),
            rmpv::Value::Array(items) => {
                let parsed: Vec<ParsedRequest> =
                    items.iter().filter_map(ParsedRequest::from_value).collect();
                let dropped = items.len() - parsed.len();
                if dropped > 0 {
                    debug!("Dropped {} of {} batch items without a usable id", dropped, items.len());
                }
                if parsed.is_empty() && !items.is_empty() {
                    return Err(crate::TidewireError::Protocol(
                        "batch has no usable ids".into(),
                    ));
                }
                Ok(Frame::Batch(parsed))
            }
            _ => Err(crate::TidewireError::Protocol(
                "frame must be a request map or a batch array".into(),
            )),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Frame::Batch(_))
    }

    pub fn ids(&self) -> Vec<RequestId> {
        match self {
            Frame::Single(req) => vec![req.id().clone()],
            Frame::Batch(items) => items.iter().map(|r| r.id().clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Single(_) => 1,
            Frame::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
