//! Wire codecs for tidewire frames.
//!
//! Two encodings are supported on both transports:
//! - **MessagePack** (`application/msgpack`, binary WebSocket frames)
//! - **JSON** (`application/json`, text WebSocket frames)
//!
//! Frames are first decoded into a dynamic [`rmpv::Value`] and then
//! classified, so malformed items inside a batch can still be answered by id.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::{Frame, Result, RpcRequest, RpcResponse, TidewireError};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

/// MessagePack extension type reserved for timestamps.
pub const TIMESTAMP_EXT: i8 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    MessagePack,
}

impl Codec {
    /// Picks a codec from a `Content-Type` header value. Anything that is
    /// not MessagePack is treated as JSON.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) => {
                let essence = ct.split(';').next().unwrap_or("").trim();
                if essence.eq_ignore_ascii_case(CONTENT_TYPE_MSGPACK)
                    || essence.eq_ignore_ascii_case("application/x-msgpack")
                {
                    Codec::MessagePack
                } else {
                    Codec::Json
                }
            }
            None => Codec::Json,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json => CONTENT_TYPE_JSON,
            Codec::MessagePack => CONTENT_TYPE_MSGPACK,
        }
    }

    /// Decodes raw bytes into a dynamic value without interpreting it.
    pub fn decode_value(&self, bytes: &[u8]) -> Result<rmpv::Value> {
        match self {
            Codec::Json => {
                let json: serde_json::Value = serde_json::from_slice(bytes)?;
                Ok(json_to_msgpack(&json))
            }
            Codec::MessagePack => {
                let mut reader = bytes;
                Ok(rmpv::decode::read_value(&mut reader)?)
            }
        }
    }

    /// Decodes an inbound request frame.
    pub fn decode_frame(&self, bytes: &[u8]) -> Result<Frame> {
        let value = self
            .decode_value(bytes)
            .map_err(|e| TidewireError::Protocol(e.to_string()))?;
        Frame::from_value(&value)
    }

    pub fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(&response.to_json())?),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(response)?),
        }
    }

    pub fn encode_batch(&self, responses: &[RpcResponse]) -> Result<Vec<u8>> {
        match self {
            Codec::Json => {
                let items: Vec<serde_json::Value> =
                    responses.iter().map(RpcResponse::to_json).collect();
                Ok(serde_json::to_vec(&items)?)
            }
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(responses)?),
        }
    }

    pub fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(&msgpack_to_json(&request.to_value()))?),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(request)?),
        }
    }

    pub fn encode_batch_request(&self, requests: &[RpcRequest]) -> Result<Vec<u8>> {
        match self {
            Codec::Json => {
                let items: Vec<serde_json::Value> = requests
                    .iter()
                    .map(|r| msgpack_to_json(&r.to_value()))
                    .collect();
                Ok(serde_json::to_vec(&items)?)
            }
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(requests)?),
        }
    }

    /// Decodes a response payload. A single response comes back as a
    /// one-element vector.
    pub fn decode_responses(&self, bytes: &[u8]) -> Result<Vec<RpcResponse>> {
        let value = self.decode_value(bytes)?;
        let items = match value {
            rmpv::Value::Array(items) => items,
            other => vec![other],
        };
        items
            .into_iter()
            .map(|item| {
                rmpv::ext::from_value::<RpcResponse>(item)
                    .map_err(|e| TidewireError::Protocol(format!("malformed response: {e}")))
            })
            .collect()
    }
}

/// Converts a JSON value into the dynamic MessagePack model.
pub fn json_to_msgpack(value: &serde_json::Value) -> rmpv::Value {
    match value {
        serde_json::Value::Null => rmpv::Value::Nil,
        serde_json::Value::Bool(b) => rmpv::Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rmpv::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                rmpv::Value::from(u)
            } else {
                rmpv::Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => rmpv::Value::from(s.as_str()),
        serde_json::Value::Array(items) => {
            rmpv::Value::Array(items.iter().map(json_to_msgpack).collect())
        }
        serde_json::Value::Object(map) => rmpv::Value::Map(
            map.iter()
                .map(|(k, v)| (rmpv::Value::from(k.as_str()), json_to_msgpack(v)))
                .collect(),
        ),
    }
}

/// Converts a MessagePack value into JSON.
///
/// Binary data becomes an array of bytes, timestamps become RFC 3339
/// strings and non-finite floats become `null`.
pub fn msgpack_to_json(value: &rmpv::Value) -> serde_json::Value {
    match value {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(*b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::from(n)
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::from(n)
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => float_to_json(f64::from(*f)),
        rmpv::Value::F64(f) => float_to_json(*f),
        rmpv::Value::String(s) => match s.as_str() {
            Some(s) => serde_json::Value::String(s.to_string()),
            None => serde_json::Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        },
        rmpv::Value::Binary(bytes) => {
            serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
        }
        rmpv::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(msgpack_to_json).collect())
        }
        rmpv::Value::Map(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let key = match k.as_str() {
                    Some(s) => s.to_string(),
                    None => msgpack_to_json(k).to_string(),
                };
                map.insert(key, msgpack_to_json(v));
            }
            serde_json::Value::Object(map)
        }
        rmpv::Value::Ext(tag, data) => {
            if *tag == TIMESTAMP_EXT {
                if let Some(ts) = decode_timestamp(data) {
                    return serde_json::Value::String(
                        humantime::format_rfc3339_millis(ts).to_string(),
                    );
                }
            }
            serde_json::json!({ "type": tag, "data": data })
        }
    }
}

fn float_to_json(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Encodes a point in time as a MessagePack timestamp extension, choosing
/// the 32, 64 or 96 bit layout.
pub fn encode_timestamp(ts: SystemTime) -> rmpv::Value {
    let (secs, nanos): (i64, u32) = match ts.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let before = e.duration();
            let mut secs = -(before.as_secs() as i64);
            let mut nanos = before.subsec_nanos();
            if nanos > 0 {
                secs -= 1;
                nanos = 1_000_000_000 - nanos;
            }
            (secs, nanos)
        }
    };

    let data = if nanos == 0 && (0..=u32::MAX as i64).contains(&secs) {
        (secs as u32).to_be_bytes().to_vec()
    } else if (0..(1i64 << 34)).contains(&secs) {
        let packed = (u64::from(nanos) << 34) | secs as u64;
        packed.to_be_bytes().to_vec()
    } else {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&nanos.to_be_bytes());
        buf.extend_from_slice(&secs.to_be_bytes());
        buf
    };
    rmpv::Value::Ext(TIMESTAMP_EXT, data)
}

/// Decodes the payload of a timestamp extension.
pub fn decode_timestamp(data: &[u8]) -> Option<SystemTime> {
    let (secs, nanos): (i64, u32) = match data.len() {
        4 => (i64::from(u32::from_be_bytes(data.try_into().ok()?)), 0),
        8 => {
            let packed = u64::from_be_bytes(data.try_into().ok()?);
            ((packed & 0x3_ffff_ffff) as i64, (packed >> 34) as u32)
        }
        12 => (
            i64::from_be_bytes(data[4..12].try_into().ok()?),
            u32::from_be_bytes(data[0..4].try_into().ok()?),
        ),
        _ => return None,
    };
    if nanos >= 1_000_000_000 {
        return None;
    }
    if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::new(secs as u64, nanos))
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))?
            .checked_add(Duration::from_nanos(u64::from(nanos)))
    }
}
