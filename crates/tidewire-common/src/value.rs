//! Application value graph returned by handlers.
//!
//! Arrays and objects are shared, interior-mutable nodes, so a graph can
//! contain diamonds and cycles. Use [`crate::serializer::Serializer`] to turn
//! it into an encodable [`rmpv::Value`].

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use crate::codec::{decode_timestamp, TIMESTAMP_EXT};

/// Types that provide their own wire representation.
///
/// When a value carries this capability the serializer calls
/// [`to_serializable`](Serializable::to_serializable) exactly once and
/// encodes only what it returns.
pub trait Serializable: Send + Sync {
    fn to_serializable(&self) -> RpcValue;
}

#[derive(Clone, Default)]
pub enum RpcValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Timestamp(SystemTime),
    Bytes(Vec<u8>),
    Array(ArrayRef),
    Object(ObjectRef),
    Custom(Arc<dyn Serializable>),
}

impl RpcValue {
    pub fn array(items: Vec<RpcValue>) -> Self {
        RpcValue::Array(ArrayRef::new(items))
    }

    /// Builds a plain object whose properties are all own and enumerable.
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, RpcValue)>) -> Self {
        let obj = ObjectRef::new();
        for (k, v) in entries {
            obj.set(k, v);
        }
        RpcValue::Object(obj)
    }

    pub fn custom(value: impl Serializable + 'static) -> Self {
        RpcValue::Custom(Arc::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RpcValue::Null)
    }
}

impl fmt::Debug for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shared nodes are not walked so cyclic graphs stay printable.
        match self {
            RpcValue::Null => f.write_str("Null"),
            RpcValue::Bool(b) => write!(f, "Bool({b})"),
            RpcValue::Integer(i) => write!(f, "Integer({i})"),
            RpcValue::Float(x) => write!(f, "Float({x})"),
            RpcValue::String(s) => write!(f, "String({s:?})"),
            RpcValue::Timestamp(t) => write!(f, "Timestamp({t:?})"),
            RpcValue::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            RpcValue::Array(a) => write!(f, "Array({:p})", Arc::as_ptr(&a.0)),
            RpcValue::Object(o) => write!(f, "Object({:p})", Arc::as_ptr(&o.0)),
            RpcValue::Custom(c) => write!(f, "Custom({:p})", Arc::as_ptr(c)),
        }
    }
}

/// Shared, mutable array node.
#[derive(Clone, Default)]
pub struct ArrayRef(Arc<RwLock<Vec<RpcValue>>>);

impl ArrayRef {
    pub fn new(items: Vec<RpcValue>) -> Self {
        ArrayRef(Arc::new(RwLock::new(items)))
    }

    pub fn push(&self, value: RpcValue) {
        self.write().push(value);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current elements.
    pub fn items(&self) -> Vec<RpcValue> {
        self.read().clone()
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<RpcValue>> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<RpcValue>> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct Property {
    pub key: String,
    pub value: RpcValue,
    pub enumerable: bool,
}

#[derive(Default)]
pub struct ObjectData {
    pub properties: Vec<Property>,
    pub prototype: Option<ObjectRef>,
}

/// Shared, mutable key-value node with an optional prototype.
///
/// Only own enumerable properties are ever serialized. Prototype fields
/// and hidden properties stay on the server.
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<RwLock<ObjectData>>);

impl ObjectRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prototype(prototype: ObjectRef) -> Self {
        let obj = Self::new();
        obj.write().prototype = Some(prototype);
        obj
    }

    /// Sets an own enumerable property, replacing any existing value.
    pub fn set(&self, key: impl Into<String>, value: RpcValue) {
        self.define(key.into(), value, true);
    }

    /// Sets an own property that is skipped during serialization.
    pub fn set_hidden(&self, key: impl Into<String>, value: RpcValue) {
        self.define(key.into(), value, false);
    }

    fn define(&self, key: String, value: RpcValue, enumerable: bool) {
        let mut data = self.write();
        match data.properties.iter_mut().find(|p| p.key == key) {
            Some(prop) => {
                prop.value = value;
                prop.enumerable = enumerable;
            }
            None => data.properties.push(Property {
                key,
                value,
                enumerable,
            }),
        }
    }

    /// Looks up a property on the object or along its prototype chain.
    pub fn get(&self, key: &str) -> Option<RpcValue> {
        let data = self.read();
        if let Some(prop) = data.properties.iter().find(|p| p.key == key) {
            return Some(prop.value.clone());
        }
        let proto = data.prototype.clone();
        drop(data);
        proto.and_then(|p| p.get(key))
    }

    /// Own enumerable properties, in insertion order.
    pub fn own_enumerable(&self) -> Vec<(String, RpcValue)> {
        self.read()
            .properties
            .iter()
            .filter(|p| p.enumerable)
            .map(|p| (p.key.clone(), p.value.clone()))
            .collect()
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    fn read(&self) -> RwLockReadGuard<'_, ObjectData> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ObjectData> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl From<bool> for RpcValue {
    fn from(b: bool) -> Self {
        RpcValue::Bool(b)
    }
}

impl From<i32> for RpcValue {
    fn from(i: i32) -> Self {
        RpcValue::Integer(i64::from(i))
    }
}

impl From<i64> for RpcValue {
    fn from(i: i64) -> Self {
        RpcValue::Integer(i)
    }
}

impl From<u32> for RpcValue {
    fn from(i: u32) -> Self {
        RpcValue::Integer(i64::from(i))
    }
}

impl From<f64> for RpcValue {
    fn from(f: f64) -> Self {
        RpcValue::Float(f)
    }
}

impl From<&str> for RpcValue {
    fn from(s: &str) -> Self {
        RpcValue::String(s.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(s: String) -> Self {
        RpcValue::String(s)
    }
}

impl From<SystemTime> for RpcValue {
    fn from(t: SystemTime) -> Self {
        RpcValue::Timestamp(t)
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(b: Vec<u8>) -> Self {
        RpcValue::Bytes(b)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(items: Vec<RpcValue>) -> Self {
        RpcValue::array(items)
    }
}

impl<T: Into<RpcValue>> From<Option<T>> for RpcValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(RpcValue::Null)
    }
}

impl From<serde_json::Value> for RpcValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RpcValue::Null,
            serde_json::Value::Bool(b) => RpcValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => RpcValue::Integer(i),
                None => RpcValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => RpcValue::String(s),
            serde_json::Value::Array(items) => {
                RpcValue::array(items.into_iter().map(RpcValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                RpcValue::object(map.into_iter().map(|(k, v)| (k, RpcValue::from(v))))
            }
        }
    }
}

impl From<rmpv::Value> for RpcValue {
    fn from(value: rmpv::Value) -> Self {
        match value {
            rmpv::Value::Nil => RpcValue::Null,
            rmpv::Value::Boolean(b) => RpcValue::Bool(b),
            rmpv::Value::Integer(i) => match i.as_i64() {
                Some(n) => RpcValue::Integer(n),
                // Only u64 values above i64::MAX land here.
                None => RpcValue::Float(i.as_f64().unwrap_or(f64::NAN)),
            },
            rmpv::Value::F32(f) => RpcValue::Float(f64::from(f)),
            rmpv::Value::F64(f) => RpcValue::Float(f),
            rmpv::Value::String(s) => match s.into_str() {
                Some(s) => RpcValue::String(s),
                None => RpcValue::Null,
            },
            rmpv::Value::Binary(b) => RpcValue::Bytes(b),
            rmpv::Value::Array(items) => {
                RpcValue::array(items.into_iter().map(RpcValue::from).collect())
            }
            rmpv::Value::Map(entries) => RpcValue::object(entries.into_iter().map(|(k, v)| {
                let key = match k {
                    rmpv::Value::String(s) => s.into_str().unwrap_or_default(),
                    other => other.to_string(),
                };
                (key, RpcValue::from(v))
            })),
            rmpv::Value::Ext(tag, data) => {
                if tag == TIMESTAMP_EXT {
                    if let Some(ts) = decode_timestamp(&data) {
                        return RpcValue::Timestamp(ts);
                    }
                }
                RpcValue::Bytes(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_set_replaces_in_place() {
        let obj = ObjectRef::new();
        obj.set("a", 1.into());
        obj.set("b", 2.into());
        obj.set("a", 3.into());
        let keys: Vec<String> = obj.own_enumerable().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(matches!(obj.get("a"), Some(RpcValue::Integer(3))));
    }

    #[test]
    fn test_hidden_and_inherited_properties() {
        let proto = ObjectRef::new();
        proto.set("inherited", true.into());

        let obj = ObjectRef::with_prototype(proto);
        obj.set("own", "yes".into());
        obj.set_hidden("secret", "no".into());

        assert!(obj.get("inherited").is_some());
        assert!(obj.get("secret").is_some());
        let own: Vec<String> = obj.own_enumerable().into_iter().map(|(k, _)| k).collect();
        assert_eq!(own, vec!["own"]);
    }

    #[test]
    fn test_from_json() {
        let value = RpcValue::from(serde_json::json!({"n": 1, "f": 1.5, "list": [null, "s"]}));
        let RpcValue::Object(obj) = value else {
            panic!("expected object");
        };
        assert!(matches!(obj.get("n"), Some(RpcValue::Integer(1))));
        assert!(matches!(obj.get("f"), Some(RpcValue::Float(f)) if f == 1.5));
        match obj.get("list") {
            Some(RpcValue::Array(items)) => assert_eq!(items.len(), 2),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_from_msgpack_binary_and_timestamp() {
        let ts = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(42);
        assert!(matches!(
            RpcValue::from(crate::codec::encode_timestamp(ts)),
            RpcValue::Timestamp(t) if t == ts
        ));
        assert!(matches!(
            RpcValue::from(rmpv::Value::Binary(vec![1, 2, 3])),
            RpcValue::Bytes(b) if b == vec![1, 2, 3]
        ));
    }

    #[test]
    fn test_debug_does_not_walk_cycles() {
        let arr = ArrayRef::new(vec![]);
        arr.push(RpcValue::Array(arr.clone()));
        let rendered = format!("{:?}", RpcValue::Array(arr));
        assert!(rendered.starts_with("Array("));
    }
}
