//! Prepares application value graphs for encoding.
//!
//! [`Serializer::prepare`] is total: it never panics and never recurses
//! without bound. Re-entering a node that is already on the active path
//! yields `nil` for that edge. Shared nodes reached through independent
//! branches are emitted in full each time.

use std::collections::HashSet;

use crate::codec::encode_timestamp;
use crate::value::RpcValue;

/// Default cap on nesting depth. Deeper subtrees are replaced by `nil`.
pub const DEFAULT_MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    max_depth: usize,
}

impl Default for Serializer {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Converts `value` into an encodable MessagePack value.
    pub fn prepare(&self, value: &RpcValue) -> rmpv::Value {
        let mut visiting = HashSet::new();
        self.prepare_inner(value, &mut visiting, 0)
    }

    fn prepare_inner(
        &self,
        value: &RpcValue,
        visiting: &mut HashSet<usize>,
        depth: usize,
    ) -> rmpv::Value {
        if depth > self.max_depth {
            return rmpv::Value::Nil;
        }

        match value {
            RpcValue::Null => rmpv::Value::Nil,
            RpcValue::Bool(b) => rmpv::Value::Boolean(*b),
            RpcValue::Integer(i) => rmpv::Value::from(*i),
            RpcValue::Float(f) => rmpv::Value::F64(*f),
            RpcValue::String(s) => rmpv::Value::from(s.as_str()),
            RpcValue::Timestamp(t) => encode_timestamp(*t),
            RpcValue::Bytes(b) => rmpv::Value::Binary(b.clone()),
            RpcValue::Custom(hook) => {
                let addr = std::sync::Arc::as_ptr(hook) as *const () as usize;
                self.with_node(addr, visiting, |this, visiting| {
                    let replacement = hook.to_serializable();
                    this.prepare_inner(&replacement, visiting, depth + 1)
                })
            }
            RpcValue::Array(arr) => self.with_node(arr.addr(), visiting, |this, visiting| {
                let items = arr.items();
                rmpv::Value::Array(
                    items
                        .iter()
                        .map(|item| this.prepare_inner(item, visiting, depth + 1))
                        .collect(),
                )
            }),
            RpcValue::Object(obj) => self.with_node(obj.addr(), visiting, |this, visiting| {
                let entries = obj.own_enumerable();
                rmpv::Value::Map(
                    entries
                        .iter()
                        .map(|(k, v)| {
                            (
                                rmpv::Value::from(k.as_str()),
                                this.prepare_inner(v, visiting, depth + 1),
                            )
                        })
                        .collect(),
                )
            }),
        }
    }

    /// Runs `f` with `addr` marked as on the active path.
    fn with_node(
        &self,
        addr: usize,
        visiting: &mut HashSet<usize>,
        f: impl FnOnce(&Self, &mut HashSet<usize>) -> rmpv::Value,
    ) -> rmpv::Value {
        if !visiting.insert(addr) {
            return rmpv::Value::Nil;
        }
        let out = f(self, visiting);
        visiting.remove(&addr);
        out
    }
}
