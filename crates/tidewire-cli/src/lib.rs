//! # tidewire CLI
//!
//! Command-line front end for tidewire servers:
//!
//! - `tidewire serve` runs a server with the built-in methods below
//! - `tidewire call` makes one call over HTTP or a stream and prints raw JSON
//! - `tidewire token` prints a fresh handshake token
//! - `tidewire config` prints an example configuration file

use std::sync::{Arc, Weak};
use std::time::Instant;

use tidewire_common::RpcValue;
use tidewire_server::{Context, MethodRegistry};

/// Registers the methods every `tidewire serve` instance exposes:
///
/// - `echo` returns its arguments
/// - `_info` returns the server version, uptime and registered method ids
pub async fn register_builtin_methods(registry: &Arc<MethodRegistry>) {
    registry
        .register("echo", |args: rmpv::Value, _ctx: Context| async move {
            Ok(RpcValue::from(args))
        })
        .await;

    let started = Instant::now();
    let weak: Weak<MethodRegistry> = Arc::downgrade(registry);
    registry
        .register("_info", move |_args: rmpv::Value, _ctx: Context| {
            let weak = weak.clone();
            async move {
                let methods = match weak.upgrade() {
                    Some(registry) => registry.method_ids().await,
                    None => Vec::new(),
                };
                Ok(RpcValue::object([
                    ("version", RpcValue::from(env!("CARGO_PKG_VERSION"))),
                    ("uptimeMs", RpcValue::from(started.elapsed().as_millis() as i64)),
                    (
                        "methods",
                        RpcValue::array(methods.into_iter().map(RpcValue::from).collect()),
                    ),
                ]))
            }
        })
        .await;
}
